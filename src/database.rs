use crate::config::StoreConfig;
use crate::object::{ObjectRecord, Objnum};
use crate::storage::cache::{CacheStats, DestroyHook, ObjRef, ObjectCache, Writer};
use crate::storage::checkpoint::CheckpointStatus;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::file_store::FileStore;
use crate::storage::index::Index;
use crate::storage::marker::Marker;
use crate::value::InstanceRegistry;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An open object store: index, objects file and cache wired together.
///
/// The runtime calls `retrieve`/`grab`/`discard`/`check`/`sync` and the
/// `new_record`/`destroy_record` lifecycle hooks. Closing writes every dirty
/// record and leaves a clean-shutdown marker behind.
pub struct Database {
    config: StoreConfig,
    cache: ObjectCache,
    index: Arc<Index>,
    writer: Option<Writer>,
    search_stamp: AtomicU64,
    clean: bool,
    closed: bool,
}

impl Database {
    /// Open (or create) the store in `config.dir` with no instance kinds.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        Self::open_with_registry(config, InstanceRegistry::new())
    }

    pub fn open_with_registry(config: StoreConfig, registry: InstanceRegistry) -> StoreResult<Self> {
        fs::create_dir_all(&config.dir)?;
        let fresh = !config.objects_path().exists();

        let marker_path = config.marker_path();
        let (clean, stamp) = match Marker::read(&marker_path)? {
            Some(marker) if marker.is_compatible() => (true, marker.search_stamp),
            Some(marker) => {
                log::warn!(
                    "marker from version {:?} (magic {:#x}) does not match; store may be inconsistent",
                    marker.version,
                    marker.magic
                );
                (false, 0)
            }
            None if fresh => (true, 0),
            None => {
                log::warn!(
                    "{:?} was not shut down cleanly; store may be inconsistent",
                    config.dir
                );
                (false, 0)
            }
        };

        let index = Arc::new(Index::open(
            &config.index_path(),
            config.name_cache_size,
            config.sync_index_writes,
        )?);
        let store = FileStore::open(&config.objects_path(), index.clone(), Arc::new(registry))?;
        // gone until close, so a crash leaves the store marked unclean
        Marker::remove(&marker_path)?;

        let cache = ObjectCache::new(store, config.cache_width, config.cache_depth);
        let writer = match config.writer_interval {
            Some(interval) => Some(Writer::spawn(cache.clone(), interval)?),
            None => None,
        };

        log::info!(
            "store opened at {:?} ({})",
            config.dir,
            if clean { "clean" } else { "unclean" }
        );

        Ok(Self {
            config,
            cache,
            index,
            writer,
            search_stamp: AtomicU64::new(stamp),
            clean,
            closed: false,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether the previous run left a valid clean-shutdown marker.
    pub fn was_clean(&self) -> bool {
        self.clean
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn retrieve(&self, objnum: Objnum) -> StoreResult<Option<ObjRef>> {
        self.cache.retrieve(objnum)
    }

    pub fn grab(&self, obj: &ObjRef) -> ObjRef {
        obj.grab()
    }

    pub fn discard(&self, obj: ObjRef) -> StoreResult<()> {
        obj.discard()
    }

    pub fn mark_dirty(&self, obj: &ObjRef) {
        self.cache.mark_dirty(obj);
    }

    pub fn check(&self, objnum: Objnum) -> bool {
        self.cache.check(objnum)
    }

    pub fn sync(&self) -> StoreResult<()> {
        self.cache.sync()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Create a record under `parents`. With `objnum` of `None` the next
    /// number after the highest in use is taken. Each parent gains the new
    /// record as a child.
    pub fn new_record(&self, objnum: Option<Objnum>, parents: &[Objnum]) -> StoreResult<ObjRef> {
        let objnum = match objnum {
            Some(objnum) => objnum,
            None => self.cache.with_store(|s| s.next_objnum()),
        };
        if self.cache.check(objnum) {
            return Err(StoreError::ObjnumInUse(objnum));
        }

        let mut parent_refs = Vec::with_capacity(parents.len());
        for &parent in parents {
            let parent_ref = self
                .retrieve(parent)?
                .ok_or(StoreError::ObjectNotFound(parent))?;
            parent_refs.push(parent_ref);
        }

        let mut record_parents = Vec::with_capacity(parents.len());
        for &parent in parents {
            if !record_parents.contains(&parent) {
                record_parents.push(parent);
            }
        }
        let obj = self.cache.insert_new(ObjectRecord::new(objnum, record_parents))?;

        for parent in parent_refs {
            parent.write().add_child(objnum);
            self.cache.mark_dirty(&parent);
            parent.discard()?;
        }
        log::debug!("created #{} under {:?}", objnum, parents);
        Ok(obj)
    }

    /// Mark a record dead and unhook it from the object graph: its parents
    /// drop it and adopt its children. The record itself goes away when the
    /// last reference is discarded.
    pub fn destroy_record(&self, obj: &ObjRef) -> StoreResult<()> {
        let (objnum, parents, children, name) = {
            let mut record = obj.write();
            if record.is_dead() {
                return Ok(());
            }
            record.mark_dead();
            (
                record.objnum,
                record.parents.clone(),
                record.children.clone(),
                record.name.take(),
            )
        };
        if let Some(name) = name {
            self.index.release_name(&name, objnum);
        }

        for &parent in &parents {
            let Some(parent_ref) = self.retrieve(parent)? else {
                continue;
            };
            {
                let mut record = parent_ref.write();
                record.remove_child(objnum);
                for &child in &children {
                    record.add_child(child);
                }
            }
            self.cache.mark_dirty(&parent_ref);
            parent_ref.discard()?;
        }

        for &child in &children {
            let Some(child_ref) = self.retrieve(child)? else {
                continue;
            };
            child_ref.write().replace_parent(objnum, &parents);
            self.cache.mark_dirty(&child_ref);
            child_ref.discard()?;
        }
        log::debug!("#{} marked for destruction", objnum);
        Ok(())
    }

    /// Give `obj` the symbolic name `name`, replacing any name it had.
    /// Returns `false` if another live record holds the name or the index
    /// rejected it.
    pub fn set_name(&self, obj: &ObjRef, name: &str) -> bool {
        let objnum = obj.objnum();
        if let Some(owner) = self.index.get_name(name) {
            if owner != objnum && self.check(owner) {
                return false;
            }
        }
        if !self.index.put_name(name, objnum) {
            return false;
        }

        let old = obj.write().name.replace(name.to_string());
        if let Some(old) = old.filter(|old| old != name) {
            self.index.release_name(&old, objnum);
        }
        self.cache.mark_dirty(obj);
        true
    }

    pub fn lookup_name(&self, name: &str) -> Option<Objnum> {
        self.index.get_name(name)
    }

    /// Drop the symbolic name of `obj`. Returns `false` if it had none.
    pub fn remove_name(&self, obj: &ObjRef) -> bool {
        let Some(name) = obj.write().name.take() else {
            return false;
        };
        self.index.release_name(&name, obj.objnum());
        self.cache.mark_dirty(obj);
        true
    }

    /// All symbolic names, sorted.
    pub fn names(&self) -> StoreResult<Vec<(String, Objnum)>> {
        self.index.names()
    }

    /// A stamp no traversal has used yet; see [`ObjectRecord::visit`].
    pub fn next_search_stamp(&self) -> u64 {
        self.search_stamp.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Number of records in the objects file. Records created since the
    /// last write-back are not counted.
    pub fn record_count(&self) -> StoreResult<usize> {
        self.index.record_count()
    }

    pub fn set_destroy_hook(&self, hook: DestroyHook) {
        self.cache.set_destroy_hook(hook);
    }

    /// Start a dump to `path`. Dirty records are written first so the dump
    /// reflects the store as the runtime sees it now.
    pub fn checkpoint_start(&self, path: &Path) -> StoreResult<()> {
        self.sync()?;
        self.cache.with_store(|s| s.checkpoint_start(path))
    }

    pub fn checkpoint_step(&self, max_blocks: usize) -> StoreResult<CheckpointStatus> {
        self.cache.with_store(|s| s.checkpoint_step(max_blocks))
    }

    /// Nudge the background writer, if there is one.
    pub fn wake_writer(&self) {
        if let Some(writer) = &self.writer {
            writer.wake();
        }
    }

    /// Stop the writer, write everything out and leave the clean marker.
    pub fn close(&mut self) -> StoreResult<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(mut writer) = self.writer.take() {
            writer.stop();
        }
        self.cache.sync()?;
        Marker::current(self.search_stamp.load(Ordering::SeqCst)).write(&self.config.marker_path())?;
        self.closed = true;
        log::info!("store at {:?} closed", self.config.dir);
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Best effort close on drop
        if let Err(e) = self.close() {
            log::error!("closing store at {:?} failed: {}", self.config.dir, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use anyhow::Result;
    use tempfile::tempdir;

    fn config(dir: &Path) -> StoreConfig {
        StoreConfig {
            cache_width: 3,
            cache_depth: 2,
            name_cache_size: 5,
            sync_index_writes: false,
            ..StoreConfig::new(dir)
        }
    }

    #[test]
    fn test_new_record_links_parent() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(config(dir.path()))?;
        let root = db.new_record(Some(1), &[])?;
        let child = db.new_record(None, &[1])?;
        assert_eq!(child.objnum(), 2);
        assert_eq!(child.read().parents, vec![1]);
        assert_eq!(root.read().children, vec![2]);
        assert!(db.check(2));
        Ok(())
    }

    #[test]
    fn test_new_record_rejects_bad_input() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(config(dir.path()))?;
        db.new_record(Some(1), &[])?.discard()?;
        assert!(matches!(
            db.new_record(Some(1), &[]),
            Err(StoreError::ObjnumInUse(1))
        ));
        assert!(matches!(
            db.new_record(Some(2), &[77]),
            Err(StoreError::ObjectNotFound(77))
        ));
        assert!(!db.check(2));
        Ok(())
    }

    #[test]
    fn test_destroy_reparents_children() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(config(dir.path()))?;
        db.new_record(Some(1), &[])?.discard()?;
        let middle = db.new_record(Some(2), &[1])?;
        db.new_record(Some(3), &[2])?.discard()?;
        assert!(db.set_name(&middle, "middle"));

        db.destroy_record(&middle)?;
        assert!(!db.check(2));
        assert_eq!(db.lookup_name("middle"), None);
        middle.discard()?;

        let root = db.retrieve(1)?.unwrap();
        assert_eq!(root.read().children, vec![3]);
        let leaf = db.retrieve(3)?.unwrap();
        assert_eq!(leaf.read().parents, vec![1]);
        assert!(db.retrieve(2)?.is_none());
        Ok(())
    }

    #[test]
    fn test_names() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(config(dir.path()))?;
        let a = db.new_record(Some(1), &[])?;
        let b = db.new_record(Some(2), &[])?;

        assert!(db.set_name(&a, "sys"));
        assert!(!db.set_name(&b, "sys"));
        assert!(db.set_name(&a, "root"));
        assert_eq!(db.lookup_name("sys"), None);
        assert_eq!(db.lookup_name("root"), Some(1));
        assert_eq!(a.read().name.as_deref(), Some("root"));

        assert!(db.remove_name(&a));
        assert!(!db.remove_name(&a));
        assert_eq!(db.lookup_name("root"), None);
        Ok(())
    }

    #[test]
    fn test_disposing_old_owner_keeps_taken_name() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(config(dir.path()))?;
        let a = db.new_record(Some(1), &[])?;
        let b = db.new_record(Some(2), &[])?;
        assert!(db.set_name(&a, "sys"));

        // #1 is dead but still referenced, so its name is up for grabs
        a.write().mark_dead();
        assert!(db.set_name(&b, "sys"));
        a.discard()?;
        assert_eq!(db.lookup_name("sys"), Some(2));
        assert_eq!(b.read().name.as_deref(), Some("sys"));

        // renaming #2 still drops the entry it owns
        assert!(db.set_name(&b, "root"));
        assert_eq!(db.lookup_name("sys"), None);
        Ok(())
    }

    #[test]
    fn test_search_stamps_survive_close() -> Result<()> {
        let dir = tempdir()?;
        {
            let db = Database::open(config(dir.path()))?;
            assert_eq!(db.next_search_stamp(), 1);
            assert_eq!(db.next_search_stamp(), 2);
        }
        let db = Database::open(config(dir.path()))?;
        assert!(db.was_clean());
        assert_eq!(db.next_search_stamp(), 3);
        Ok(())
    }

    #[test]
    fn test_close_persists_dirty_records() -> Result<()> {
        let dir = tempdir()?;
        {
            let mut db = Database::open(config(dir.path()))?;
            let obj = db.new_record(Some(10), &[])?;
            obj.write().set_var(10, "motd", Value::String("hello".into()));
            db.mark_dirty(&obj);
            obj.discard()?;
            db.close()?;
        }
        let db = Database::open(config(dir.path()))?;
        let obj = db.retrieve(10)?.unwrap();
        assert_eq!(
            obj.read().get_var(10, "motd"),
            Some(&Value::String("hello".into()))
        );
        assert_eq!(db.record_count()?, 1);
        Ok(())
    }
}
