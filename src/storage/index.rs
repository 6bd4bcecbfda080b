//! Durable index: objnum -> file location and name -> objnum.
//!
//! Both mappings share one keyspace, partitioned by a type byte in front of
//! each key. Keys and values use the serializer's integer/string encodings.
//! Name lookups go through a small direct-mapped write-back [`NameCache`].
//!
//! One coarse lock guards every operation. Lookups and updates report failure
//! softly (`Option`/`bool`, with a warning logged); only opening and syncing
//! return errors.

pub mod engine;
pub mod name_cache;

use crate::codec::varint::{read_long, write_long};
use crate::object::Objnum;
use crate::storage::bitmap::BLOCK_SIZE;
use crate::storage::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::path::Path;

pub use engine::{KvEngine, LogKv, MemoryKv};
pub use name_cache::NameCache;

const OBJNUM_PREFIX: u8 = b'o';
const NAME_PREFIX: u8 = b'n';

/// Where a record lives in the objects file. `size` is the byte length of
/// the reserved extent, which may exceed the current encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub offset: u64,
    pub size: usize,
}

impl Location {
    pub fn new(block: usize, size: usize) -> Self {
        Self {
            offset: block as u64 * BLOCK_SIZE as u64,
            size,
        }
    }

    pub fn block(&self) -> usize {
        (self.offset / BLOCK_SIZE as u64) as usize
    }
}

fn objnum_key(objnum: Objnum) -> Vec<u8> {
    let mut key = vec![OBJNUM_PREFIX];
    write_long(&mut key, objnum);
    key
}

fn name_key(name: &str) -> Vec<u8> {
    let mut key = vec![NAME_PREFIX];
    key.extend_from_slice(name.as_bytes());
    key
}

fn encode_location(loc: Location) -> Vec<u8> {
    let mut value = Vec::new();
    write_long(&mut value, loc.offset as i64);
    write_long(&mut value, loc.size as i64);
    value
}

fn decode_location(mut value: &[u8]) -> StoreResult<Location> {
    let offset = read_long(&mut value)?;
    let size = read_long(&mut value)?;
    if offset < 0 || size < 0 || offset as u64 % BLOCK_SIZE as u64 != 0 {
        return Err(StoreError::Corrupt(format!(
            "bad index location offset={} size={}",
            offset, size
        )));
    }
    Ok(Location {
        offset: offset as u64,
        size: size as usize,
    })
}

fn decode_objnum_entry(key: &[u8], value: &[u8]) -> StoreResult<(Objnum, Location)> {
    let mut rest = key
        .strip_prefix(&[OBJNUM_PREFIX])
        .ok_or_else(|| StoreError::Corrupt("objnum key without prefix".to_string()))?;
    let objnum = read_long(&mut rest)?;
    Ok((objnum, decode_location(value)?))
}

fn encode_objnum(objnum: Objnum) -> Vec<u8> {
    let mut value = Vec::new();
    write_long(&mut value, objnum);
    value
}

fn soft<T>(op: &str, result: StoreResult<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("index {} failed: {}", op, e);
            None
        }
    }
}

struct IndexInner {
    engine: Box<dyn KvEngine>,
    names: NameCache,
}

impl IndexInner {
    fn write_name(&mut self, name: &str, objnum: Objnum) -> StoreResult<()> {
        self.engine.put(&name_key(name), &encode_objnum(objnum))
    }

    /// Install a name in the cache. A dirty entry sharing its slot is written
    /// out first; if that fails the cache is left untouched.
    fn cache_name(&mut self, name: &str, objnum: Objnum, dirty: bool) -> StoreResult<()> {
        if let Some((rival, rival_objnum)) = self.names.dirty_rival(name) {
            self.write_name(&rival, rival_objnum)?;
            self.names.mark_clean(&rival, rival_objnum);
        }
        self.names.insert(name, objnum, dirty);
        Ok(())
    }

    fn flush_names(&mut self) -> StoreResult<()> {
        for (name, objnum) in self.names.dirty_entries() {
            self.write_name(&name, objnum)?;
            self.names.mark_clean(&name, objnum);
        }
        Ok(())
    }

    fn lookup_name(&mut self, name: &str) -> Option<Objnum> {
        if let Some(objnum) = self.names.lookup(name) {
            return Some(objnum);
        }
        let value = soft("get_name", self.engine.get(&name_key(name)))??;
        let objnum = soft("get_name", read_long(&mut value.as_slice()))?;
        soft("get_name", self.cache_name(name, objnum, false));
        Some(objnum)
    }

    fn drop_name(&mut self, name: &str) -> bool {
        let cached = self.names.remove(name);
        let stored = soft("remove_name", self.engine.remove(&name_key(name))).unwrap_or(false);
        cached || stored
    }
}

pub struct Index {
    inner: Mutex<IndexInner>,
}

impl Index {
    /// Open (or create) the on-disk index at `path`.
    pub fn open(path: &Path, name_cache_size: usize, sync_writes: bool) -> StoreResult<Self> {
        let engine = LogKv::open(path, sync_writes)?;
        log::info!("index opened at {:?} ({} keys)", path, engine.len());
        Ok(Self::with_engine(Box::new(engine), name_cache_size))
    }

    pub fn in_memory(name_cache_size: usize) -> Self {
        Self::with_engine(Box::new(MemoryKv::new()), name_cache_size)
    }

    pub fn with_engine(engine: Box<dyn KvEngine>, name_cache_size: usize) -> Self {
        Self {
            inner: Mutex::new(IndexInner {
                engine,
                names: NameCache::new(name_cache_size),
            }),
        }
    }

    pub fn get(&self, objnum: Objnum) -> Option<Location> {
        let inner = self.inner.lock();
        let value = soft("get", inner.engine.get(&objnum_key(objnum)))??;
        soft("get", decode_location(&value))
    }

    pub fn contains(&self, objnum: Objnum) -> bool {
        self.get(objnum).is_some()
    }

    pub fn put(&self, objnum: Objnum, loc: Location) -> bool {
        let mut inner = self.inner.lock();
        soft("put", inner.engine.put(&objnum_key(objnum), &encode_location(loc))).is_some()
    }

    pub fn remove(&self, objnum: Objnum) -> bool {
        let mut inner = self.inner.lock();
        soft("remove", inner.engine.remove(&objnum_key(objnum))).unwrap_or(false)
    }

    /// First objnum entry in key order. Used for full scans at startup, so a
    /// malformed entry is an error rather than a soft miss.
    pub fn first(&self) -> StoreResult<Option<(Objnum, Location)>> {
        let inner = self.inner.lock();
        match inner.engine.next_with_prefix(&[OBJNUM_PREFIX], None) {
            Some((key, value)) => decode_objnum_entry(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    /// Entry following `after` in key order.
    pub fn next(&self, after: Objnum) -> StoreResult<Option<(Objnum, Location)>> {
        let inner = self.inner.lock();
        let key = objnum_key(after);
        match inner.engine.next_with_prefix(&[OBJNUM_PREFIX], Some(&key)) {
            Some((key, value)) => decode_objnum_entry(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_name(&self, name: &str) -> Option<Objnum> {
        self.inner.lock().lookup_name(name)
    }

    pub fn put_name(&self, name: &str, objnum: Objnum) -> bool {
        let mut inner = self.inner.lock();
        soft("put_name", inner.cache_name(name, objnum, true)).is_some()
    }

    pub fn remove_name(&self, name: &str) -> bool {
        self.inner.lock().drop_name(name)
    }

    /// Remove `name` only while it still maps to `objnum`. A record giving up
    /// its name must not take the entry from a newer owner.
    pub fn release_name(&self, name: &str, objnum: Objnum) -> bool {
        let mut inner = self.inner.lock();
        if inner.lookup_name(name) != Some(objnum) {
            return false;
        }
        inner.drop_name(name)
    }

    /// All names, sorted. Pending name writes are flushed first.
    pub fn names(&self) -> StoreResult<Vec<(String, Objnum)>> {
        let mut inner = self.inner.lock();
        inner.flush_names()?;
        let mut names = Vec::new();
        let mut after: Option<Vec<u8>> = None;
        while let Some((key, value)) = inner.engine.next_with_prefix(&[NAME_PREFIX], after.as_deref()) {
            let name = String::from_utf8(key[1..].to_vec())
                .map_err(|e| StoreError::Corrupt(format!("bad name key: {}", e)))?;
            names.push((name, read_long(&mut value.as_slice())?));
            after = Some(key);
        }
        Ok(names)
    }

    /// Number of objnum entries.
    pub fn record_count(&self) -> StoreResult<usize> {
        let mut count = 0;
        let mut cursor = self.first()?;
        while let Some((objnum, _)) = cursor {
            count += 1;
            cursor = self.next(objnum)?;
        }
        Ok(count)
    }

    pub fn sync(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.flush_names()?;
        inner.engine.flush()
    }

    /// Write a compact copy of the index to `path`, including pending names.
    pub fn export(&self, path: &Path) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.flush_names()?;
        inner.engine.export(path)
    }
}
