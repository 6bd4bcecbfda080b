use anyhow::Result;
use objdb::config::StoreConfig;
use objdb::database::Database;
use objdb::storage::error::{StoreError, StoreResult};
use objdb::storage::file_store::dump_index_path;
use objdb::storage::{CheckpointStatus, Residency};
use objdb::value::{Dict, Instance, InstanceKind, InstanceRegistry, InstanceValue, Value};
use std::any::Any;
use std::cmp::Ordering;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn small_config(dir: &Path) -> StoreConfig {
    StoreConfig {
        cache_width: 2,
        cache_depth: 2,
        name_cache_size: 11,
        sync_index_writes: false,
        ..StoreConfig::new(dir)
    }
}

fn create(db: &Database, objnum: i64) -> Result<()> {
    db.new_record(Some(objnum), &[])?.discard()?;
    Ok(())
}

/// Set the `text` variable of `objnum`, if the record still exists.
fn set_text(db: &Database, objnum: i64, text: &str) -> Result<()> {
    let Some(obj) = db.retrieve(objnum)? else {
        return Ok(());
    };
    obj.write().set_var(objnum, "text", Value::String(text.to_string()));
    db.mark_dirty(&obj);
    obj.discard()?;
    Ok(())
}

fn text_of(db: &Database, objnum: i64) -> Result<Option<Value>> {
    let Some(obj) = db.retrieve(objnum)? else {
        return Ok(None);
    };
    let text = obj.read().get_var(objnum, "text").cloned();
    obj.discard()?;
    Ok(text)
}

#[test]
fn test_first_fit_reuse_after_delete() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(small_config(dir.path()))?;

    let obj = db.new_record(Some(5), &[])?;
    db.sync()?;
    let loc = db.cache().with_store(|s| s.index().get(5)).expect("indexed");
    assert_eq!(loc.block(), 0);
    assert!(db.check(5));
    let stored = db.cache().with_store(|s| s.get(5))?.expect("stored");
    assert_eq!(stored, *obj.read());

    db.destroy_record(&obj)?;
    obj.discard()?;
    assert!(!db.check(5));
    db.cache().with_store(|s| {
        assert!(!s.check(5));
        assert!(!s.bitmap().is_set(0));
        assert_eq!(s.allocate(10), 0);
    });
    Ok(())
}

#[test]
fn test_eviction_writes_dirty_record() -> Result<()> {
    let dir = tempdir()?;
    let config = StoreConfig {
        cache_width: 1,
        cache_depth: 3,
        ..small_config(dir.path())
    };
    let db = Database::open(config)?;
    for objnum in 1..=3 {
        create(&db, objnum)?;
    }
    db.sync()?;

    // #1 is touched last, then #2 and #3 again, leaving #1 at the tail
    set_text(&db, 1, "changed")?;
    for objnum in [2, 3] {
        db.retrieve(objnum)?.expect("cached").discard()?;
    }
    assert_eq!(db.cache().residency(1), Some(Residency::Inactive));

    create(&db, 4)?;
    assert_eq!(db.cache().residency(1), None);
    let stored = db.cache().with_store(|s| s.get(1))?.expect("stored");
    assert_eq!(
        stored.get_var(1, "text"),
        Some(&Value::String("changed".into()))
    );
    assert_eq!(text_of(&db, 1)?, Some(Value::String("changed".into())));
    db.cache().verify()?;
    Ok(())
}

#[test]
fn test_dump_is_an_openable_store() -> Result<()> {
    let dir = tempdir()?;
    let live = dir.path().join("live");
    let dump = dir.path().join("dump");
    let restored = dir.path().join("restored");

    let db = Database::open(small_config(&live))?;
    for objnum in 0..40 {
        create(&db, objnum)?;
        set_text(&db, objnum, &format!("v1-{}", "x".repeat(objnum as usize * 20)))?;
    }
    let root = db.retrieve(0)?.expect("root");
    assert!(db.set_name(&root, "root"));
    root.discard()?;

    db.checkpoint_start(&dump)?;
    assert!(matches!(
        db.checkpoint_start(&dump),
        Err(StoreError::CheckpointInProgress)
    ));
    let mut round = 0;
    while db.checkpoint_step(4)? == CheckpointStatus::InProgress {
        set_text(&db, round % 40, "v2")?;
        set_text(&db, 39 - round % 40, &"y".repeat(1500))?;
        if let Some(obj) = db.retrieve(100 + round)? {
            obj.discard()?;
        } else {
            create(&db, 100 + round)?;
        }
        if round % 5 == 0 {
            if let Some(obj) = db.retrieve(round % 40)? {
                db.destroy_record(&obj)?;
                obj.discard()?;
            }
        }
        db.sync()?;
        round += 1;
    }
    assert!(round > 0);
    assert_eq!(db.checkpoint_step(4)?, CheckpointStatus::NotRunning);

    fs::create_dir_all(&restored)?;
    fs::copy(&dump, restored.join("objects"))?;
    fs::copy(dump_index_path(&dump), restored.join("index"))?;
    let copy = Database::open(small_config(&restored))?;
    assert_eq!(copy.record_count()?, 40);
    for objnum in 0..40 {
        assert_eq!(
            text_of(&copy, objnum)?,
            Some(Value::String(format!("v1-{}", "x".repeat(objnum as usize * 20)))),
            "#{}",
            objnum
        );
    }
    assert_eq!(copy.lookup_name("root"), Some(0));
    assert!(!copy.check(100));
    Ok(())
}

#[test]
fn test_marker_tracks_clean_shutdown() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Database::open(small_config(dir.path()))?;
        assert!(db.was_clean());
        create(&db, 1)?;
    }
    {
        let db = Database::open(small_config(dir.path()))?;
        assert!(db.was_clean());
        assert!(!dir.path().join("clean").exists());
        create(&db, 2)?;
        db.sync()?;
        // simulate a crash: no close, no marker
        std::mem::forget(db);
    }
    let db = Database::open(small_config(dir.path()))?;
    assert!(!db.was_clean());
    assert!(db.check(1));
    assert!(db.check(2));
    Ok(())
}

#[test]
fn test_background_writer_flushes() -> Result<()> {
    let dir = tempdir()?;
    let config = StoreConfig {
        writer_interval: Some(Duration::from_millis(10)),
        ..small_config(dir.path())
    };
    let mut db = Database::open(config)?;
    for objnum in 0..6 {
        create(&db, objnum)?;
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while db.record_count()? < 6 {
        assert!(Instant::now() < deadline, "writer never caught up");
        db.wake_writer();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(db.stats().write_backs >= 6);
    db.close()?;
    Ok(())
}

const TAG_KIND: InstanceKind = 7;

#[derive(Debug)]
struct Tag(String);

impl InstanceValue for Tag {
    fn kind(&self) -> InstanceKind {
        TAG_KIND
    }

    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.0.as_bytes());
    }

    fn packed_size(&self) -> usize {
        self.0.len()
    }

    fn compare(&self, other: &dyn InstanceValue) -> Ordering {
        match other.as_any().downcast_ref::<Tag>() {
            Some(t) => self.0.cmp(&t.0),
            None => Ordering::Less,
        }
    }

    fn hash_value(&self, mut state: &mut dyn Hasher) {
        self.0.hash(&mut state);
    }

    fn literal(&self) -> String {
        format!("tag({})", self.0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn unpack_tag(payload: &[u8]) -> StoreResult<Arc<dyn InstanceValue>> {
    let text = String::from_utf8(payload.to_vec())
        .map_err(|e| StoreError::Corrupt(format!("tag is not utf-8: {}", e)))?;
    Ok(Arc::new(Tag(text)))
}

#[test]
fn test_values_survive_restart() -> Result<()> {
    let dir = tempdir()?;
    let registry = || {
        let mut registry = InstanceRegistry::new();
        registry.register(TAG_KIND, unpack_tag);
        registry
    };
    let mut dict = Dict::new();
    dict.insert(Value::Symbol("hp".into()), Value::Integer(-40));
    dict.insert(Value::Objnum(3), Value::Float(f64::NEG_INFINITY));
    let value = Value::List(vec![
        Value::Integer(i64::MIN),
        Value::Float(0.1),
        Value::Dict(dict),
        Value::Buffer(vec![0, 255, 7]),
        Value::Instance(Instance::new(Tag("blue".into()))),
        Value::Error("~perm".into()),
    ]);

    {
        let db = Database::open_with_registry(small_config(dir.path()), registry())?;
        let obj = db.new_record(Some(3), &[])?;
        obj.write().set_var(3, "bag", value.clone());
        db.mark_dirty(&obj);
        obj.discard()?;
    }

    let db = Database::open_with_registry(small_config(dir.path()), registry())?;
    let obj = db.retrieve(3)?.expect("stored");
    assert_eq!(obj.read().get_var(3, "bag"), Some(&value));
    obj.discard()?;

    // without the registration the record no longer decodes
    drop(db);
    let db = Database::open(small_config(dir.path()))?;
    assert!(matches!(
        db.retrieve(3),
        Err(StoreError::UnknownInstance(TAG_KIND))
    ));
    Ok(())
}

#[test]
fn test_cache_chains_stay_consistent() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(small_config(dir.path()))?;
    for objnum in 0..10 {
        create(&db, objnum)?;
    }

    let mut held = Vec::new();
    for step in 0..200i64 {
        let objnum = (step * 7) % 10;
        let obj = db.retrieve(objnum)?.expect("exists");
        if step % 3 == 0 {
            held.push(obj);
        } else {
            obj.discard()?;
        }
        if held.len() > 4 {
            held.remove(0).discard()?;
        }
        db.cache().verify()?;
        for obj in &held {
            assert_eq!(db.cache().residency(obj.objnum()), Some(Residency::Active));
        }
    }
    Ok(())
}
