//! Object cache: the in-memory working set in front of the file store.
//!
//! Records are spread over `width` buckets by `objnum mod width`, each bucket
//! its own lock and slot arena (see [`bucket`]). A cached record lives in an
//! `Arc<RwLock<ObjectRecord>>`; callers reach it through an [`ObjRef`], which
//! holds one reference and gives it back on drop.
//!
//! Lock order is bucket, then store, then record. Never hold a record guard
//! from [`ObjRef::read`]/[`ObjRef::write`] while calling back into the cache.

mod bucket;
pub mod writer;

use crate::object::{ObjectRecord, Objnum};
use crate::storage::error::{fatal, StoreError, StoreResult};
use crate::storage::file_store::FileStore;
use bucket::{Bucket, SlotId};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub use bucket::Residency;
pub use writer::Writer;

/// Called with a record just before it is removed from the store.
pub type DestroyHook = Box<dyn Fn(&ObjectRecord) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub growths: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
    growths: AtomicU64,
}

struct CacheInner {
    buckets: Vec<Mutex<Bucket>>,
    store: Mutex<FileStore>,
    destroy_hook: RwLock<Option<DestroyHook>>,
    counters: Counters,
    writer_cursor: AtomicUsize,
}

#[derive(Clone)]
pub struct ObjectCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("width", &self.inner.buckets.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl ObjectCache {
    pub fn new(store: FileStore, width: usize, depth: usize) -> Self {
        let buckets = (0..width.max(1)).map(|_| Mutex::new(Bucket::new(depth))).collect();
        Self {
            inner: Arc::new(CacheInner {
                buckets,
                store: Mutex::new(store),
                destroy_hook: RwLock::new(None),
                counters: Counters::default(),
                writer_cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// Install the hook run on each record as it is destroyed. The hook runs
    /// with the record's bucket locked and must not call into the cache.
    pub fn set_destroy_hook(&self, hook: DestroyHook) {
        *self.inner.destroy_hook.write() = Some(hook);
    }

    /// Fetch a record, loading it on a miss. `Ok(None)` if the record does
    /// not exist or has been destroyed.
    pub fn retrieve(&self, objnum: Objnum) -> StoreResult<Option<ObjRef>> {
        let b = self.inner.bucket_of(objnum);
        let mut bucket = self.inner.buckets[b].lock();

        if let Some(id) = bucket.find(objnum) {
            let record = self.inner.bound_record(&bucket, id);
            if record.read().is_dead() {
                return Ok(None);
            }
            bucket.retain(id);
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(self.handle(objnum, b, id, &bucket, record)));
        }

        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        let id = self.inner.recycle(&mut bucket)?;
        let loaded = self.inner.store.lock().get(objnum)?;
        let Some(record) = loaded else {
            bucket.park(id);
            return Ok(None);
        };

        let record = Arc::new(RwLock::new(record));
        bucket.bind(id, objnum, record.clone());
        bucket.retain(id);
        log::debug!("#{} loaded into bucket {} slot {}", objnum, b, id);
        Ok(Some(self.handle(objnum, b, id, &bucket, record)))
    }

    /// Add a brand-new record. It starts referenced and dirty.
    pub fn insert_new(&self, record: ObjectRecord) -> StoreResult<ObjRef> {
        let objnum = record.objnum;
        let b = self.inner.bucket_of(objnum);
        let mut bucket = self.inner.buckets[b].lock();
        if bucket.find(objnum).is_some() || self.inner.store.lock().check(objnum) {
            return Err(StoreError::ObjnumInUse(objnum));
        }

        let id = self.inner.recycle(&mut bucket)?;
        let record = Arc::new(RwLock::new(record));
        bucket.bind(id, objnum, record.clone());
        bucket.retain(id);
        bucket.mark_dirty(id);
        self.inner.store.lock().note_objnum(objnum);
        Ok(self.handle(objnum, b, id, &bucket, record))
    }

    fn handle(
        &self,
        objnum: Objnum,
        b: usize,
        id: SlotId,
        bucket: &Bucket,
        record: Arc<RwLock<ObjectRecord>>,
    ) -> ObjRef {
        ObjRef {
            inner: self.inner.clone(),
            objnum,
            bucket: b,
            slot: id,
            generation: bucket.slot(id).generation,
            record,
            released: false,
        }
    }

    /// True if the record exists and is not dead.
    pub fn check(&self, objnum: Objnum) -> bool {
        let bucket = self.inner.buckets[self.inner.bucket_of(objnum)].lock();
        match bucket.find(objnum) {
            Some(id) => !self.inner.bound_record(&bucket, id).read().is_dead(),
            None => self.inner.store.lock().check(objnum),
        }
    }

    pub fn mark_dirty(&self, obj: &ObjRef) {
        let mut bucket = self.inner.buckets[obj.bucket].lock();
        self.inner.validate(&bucket, obj);
        bucket.mark_dirty(obj.slot);
    }

    /// Keep (or stop keeping) the background writer away from this record.
    pub fn set_writer_skip(&self, obj: &ObjRef, skip: bool) {
        let mut bucket = self.inner.buckets[obj.bucket].lock();
        self.inner.validate(&bucket, obj);
        bucket.slot_mut(obj.slot).skip = skip;
    }

    pub fn is_dirty(&self, obj: &ObjRef) -> bool {
        let bucket = self.inner.buckets[obj.bucket].lock();
        self.inner.validate(&bucket, obj);
        bucket.slot(obj.slot).dirty > 0
    }

    /// Which chain `objnum` currently sits on, if it is cached.
    pub fn residency(&self, objnum: Objnum) -> Option<Residency> {
        let bucket = self.inner.buckets[self.inner.bucket_of(objnum)].lock();
        bucket.find(objnum).map(|id| bucket.slot(id).residency())
    }

    /// Write every dirty record, then flush the store and the index.
    pub fn sync(&self) -> StoreResult<()> {
        let mut written = 0;
        for lock in &self.inner.buckets {
            let mut bucket = lock.lock();
            let dirty = bucket.dirty_slots();
            if dirty.is_empty() {
                continue;
            }
            let mut store = self.inner.store.lock();
            for id in dirty {
                self.inner.flush_slot(&mut bucket, &mut store, id)?;
                written += 1;
            }
        }
        self.inner.store.lock().sync()?;
        log::debug!("sync wrote {} records", written);
        Ok(())
    }

    /// One background write-back round. Starting at the rotating cursor, find
    /// the first bucket with unreferenced, unskipped dirty records and write
    /// them. Returns how many were written.
    pub fn write_back_pass(&self) -> StoreResult<usize> {
        let width = self.inner.buckets.len();
        let start = self.inner.writer_cursor.load(Ordering::Relaxed);
        for step in 0..width {
            let b = (start + step) % width;
            let mut bucket = self.inner.buckets[b].lock();
            let candidates: Vec<SlotId> = bucket
                .dirty_slots()
                .into_iter()
                .filter(|&id| bucket.slot(id).refs == 0 && !bucket.slot(id).skip)
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let mut store = self.inner.store.lock();
            for &id in &candidates {
                self.inner.flush_slot(&mut bucket, &mut store, id)?;
            }
            self.inner.writer_cursor.store((b + 1) % width, Ordering::Relaxed);
            log::debug!("writer flushed {} records from bucket {}", candidates.len(), b);
            return Ok(candidates.len());
        }
        Ok(0)
    }

    /// Run `f` against the file store. Must not be called with a bucket
    /// operation in flight on this thread.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut FileStore) -> R) -> R {
        f(&mut self.inner.store.lock())
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            write_backs: c.write_backs.load(Ordering::Relaxed),
            growths: c.growths.load(Ordering::Relaxed),
        }
    }

    /// Check every bucket's chains for structural consistency.
    pub fn verify(&self) -> StoreResult<()> {
        for (b, lock) in self.inner.buckets.iter().enumerate() {
            lock.lock()
                .verify()
                .map_err(|e| StoreError::Corrupt(format!("cache bucket {}: {}", b, e)))?;
        }
        Ok(())
    }
}

impl CacheInner {
    fn bucket_of(&self, objnum: Objnum) -> usize {
        objnum.rem_euclid(self.buckets.len() as i64) as usize
    }

    fn bound_record(&self, bucket: &Bucket, id: SlotId) -> Arc<RwLock<ObjectRecord>> {
        match &bucket.slot(id).record {
            Some(record) => record.clone(),
            None => panic!("cache slot {} is in the lookup table but empty", id),
        }
    }

    fn validate(&self, bucket: &Bucket, obj: &ObjRef) {
        let slot = bucket.slot(obj.slot);
        assert!(
            slot.generation == obj.generation && slot.objnum == Some(obj.objnum),
            "stale handle for #{}",
            obj.objnum
        );
    }

    /// Free up the victim slot of `bucket`, writing it out first if dirty.
    fn recycle(&self, bucket: &mut Bucket) -> StoreResult<SlotId> {
        let (id, grew) = bucket.victim();
        if grew {
            self.counters.growths.fetch_add(1, Ordering::Relaxed);
            log::debug!("cache bucket grew to {} slots", bucket.capacity());
        }
        if bucket.slot(id).objnum.is_some() {
            if bucket.slot(id).dirty > 0 {
                let mut store = self.store.lock();
                self.flush_slot(bucket, &mut store, id)?;
            }
            if let Some(objnum) = bucket.unbind(id) {
                log::debug!("#{} evicted", objnum);
            }
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(id)
    }

    fn flush_slot(&self, bucket: &mut Bucket, store: &mut FileStore, id: SlotId) -> StoreResult<()> {
        let record = self.bound_record(bucket, id);
        let record = record.read();
        // dead records go on their last discard, not back to disk
        if !record.is_dead() && !store.put(&record)? {
            return Err(StoreError::Index(format!("cannot index #{}", record.objnum)));
        }
        bucket.clear_dirty(id);
        self.counters.write_backs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn grab(&self, obj: &ObjRef) {
        let mut bucket = self.buckets[obj.bucket].lock();
        self.validate(&bucket, obj);
        bucket.retain(obj.slot);
    }

    fn release(&self, b: usize, id: SlotId, generation: u64) -> StoreResult<()> {
        let mut bucket = self.buckets[b].lock();
        let slot = bucket.slot_mut(id);
        assert!(
            slot.generation == generation && slot.refs > 0,
            "object handle released twice"
        );
        slot.refs -= 1;
        if slot.refs > 0 {
            return Ok(());
        }

        let record = self.bound_record(&bucket, id);
        let dead = record.read().is_dead();
        if dead {
            self.destroy(&mut bucket, id, &record)
        } else {
            bucket.deactivate(id);
            Ok(())
        }
    }

    fn destroy(&self, bucket: &mut Bucket, id: SlotId, record: &RwLock<ObjectRecord>) -> StoreResult<()> {
        let record = record.read();
        if let Some(hook) = self.destroy_hook.read().as_ref() {
            hook(&record);
        }
        {
            let mut store = self.store.lock();
            store.delete(record.objnum)?;
            if let Some(name) = &record.name {
                store.index().release_name(name, record.objnum);
            }
        }
        bucket.unbind(id);
        bucket.park(id);
        log::debug!("#{} destroyed", record.objnum);
        Ok(())
    }
}

/// A counted reference to a cached record. Dropping it releases the
/// reference; use [`ObjRef::discard`] to see release errors.
pub struct ObjRef {
    inner: Arc<CacheInner>,
    objnum: Objnum,
    bucket: usize,
    slot: SlotId,
    generation: u64,
    record: Arc<RwLock<ObjectRecord>>,
    released: bool,
}

impl ObjRef {
    pub fn objnum(&self) -> Objnum {
        self.objnum
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ObjectRecord> {
        self.record.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ObjectRecord> {
        self.record.write()
    }

    /// Take another reference to the same record.
    pub fn grab(&self) -> ObjRef {
        self.inner.grab(self);
        ObjRef {
            inner: self.inner.clone(),
            objnum: self.objnum,
            bucket: self.bucket,
            slot: self.slot,
            generation: self.generation,
            record: self.record.clone(),
            released: false,
        }
    }

    /// Release this reference. The last release of a dead record destroys it.
    pub fn discard(mut self) -> StoreResult<()> {
        self.released = true;
        self.inner.release(self.bucket, self.slot, self.generation)
    }
}

impl Clone for ObjRef {
    fn clone(&self) -> Self {
        self.grab()
    }
}

impl Drop for ObjRef {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.inner.release(self.bucket, self.slot, self.generation) {
            fatal(&e, "object release");
        }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjRef")
            .field("objnum", &self.objnum)
            .field("bucket", &self.bucket)
            .field("slot", &self.slot)
            .finish()
    }
}
