use crate::object::{ObjectRecord, Objnum};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type SlotId = usize;

/// Which residency chain a slot sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chain {
    Active,
    Inactive,
    Dirty,
}

impl From<Residency> for Chain {
    fn from(r: Residency) -> Self {
        match r {
            Residency::Active => Chain::Active,
            Residency::Inactive => Chain::Inactive,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

#[derive(Debug, Clone, Copy, Default)]
struct List {
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub objnum: Option<Objnum>,
    pub record: Option<Arc<RwLock<ObjectRecord>>>,
    pub refs: u32,
    /// Modifications since the last write; zero when clean.
    pub dirty: u64,
    /// Keep the background writer away from this record.
    pub skip: bool,
    /// Bumped on every bind/unbind so stale handles can be detected.
    pub generation: u64,
    residency: Residency,
    link: Link,
    dirty_link: Link,
    in_dirty: bool,
}

impl Slot {
    fn empty() -> Self {
        Self {
            objnum: None,
            record: None,
            refs: 0,
            dirty: 0,
            skip: false,
            generation: 0,
            residency: Residency::Inactive,
            link: Link::default(),
            dirty_link: Link::default(),
            in_dirty: false,
        }
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }
}

/// One cache bucket: a slot arena threaded by three intrusive chains.
///
/// Every slot is on exactly one of active/inactive. Active is ordered by last
/// touch (head = most recent); inactive by release (head = most recent, tail =
/// next victim, empty slots parked at the tail). The dirty chain uses its own
/// links and may include slots from either.
#[derive(Debug)]
pub(crate) struct Bucket {
    slots: Vec<Slot>,
    active: List,
    inactive: List,
    dirty: List,
    lookup: HashMap<Objnum, SlotId>,
}

impl Bucket {
    pub fn new(depth: usize) -> Self {
        let mut bucket = Self {
            slots: Vec::with_capacity(depth),
            active: List::default(),
            inactive: List::default(),
            dirty: List::default(),
            lookup: HashMap::with_capacity(depth),
        };
        for _ in 0..depth {
            bucket.add_slot();
        }
        bucket
    }

    fn add_slot(&mut self) -> SlotId {
        let id = self.slots.len();
        self.slots.push(Slot::empty());
        self.push_back(Chain::Inactive, id);
        id
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn active_len(&self) -> usize {
        self.active.len
    }

    #[cfg(test)]
    pub fn inactive_len(&self) -> usize {
        self.inactive.len
    }

    #[cfg(test)]
    pub fn dirty_len(&self) -> usize {
        self.dirty.len
    }

    pub fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id]
    }

    pub fn slot_mut(&mut self, id: SlotId) -> &mut Slot {
        &mut self.slots[id]
    }

    pub fn find(&self, objnum: Objnum) -> Option<SlotId> {
        self.lookup.get(&objnum).copied()
    }

    /// Slot to recycle for a miss: the inactive tail. When every slot is
    /// referenced the pool grows by one; the flag reports that.
    pub fn victim(&mut self) -> (SlotId, bool) {
        match self.inactive.tail {
            Some(id) => (id, false),
            None => (self.add_slot(), true),
        }
    }

    /// Take a reference: the slot moves to (or to the front of) active.
    pub fn retain(&mut self, id: SlotId) {
        self.slots[id].refs += 1;
        self.move_to(id, Residency::Active, true);
    }

    /// Move to the inactive head after the last reference is dropped.
    pub fn deactivate(&mut self, id: SlotId) {
        self.move_to(id, Residency::Inactive, true);
    }

    /// Move to the inactive tail so the slot is recycled next.
    pub fn park(&mut self, id: SlotId) {
        self.move_to(id, Residency::Inactive, false);
    }

    pub fn bind(&mut self, id: SlotId, objnum: Objnum, record: Arc<RwLock<ObjectRecord>>) {
        debug_assert!(self.slots[id].objnum.is_none());
        self.lookup.insert(objnum, id);
        let slot = &mut self.slots[id];
        slot.objnum = Some(objnum);
        slot.record = Some(record);
        slot.refs = 0;
        slot.dirty = 0;
        slot.skip = false;
        slot.generation += 1;
    }

    /// Empty the slot. It keeps its place in its residency chain.
    pub fn unbind(&mut self, id: SlotId) -> Option<Objnum> {
        self.clear_dirty(id);
        let slot = &mut self.slots[id];
        let objnum = slot.objnum.take()?;
        slot.record = None;
        slot.refs = 0;
        slot.skip = false;
        slot.generation += 1;
        self.lookup.remove(&objnum);
        Some(objnum)
    }

    pub fn mark_dirty(&mut self, id: SlotId) {
        self.slots[id].dirty += 1;
        if !self.slots[id].in_dirty {
            self.slots[id].in_dirty = true;
            self.push_front(Chain::Dirty, id);
        }
    }

    pub fn clear_dirty(&mut self, id: SlotId) {
        self.slots[id].dirty = 0;
        if self.slots[id].in_dirty {
            self.slots[id].in_dirty = false;
            self.unlink(Chain::Dirty, id);
        }
    }

    /// Dirty slots, oldest modification first.
    pub fn dirty_slots(&self) -> Vec<SlotId> {
        let mut out = Vec::with_capacity(self.dirty.len);
        let mut cursor = self.dirty.tail;
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.slots[id].dirty_link.prev;
        }
        out
    }

    fn move_to(&mut self, id: SlotId, residency: Residency, front: bool) {
        let from = self.slots[id].residency;
        self.unlink(from.into(), id);
        self.slots[id].residency = residency;
        if front {
            self.push_front(residency.into(), id);
        } else {
            self.push_back(residency.into(), id);
        }
    }

    fn list(&mut self, chain: Chain) -> &mut List {
        match chain {
            Chain::Active => &mut self.active,
            Chain::Inactive => &mut self.inactive,
            Chain::Dirty => &mut self.dirty,
        }
    }

    fn link(&mut self, id: SlotId, chain: Chain) -> &mut Link {
        match chain {
            Chain::Dirty => &mut self.slots[id].dirty_link,
            _ => &mut self.slots[id].link,
        }
    }

    fn push_front(&mut self, chain: Chain, id: SlotId) {
        let head = self.list(chain).head;
        *self.link(id, chain) = Link { prev: None, next: head };
        match head {
            Some(h) => self.link(h, chain).prev = Some(id),
            None => self.list(chain).tail = Some(id),
        }
        let list = self.list(chain);
        list.head = Some(id);
        list.len += 1;
    }

    fn push_back(&mut self, chain: Chain, id: SlotId) {
        let tail = self.list(chain).tail;
        *self.link(id, chain) = Link { prev: tail, next: None };
        match tail {
            Some(t) => self.link(t, chain).next = Some(id),
            None => self.list(chain).head = Some(id),
        }
        let list = self.list(chain);
        list.tail = Some(id);
        list.len += 1;
    }

    fn unlink(&mut self, chain: Chain, id: SlotId) {
        let Link { prev, next } = *self.link(id, chain);
        match prev {
            Some(p) => self.link(p, chain).next = next,
            None => self.list(chain).head = next,
        }
        match next {
            Some(n) => self.link(n, chain).prev = prev,
            None => self.list(chain).tail = prev,
        }
        *self.link(id, chain) = Link::default();
        self.list(chain).len -= 1;
    }

    fn walk(&self, list: &List, dirty: bool) -> Vec<SlotId> {
        let mut out = Vec::with_capacity(list.len);
        let mut cursor = list.head;
        while let Some(id) = cursor {
            out.push(id);
            cursor = if dirty {
                self.slots[id].dirty_link.next
            } else {
                self.slots[id].link.next
            };
        }
        out
    }

    /// Check chain structure against the slots. Returns a description of the
    /// first violation found.
    pub fn verify(&self) -> Result<(), String> {
        let active = self.walk(&self.active, false);
        let inactive = self.walk(&self.inactive, false);
        let dirty = self.walk(&self.dirty, true);
        if active.len() != self.active.len || inactive.len() != self.inactive.len || dirty.len() != self.dirty.len {
            return Err("chain length mismatch".to_string());
        }
        if active.len() + inactive.len() != self.slots.len() {
            return Err(format!(
                "{} slots but {} active + {} inactive",
                self.slots.len(),
                active.len(),
                inactive.len()
            ));
        }

        let mut seen = vec![false; self.slots.len()];
        for (ids, residency) in [(&active, Residency::Active), (&inactive, Residency::Inactive)] {
            for &id in ids {
                if std::mem::replace(&mut seen[id], true) {
                    return Err(format!("slot {} linked twice", id));
                }
                let slot = &self.slots[id];
                if slot.residency != residency {
                    return Err(format!("slot {} on the wrong chain", id));
                }
                if (slot.refs > 0) != (residency == Residency::Active) {
                    return Err(format!("slot {} has {} refs on {:?}", id, slot.refs, residency));
                }
            }
        }

        for &id in &dirty {
            if !self.slots[id].in_dirty || self.slots[id].dirty == 0 {
                return Err(format!("slot {} on dirty chain but clean", id));
            }
        }
        if self.slots.iter().filter(|s| s.in_dirty).count() != dirty.len() {
            return Err("dirty slot missing from dirty chain".to_string());
        }

        let bound = self.slots.iter().filter(|s| s.objnum.is_some()).count();
        if bound != self.lookup.len() {
            return Err(format!("{} bound slots but {} lookup entries", bound, self.lookup.len()));
        }
        for (&objnum, &id) in &self.lookup {
            if self.slots[id].objnum != Some(objnum) {
                return Err(format!("lookup for #{} points at slot {}", objnum, id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(objnum: Objnum) -> Arc<RwLock<ObjectRecord>> {
        Arc::new(RwLock::new(ObjectRecord::new(objnum, vec![])))
    }

    #[test]
    fn test_new_bucket_is_all_inactive() {
        let bucket = Bucket::new(4);
        assert_eq!(bucket.capacity(), 4);
        assert_eq!(bucket.inactive_len(), 4);
        assert_eq!(bucket.active_len(), 0);
        bucket.verify().unwrap();
    }

    #[test]
    fn test_retain_and_release_order() {
        let mut bucket = Bucket::new(3);
        let mut ids = Vec::new();
        for objnum in 0..3 {
            let (id, grew) = bucket.victim();
            assert!(!grew);
            bucket.bind(id, objnum, record(objnum));
            bucket.retain(id);
            ids.push(id);
        }
        assert_eq!(bucket.active_len(), 3);
        bucket.verify().unwrap();

        // release 0 then 2: 0 ends at the tail and is the next victim
        for id in [ids[0], ids[2]] {
            bucket.slot_mut(id).refs -= 1;
            bucket.deactivate(id);
        }
        bucket.verify().unwrap();
        assert_eq!(bucket.victim(), (ids[0], false));
    }

    #[test]
    fn test_pool_grows_when_everything_is_referenced() {
        let mut bucket = Bucket::new(1);
        let (id, _) = bucket.victim();
        bucket.bind(id, 1, record(1));
        bucket.retain(id);
        let (next, grew) = bucket.victim();
        assert!(grew);
        assert_ne!(next, id);
        assert_eq!(bucket.capacity(), 2);
        bucket.verify().unwrap();
    }

    #[test]
    fn test_dirty_chain() {
        let mut bucket = Bucket::new(3);
        for objnum in 0..3 {
            let (id, _) = bucket.victim();
            bucket.bind(id, objnum, record(objnum));
            bucket.retain(id);
        }
        let a = bucket.find(0).unwrap();
        let b = bucket.find(2).unwrap();
        bucket.mark_dirty(a);
        bucket.mark_dirty(b);
        bucket.mark_dirty(a);
        assert_eq!(bucket.slot(a).dirty, 2);
        assert_eq!(bucket.dirty_slots(), vec![a, b]);

        bucket.clear_dirty(a);
        assert_eq!(bucket.dirty_slots(), vec![b]);
        bucket.verify().unwrap();

        bucket.slot_mut(b).refs = 0;
        bucket.park(b);
        assert_eq!(bucket.unbind(b), Some(2));
        assert_eq!(bucket.dirty_len(), 0);
        assert_eq!(bucket.find(2), None);
        bucket.verify().unwrap();
    }

    #[test]
    fn test_unbind_bumps_generation() {
        let mut bucket = Bucket::new(1);
        let (id, _) = bucket.victim();
        bucket.bind(id, 9, record(9));
        let bound = bucket.slot(id).generation;
        bucket.unbind(id);
        assert!(bucket.slot(id).generation > bound);
        assert_eq!(bucket.unbind(id), None);
    }
}
