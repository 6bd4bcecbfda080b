//! Direct-mapped write-back cache for name -> objnum lookups.
//!
//! Each name maps to exactly one slot (`hash(name) % size`). Writes land in the
//! slot marked dirty. A dirty entry stays dirty until its owner has written
//! it to the engine and called [`NameCache::mark_clean`], so a failed write
//! leaves it pending.

use crate::object::Objnum;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, PartialEq, Eq)]
struct NameSlot {
    name: String,
    objnum: Objnum,
    dirty: bool,
}

#[derive(Debug)]
pub struct NameCache {
    slots: Vec<Option<NameSlot>>,
}

impl NameCache {
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size.max(1)],
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn slot_of(&self, name: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        (hasher.finish() % self.slots.len() as u64) as usize
    }

    pub fn lookup(&self, name: &str) -> Option<Objnum> {
        match &self.slots[self.slot_of(name)] {
            Some(slot) if slot.name == name => Some(slot.objnum),
            _ => None,
        }
    }

    /// The dirty entry that installing `name` would displace, if any.
    pub fn dirty_rival(&self, name: &str) -> Option<(String, Objnum)> {
        match &self.slots[self.slot_of(name)] {
            Some(slot) if slot.dirty && slot.name != name => Some((slot.name.clone(), slot.objnum)),
            _ => None,
        }
    }

    /// Install `name -> objnum`, replacing whatever shares its slot. Callers
    /// write back [`NameCache::dirty_rival`] first.
    pub fn insert(&mut self, name: &str, objnum: Objnum, dirty: bool) {
        let idx = self.slot_of(name);
        let mut dirty = dirty;
        if let Some(old) = &self.slots[idx] {
            // same name: a pending write stays pending
            if old.name == name {
                dirty |= old.dirty;
            } else {
                debug_assert!(!old.dirty, "dirty name {:?} displaced", old.name);
            }
        }
        self.slots[idx] = Some(NameSlot {
            name: name.to_string(),
            objnum,
            dirty,
        });
    }

    /// Drop `name` from the cache. Returns `true` if the slot held it.
    pub fn remove(&mut self, name: &str) -> bool {
        let idx = self.slot_of(name);
        match &self.slots[idx] {
            Some(slot) if slot.name == name => {
                self.slots[idx] = None;
                true
            }
            _ => false,
        }
    }

    /// Every dirty entry. They stay dirty until marked clean.
    pub fn dirty_entries(&self) -> Vec<(String, Objnum)> {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| slot.dirty)
            .map(|slot| (slot.name.clone(), slot.objnum))
            .collect()
    }

    /// Clear the dirty flag of `name`, if the slot still maps it to `objnum`.
    pub fn mark_clean(&mut self, name: &str, objnum: Objnum) {
        let idx = self.slot_of(name);
        if let Some(slot) = &mut self.slots[idx] {
            if slot.name == name && slot.objnum == objnum {
                slot.dirty = false;
            }
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.slots.iter().flatten().filter(|slot| slot.dirty).count()
    }
}
