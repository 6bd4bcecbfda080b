//! Runtime-registered value kinds.
//!
//! The built-in kinds of [`Value`](super::Value) cover what the store itself
//! needs. Anything else travels as an [`Instance`]: a shared trait object whose
//! kind id selects an unpack function in an [`InstanceRegistry`]. Duplicating an
//! instance is an `Arc` clone; discarding it is a drop.

use crate::storage::error::{StoreError, StoreResult};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub type InstanceKind = u32;

/// Rebuilds an instance from the payload written by [`InstanceValue::pack`].
pub type UnpackFn = fn(&[u8]) -> StoreResult<Arc<dyn InstanceValue>>;

/// Behaviour a runtime-defined value kind supplies to the store.
pub trait InstanceValue: fmt::Debug + Send + Sync {
    /// Registry key; must be stable across restarts.
    fn kind(&self) -> InstanceKind;

    /// Append the payload bytes to `out`.
    fn pack(&self, out: &mut Vec<u8>);

    /// Exact number of bytes `pack` will append.
    fn packed_size(&self) -> usize;

    /// Only called with another instance of the same kind.
    fn compare(&self, other: &dyn InstanceValue) -> Ordering;

    fn hash_value(&self, state: &mut dyn Hasher);

    fn literal(&self) -> String;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone)]
pub struct Instance(Arc<dyn InstanceValue>);

impl Instance {
    pub fn new<T: InstanceValue + 'static>(value: T) -> Self {
        Instance(Arc::new(value))
    }

    pub fn from_arc(value: Arc<dyn InstanceValue>) -> Self {
        Instance(value)
    }

    pub fn kind(&self) -> InstanceKind {
        self.0.kind()
    }

    pub fn get(&self) -> &dyn InstanceValue {
        self.0.as_ref()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    pub fn compare(&self, other: &Instance) -> Ordering {
        self.kind()
            .cmp(&other.kind())
            .then_with(|| self.0.compare(other.0.as_ref()))
    }

    pub fn literal(&self) -> String {
        self.0.literal()
    }
}

impl Hash for Instance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.0.hash_value(state);
    }
}

/// Maps instance kind ids to their unpack functions.
#[derive(Default, Clone)]
pub struct InstanceRegistry {
    unpackers: HashMap<InstanceKind, UnpackFn>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `kind` was already registered; the old entry is kept.
    pub fn register(&mut self, kind: InstanceKind, unpack: UnpackFn) -> bool {
        if self.unpackers.contains_key(&kind) {
            return false;
        }
        self.unpackers.insert(kind, unpack);
        true
    }

    pub fn is_registered(&self, kind: InstanceKind) -> bool {
        self.unpackers.contains_key(&kind)
    }

    pub fn unpack(&self, kind: InstanceKind, payload: &[u8]) -> StoreResult<Instance> {
        let unpack = self
            .unpackers
            .get(&kind)
            .ok_or(StoreError::UnknownInstance(kind))?;
        Ok(Instance(unpack(payload)?))
    }
}

impl fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.unpackers.keys().collect();
        kinds.sort();
        f.debug_struct("InstanceRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const POINT_KIND: InstanceKind = 42;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Point {
        pub x: i32,
        pub y: i32,
    }

    impl InstanceValue for Point {
        fn kind(&self) -> InstanceKind {
            POINT_KIND
        }

        fn pack(&self, out: &mut Vec<u8>) {
            out.extend_from_slice(&self.x.to_le_bytes());
            out.extend_from_slice(&self.y.to_le_bytes());
        }

        fn packed_size(&self) -> usize {
            8
        }

        fn compare(&self, other: &dyn InstanceValue) -> Ordering {
            match other.as_any().downcast_ref::<Point>() {
                Some(p) => (self.x, self.y).cmp(&(p.x, p.y)),
                None => Ordering::Less,
            }
        }

        fn hash_value(&self, mut state: &mut dyn Hasher) {
            (self.x, self.y).hash(&mut state);
        }

        fn literal(&self) -> String {
            format!("point({}, {})", self.x, self.y)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    pub(crate) fn unpack_point(payload: &[u8]) -> StoreResult<Arc<dyn InstanceValue>> {
        if payload.len() != 8 {
            return Err(StoreError::Corrupt(format!(
                "point payload must be 8 bytes, got {}",
                payload.len()
            )));
        }
        let x = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let y = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
        Ok(Arc::new(Point { x, y }))
    }

    pub(crate) fn point_registry() -> InstanceRegistry {
        let mut registry = InstanceRegistry::new();
        registry.register(POINT_KIND, unpack_point);
        registry
    }

    #[test]
    fn test_register_once() {
        let mut registry = point_registry();
        assert!(registry.is_registered(POINT_KIND));
        assert!(!registry.register(POINT_KIND, unpack_point));
    }

    #[test]
    fn test_unpack_unknown_kind() {
        let registry = InstanceRegistry::new();
        let err = registry.unpack(7, &[]).unwrap_err();
        assert!(matches!(err, StoreError::UnknownInstance(7)));
    }

    #[test]
    fn test_instance_downcast_and_compare() -> StoreResult<()> {
        let registry = point_registry();
        let a = Instance::new(Point { x: 1, y: 2 });
        let mut payload = Vec::new();
        a.get().pack(&mut payload);
        let b = registry.unpack(POINT_KIND, &payload)?;
        assert_eq!(b.downcast_ref::<Point>(), Some(&Point { x: 1, y: 2 }));
        assert_eq!(a.compare(&b), Ordering::Equal);
        assert_eq!(b.literal(), "point(1, 2)");
        Ok(())
    }
}
