//! Per-instance object slab.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::Slot;

/// Address of an object on one instance's heap.
///
/// Only meaningful together with the instance that allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjId(u32);

impl ObjId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ObjId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj_{}", self.0)
    }
}

/// Slab of heap objects; released slots are reused.
#[derive(Debug, Default)]
pub(crate) struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    live: usize,
}

impl Heap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, slot: Slot) -> ObjId {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjId(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn get(&self, id: ObjId) -> Result<&Slot> {
        self.slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::invocation(format!("{} is not live on this instance", id)))
    }

    pub(crate) fn remove(&mut self, id: ObjId) -> Option<Slot> {
        let slot = self.slots.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        self.live -= 1;
        Some(slot)
    }

    /// Number of live objects.
    pub(crate) fn len(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_insert_get_remove() {
        let mut heap = Heap::new();
        let a = heap.insert(Slot::Value(Value::Int(1)));
        let b = heap.insert(Slot::Value(Value::Int(2)));
        assert_ne!(a, b);
        assert_eq!(heap.len(), 2);

        assert!(heap.remove(a).is_some());
        assert!(heap.get(a).is_err());
        assert!(heap.remove(a).is_none());
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_released_slots_are_reused() {
        let mut heap = Heap::new();
        let a = heap.insert(Slot::Value(Value::None));
        heap.remove(a);
        let b = heap.insert(Slot::Value(Value::Bool(true)));
        assert_eq!(a, b);
        assert!(matches!(heap.get(b).unwrap(), Slot::Value(Value::Bool(true))));
    }
}
