//! Zone Allocator
//!
//! A zone is a collection of fixed-type slots for which quick allocation and
//! deallocation is possible. The kernel creates one zone for each kind of
//! entity it manages (tasks, threads, objects, events, timers, segments) and
//! refers to entries by generation-checked handles instead of pointers.
//!
//! Freeing a slot bumps its generation, so a stale handle held by a caller
//! fails lookup instead of silently naming whatever reuses the slot.

use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ops::{Index, IndexMut};

use crate::kern::error::{KernError, KernResult};
use crate::types::ZoneId;

// ============================================================================
// Slot
// ============================================================================

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

// ============================================================================
// Zone
// ============================================================================

/// A bounded arena of `T` addressed by handles of type `I`
#[derive(Debug)]
pub struct Zone<I, T> {
    /// Zone name (for diagnostics)
    name: &'static str,
    /// Slot storage
    slots: Vec<Slot<T>>,
    /// Free slot indices
    free: Vec<u32>,
    /// Maximum number of live elements
    limit: usize,
    /// Live element count
    count: usize,
    _id: PhantomData<I>,
}

impl<I: ZoneId, T> Zone<I, T> {
    /// Create a new zone holding at most `limit` elements
    pub const fn new(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            slots: Vec::new(),
            free: Vec::new(),
            limit,
            count: 0,
            _id: PhantomData,
        }
    }

    /// Zone name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Allocate a slot for `value`
    pub fn alloc(&mut self, value: T) -> KernResult<I> {
        if self.count >= self.limit {
            log::warn!("zone {} exhausted ({} elements)", self.name, self.limit);
            return Err(KernError::ResourceExhausted);
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.value.is_none());
        slot.value = Some(value);
        self.count += 1;
        Ok(I::from_slot(index, slot.generation))
    }

    /// Release a slot, returning its value
    pub fn free(&mut self, id: I) -> Option<T> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.count -= 1;
        Some(value)
    }

    /// Look up a live element
    pub fn get(&self, id: I) -> Option<&T> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.value.as_ref()
    }

    /// Look up a live element mutably
    pub fn get_mut(&mut self, id: I) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.value.as_mut()
    }

    /// Is `id` a live handle?
    pub fn contains(&self, id: I) -> bool {
        self.get(id).is_some()
    }

    /// Number of live elements
    pub fn len(&self) -> usize {
        self.count
    }

    /// Is the zone empty?
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Maximum number of live elements
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Iterate over live elements in slot order
    pub fn iter(&self) -> impl Iterator<Item = (I, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (I::from_slot(index as u32, slot.generation), value))
        })
    }

    /// Snapshot of live handles (for loops that mutate the zone)
    pub fn ids(&self) -> Vec<I> {
        self.iter().map(|(id, _)| id).collect()
    }
}

impl<I: ZoneId, T> Index<I> for Zone<I, T> {
    type Output = T;

    fn index(&self, id: I) -> &T {
        match self.get(id) {
            Some(value) => value,
            None => panic!("zone {}: stale handle {:?}", self.name, id),
        }
    }
}

impl<I: ZoneId, T> IndexMut<I> for Zone<I, T> {
    fn index_mut(&mut self, id: I) -> &mut T {
        let name = self.name;
        match self.get_mut(id) {
            Some(value) => value,
            None => panic!("zone {}: stale handle {:?}", name, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;

    #[test]
    fn test_alloc_and_free() {
        let mut zone: Zone<TaskId, u32> = Zone::new("test", 4);
        let a = zone.alloc(10).unwrap();
        let b = zone.alloc(20).unwrap();
        assert_eq!(zone.len(), 2);
        assert_eq!(zone[a], 10);
        assert_eq!(zone.free(a), Some(10));
        assert!(!zone.contains(a));
        assert_eq!(zone[b], 20);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut zone: Zone<TaskId, u32> = Zone::new("test", 4);
        let a = zone.alloc(1).unwrap();
        zone.free(a);
        let b = zone.alloc(2).unwrap();
        assert_eq!(a.index(), b.index());
        assert!(zone.get(a).is_none());
        assert_eq!(zone.free(a), None);
        assert_eq!(zone[b], 2);
    }

    #[test]
    fn test_limit() {
        let mut zone: Zone<TaskId, ()> = Zone::new("test", 2);
        zone.alloc(()).unwrap();
        zone.alloc(()).unwrap();
        assert_eq!(zone.alloc(()), Err(KernError::ResourceExhausted));
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn test_index_stale_panics() {
        let mut zone: Zone<TaskId, u32> = Zone::new("test", 2);
        let a = zone.alloc(1).unwrap();
        zone.free(a);
        let _ = zone[a];
    }
}
