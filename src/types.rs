//! Common types used across Kestrel
//!
//! This module defines shared handle and address types to avoid circular
//! dependencies between the kernel subsystems.
//!
//! Every kernel entity (task, thread, object, event, timer, segment, ...)
//! lives in a [`Zone`](crate::kern::zalloc::Zone) and is referred to by a
//! generation-checked handle. A handle to a freed slot never aliases the
//! slot's next occupant.

use core::fmt;

/// Virtual address in some task's address space
pub type VirtAddr = usize;

/// Physical address
pub type PhysAddr = usize;

/// Handle into a [`Zone`](crate::kern::zalloc::Zone)
pub trait ZoneId: Copy + Eq + Ord + fmt::Debug {
    /// Build a handle from a slot index and generation
    fn from_slot(index: u32, generation: u32) -> Self;
    /// Slot index
    fn index(self) -> u32;
    /// Slot generation
    fn generation(self) -> u32;

    /// A handle that never names a live slot
    fn null() -> Self {
        Self::from_slot(u32::MAX, u32::MAX)
    }

    fn is_null(self) -> bool {
        self == Self::null()
    }

    /// Pack into a single word (generation in the high half)
    fn raw(self) -> u64 {
        ((self.generation() as u64) << 32) | self.index() as u64
    }

    /// Unpack a word produced by [`ZoneId::raw`]
    fn from_raw(raw: u64) -> Self {
        Self::from_slot(raw as u32, (raw >> 32) as u32)
    }
}

macro_rules! zone_id {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name {
            index: u32,
            generation: u32,
        }

        impl ZoneId for $name {
            fn from_slot(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }

            fn index(self) -> u32 {
                self.index
            }

            fn generation(self) -> u32 {
                self.generation
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "#{}.{}"), self.index, self.generation)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

zone_id!(
    /// Task identifier
    TaskId,
    "task"
);
zone_id!(
    /// Thread identifier
    ThreadId,
    "thread"
);
zone_id!(
    /// IPC object identifier
    ObjectId,
    "object"
);
zone_id!(
    /// Event (wait queue) identifier
    EventId,
    "event"
);
zone_id!(
    /// Timer identifier
    TimerId,
    "timer"
);
zone_id!(
    /// VM map identifier
    MapId,
    "map"
);
zone_id!(
    /// VM segment identifier
    SegmentId,
    "seg"
);
zone_id!(
    /// Shared segment group identifier
    ShareId,
    "share"
);
zone_id!(
    /// Device identifier
    DeviceId,
    "device"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_roundtrip_keeps_generation() {
        let id = TaskId::from_slot(7, 3);
        assert_eq!(TaskId::from_raw(id.raw()), id);
        assert_eq!(id.raw() >> 32, 3);
        assert_ne!(TaskId::from_slot(7, 4), id);
    }

    #[test]
    fn test_null_handle() {
        assert!(EventId::null().is_null());
        assert!(!EventId::from_slot(0, 0).is_null());
    }

    #[test]
    fn test_debug_format() {
        let id = ThreadId::from_slot(2, 1);
        assert_eq!(alloc::format!("{:?}", id), "thread#2.1");
    }
}
