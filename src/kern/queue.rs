//! Generic Queue - Doubly-linked list for kernel data structures
//!
//! The queue is the fundamental data structure used throughout the kernel:
//! run queues, event wait queues, the timer list and per-map segment lists
//! are all queues. The linkage is embedded in the queued element itself
//! ([`QueueChain`]), so an element can be removed in O(1) without knowing
//! which queue it is on.
//!
//! Links are zone handles, not pointers. A [`QueueHead`] only names the
//! first and last element; walking the queue goes through the [`Zone`] that
//! owns the elements.
//!
//! ```ignore
//! struct Item {
//!     link: QueueChain<ItemId>,
//! }
//!
//! let mut queue = QueueHead::new();
//! queue.enqueue(&mut zone, id);
//! ```

use crate::kern::zalloc::Zone;
use crate::types::ZoneId;

// ============================================================================
// Queue Entry
// ============================================================================

/// Queue linkage embedded in a queued element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueChain<I> {
    next: Option<I>,
    prev: Option<I>,
    linked: bool,
}

impl<I: ZoneId> QueueChain<I> {
    /// Create an unlinked chain
    pub const fn new() -> Self {
        Self {
            next: None,
            prev: None,
            linked: false,
        }
    }

    /// Is this element on some queue?
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Next element
    pub fn next(&self) -> Option<I> {
        self.next
    }

    /// Previous element
    pub fn prev(&self) -> Option<I> {
        self.prev
    }
}

impl<I: ZoneId> Default for QueueChain<I> {
    fn default() -> Self {
        Self::new()
    }
}

/// Elements that carry a [`QueueChain`]
pub trait Queued<I> {
    fn chain(&self) -> &QueueChain<I>;
    fn chain_mut(&mut self) -> &mut QueueChain<I>;
}

// ============================================================================
// Queue Head
// ============================================================================

/// Head of a queue of `I` handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHead<I> {
    head: Option<I>,
    tail: Option<I>,
    len: usize,
}

impl<I: ZoneId> Default for QueueHead<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ZoneId> QueueHead<I> {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// First element
    pub fn first(&self) -> Option<I> {
        self.head
    }

    /// Last element
    pub fn last(&self) -> Option<I> {
        self.tail
    }

    /// Element following `id`
    pub fn next<T: Queued<I>>(&self, zone: &Zone<I, T>, id: I) -> Option<I> {
        zone[id].chain().next
    }

    /// Element preceding `id`
    pub fn prev<T: Queued<I>>(&self, zone: &Zone<I, T>, id: I) -> Option<I> {
        zone[id].chain().prev
    }

    /// Insert at the tail
    pub fn enqueue<T: Queued<I>>(&mut self, zone: &mut Zone<I, T>, id: I) {
        let tail = self.tail;
        Self::link(zone, id, tail, None);
        match tail {
            Some(tail) => zone[tail].chain_mut().next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Insert at the head
    pub fn enqueue_head<T: Queued<I>>(&mut self, zone: &mut Zone<I, T>, id: I) {
        let head = self.head;
        Self::link(zone, id, None, head);
        match head {
            Some(head) => zone[head].chain_mut().prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    /// Insert `id` directly after `at`
    pub fn insert_after<T: Queued<I>>(&mut self, zone: &mut Zone<I, T>, at: I, id: I) {
        let next = zone[at].chain().next;
        Self::link(zone, id, Some(at), next);
        zone[at].chain_mut().next = Some(id);
        match next {
            Some(next) => zone[next].chain_mut().prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    /// Insert `id` directly before `at`
    pub fn insert_before<T: Queued<I>>(&mut self, zone: &mut Zone<I, T>, at: I, id: I) {
        let prev = zone[at].chain().prev;
        Self::link(zone, id, prev, Some(at));
        zone[at].chain_mut().prev = Some(id);
        match prev {
            Some(prev) => zone[prev].chain_mut().next = Some(id),
            None => self.head = Some(id),
        }
        self.len += 1;
    }

    /// Remove and return the first element
    pub fn dequeue<T: Queued<I>>(&mut self, zone: &mut Zone<I, T>) -> Option<I> {
        let head = self.head?;
        self.remove(zone, head);
        Some(head)
    }

    /// Remove `id` from this queue
    ///
    /// `id` must be linked on this queue; anything else is a corrupted
    /// queue and halts the kernel.
    pub fn remove<T: Queued<I>>(&mut self, zone: &mut Zone<I, T>, id: I) {
        let chain = *zone[id].chain();
        if !chain.linked || self.len == 0 {
            panic!("queue: {:?} is not linked", id);
        }
        match chain.prev {
            Some(prev) => zone[prev].chain_mut().next = chain.next,
            None => {
                assert!(self.head == Some(id), "queue: {:?} is not on this queue", id);
                self.head = chain.next;
            }
        }
        match chain.next {
            Some(next) => zone[next].chain_mut().prev = chain.prev,
            None => {
                assert!(self.tail == Some(id), "queue: {:?} is not on this queue", id);
                self.tail = chain.prev;
            }
        }
        *zone[id].chain_mut() = QueueChain::new();
        self.len -= 1;
    }

    /// Walk the queue from head to tail
    pub fn iter<'a, T: Queued<I>>(&self, zone: &'a Zone<I, T>) -> QueueIter<'a, I, T> {
        QueueIter {
            zone,
            cursor: self.head,
        }
    }

    /// Is `id` on this queue? (linear walk, for checks only)
    pub fn contains<T: Queued<I>>(&self, zone: &Zone<I, T>, id: I) -> bool {
        self.iter(zone).any(|q| q == id)
    }

    fn link<T: Queued<I>>(zone: &mut Zone<I, T>, id: I, prev: Option<I>, next: Option<I>) {
        let chain = zone[id].chain_mut();
        if chain.linked {
            panic!("queue: {:?} is already linked", id);
        }
        *chain = QueueChain {
            next,
            prev,
            linked: true,
        };
    }
}

/// Iterator over the handles of a queue
pub struct QueueIter<'a, I, T> {
    zone: &'a Zone<I, T>,
    cursor: Option<I>,
}

impl<'a, I: ZoneId, T: Queued<I>> Iterator for QueueIter<'a, I, T> {
    type Item = I;

    fn next(&mut self) -> Option<I> {
        let id = self.cursor?;
        self.cursor = self.zone[id].chain().next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventId;
    use alloc::vec::Vec;

    struct Item {
        value: u32,
        link: QueueChain<EventId>,
    }

    impl Queued<EventId> for Item {
        fn chain(&self) -> &QueueChain<EventId> {
            &self.link
        }
        fn chain_mut(&mut self) -> &mut QueueChain<EventId> {
            &mut self.link
        }
    }

    fn item(zone: &mut Zone<EventId, Item>, value: u32) -> EventId {
        zone.alloc(Item {
            value,
            link: QueueChain::new(),
        })
        .unwrap()
    }

    fn values(queue: &QueueHead<EventId>, zone: &Zone<EventId, Item>) -> Vec<u32> {
        queue.iter(zone).map(|id| zone[id].value).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut zone = Zone::new("items", 16);
        let mut queue = QueueHead::new();
        for v in 1..=3 {
            let id = item(&mut zone, v);
            queue.enqueue(&mut zone, id);
        }
        assert_eq!(queue.len(), 3);
        let first = queue.dequeue(&mut zone).unwrap();
        assert_eq!(zone[first].value, 1);
        assert!(!zone[first].link.is_linked());
        assert_eq!(values(&queue, &zone), [2, 3]);
    }

    #[test]
    fn test_insert_and_remove_middle() {
        let mut zone = Zone::new("items", 16);
        let mut queue = QueueHead::new();
        let a = item(&mut zone, 1);
        let c = item(&mut zone, 3);
        queue.enqueue(&mut zone, a);
        queue.enqueue(&mut zone, c);
        let b = item(&mut zone, 2);
        queue.insert_after(&mut zone, a, b);
        let z = item(&mut zone, 0);
        queue.insert_before(&mut zone, a, z);
        assert_eq!(values(&queue, &zone), [0, 1, 2, 3]);

        queue.remove(&mut zone, b);
        assert_eq!(values(&queue, &zone), [0, 1, 3]);
        queue.remove(&mut zone, c);
        assert_eq!(queue.last(), Some(a));
        queue.remove(&mut zone, z);
        assert_eq!(queue.first(), Some(a));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_enqueue_head() {
        let mut zone = Zone::new("items", 16);
        let mut queue = QueueHead::new();
        let a = item(&mut zone, 1);
        let b = item(&mut zone, 2);
        queue.enqueue(&mut zone, a);
        queue.enqueue_head(&mut zone, b);
        assert_eq!(values(&queue, &zone), [2, 1]);
        assert_eq!(queue.prev(&zone, a), Some(b));
        assert_eq!(queue.next(&zone, b), Some(a));
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn test_double_enqueue_panics() {
        let mut zone = Zone::new("items", 16);
        let mut queue = QueueHead::new();
        let a = item(&mut zone, 1);
        queue.enqueue(&mut zone, a);
        queue.enqueue(&mut zone, a);
    }
}
