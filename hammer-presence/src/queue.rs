//! Hand-off primitives between the application thread and the IO thread.
//!
//! - [`SpscQueue`]: bounded FIFO for traffic where every item matters
//!   (subscribe commands, join replies, join requests). A full queue refuses
//!   new items instead of blocking.
//! - [`Mailbox`]: single slot, last write wins. Used for the coalesced
//!   presence update and for one-shot event signals consumed by
//!   `run_callbacks`.
//!
//! Each instance has one producing thread and one consuming thread.

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;

/// Bounded FIFO with capacity `N`, allocation-free after construction.
pub struct SpscQueue<T, const N: usize> {
    slots: ArrayQueue<T>,
}

impl<T, const N: usize> SpscQueue<T, N> {
    pub fn new() -> Self {
        Self {
            slots: ArrayQueue::new(N),
        }
    }

    /// Queue `item`, handing it back if all `N` slots are taken.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.slots.push(item)
    }

    /// Oldest queued item.
    pub fn pop(&self) -> Option<T> {
        self.slots.pop()
    }

    pub fn has_pending(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Drop everything still queued.
    pub fn clear(&self) {
        while self.slots.pop().is_some() {}
    }
}

impl<T, const N: usize> Default for SpscQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-slot mailbox; posting replaces whatever was unread.
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Store `value`, returning the unread value it replaced.
    pub fn post(&self, value: T) -> Option<T> {
        self.slot.lock().replace(value)
    }

    /// Store `value` only if the slot is empty, so a newer post is never
    /// clobbered. Returns `false` (and drops `value`) otherwise.
    pub fn post_if_empty(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        true
    }

    /// Take the unread value, leaving the slot empty.
    pub fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
