//! Pending event queues.
//!
//! A [`PendingQueue`] holds events that may not leave the collector yet. It
//! keeps insertion order, permits duplicates, grows without bound and is
//! safe to use from any number of threads.
//!
//! Items go in and out through a [`PendingGuard`], which keeps other
//! threads out while it is held. The dispatcher uses this to
//! flip its state and drain the queue as one step, so a producer either
//! lands in the queue before the drain or sees the new state after it.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

pub struct PendingQueue<T> {
    items: Mutex<VecDeque<T>>,
}

/// Exclusive access to a [`PendingQueue`].
pub struct PendingGuard<'a, T> {
    items: MutexGuard<'a, VecDeque<T>>,
}

impl<T> PendingQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Locks the queue.
    ///
    /// A panic in another holder does not make the queue unusable: whatever
    /// it left behind is still pending.
    pub fn lock(&self) -> PendingGuard<'_, T> {
        let items = self.items.lock().unwrap_or_else(|e| {
            warn!("pending queue was poisoned; continuing with remaining events");
            PoisonError::into_inner(e)
        });
        PendingGuard { items }
    }

    /// Removes every item.
    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> PendingQueue<T> {
    /// Copies the pending items, front to back.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().items.iter().cloned().collect()
    }
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PendingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> PendingGuard<'_, T> {
    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Iterates over the items, front to back, for in-place updates.
    pub fn iter_mut(&mut self) -> std::collections::vec_deque::IterMut<'_, T> {
        self.items.iter_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Hands every item to `consumer`, front to back, and returns how many
    /// were handed out.
    ///
    /// Each item is removed before it is handed out, so if `consumer` panics
    /// the items behind it stay queued and none is handed out twice.
    pub fn drain<F>(&mut self, mut consumer: F) -> usize
    where
        F: FnMut(T),
    {
        let mut count = 0;
        while let Some(item) = self.items.pop_front() {
            consumer(item);
            count += 1;
        }
        count
    }
}
