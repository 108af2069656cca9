//! Bounded hand-off queue between the dispatcher and the workers.
//!
//! Fixed-capacity ring buffer under one mutex. The producer never blocks:
//! [`WorkQueue::try_push`] hands the item back when the queue is full.
//! Consumers block in [`WorkQueue::pop`] until an item arrives or the queue
//! is closed.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::sync::{lock, wait, wait_timeout};
use crate::ShutdownMode;

struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    len: usize,
    closed: Option<ShutdownMode>,
}

impl<T> Ring<T> {
    fn push(&mut self, item: T) -> Result<(), T> {
        if self.len == self.slots.len() {
            return Err(item);
        }
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.slots.len();
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        item
    }
}

pub struct WorkQueue<T> {
    ring: Mutex<Ring<T>>,
    available: Condvar,
    emptied: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                head: 0,
                tail: 0,
                len: 0,
                closed: None,
            }),
            available: Condvar::new(),
            emptied: Condvar::new(),
        }
    }

    /// Enqueue without blocking. A full or closed queue returns the item.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut ring = lock(&self.ring, "work queue");
        if ring.closed.is_some() {
            return Err(item);
        }
        ring.push(item)?;
        drop(ring);
        self.available.notify_one();
        Ok(())
    }

    /// Block until an item is available.
    ///
    /// Returns `None` once the queue is closed: immediately for
    /// [`ShutdownMode::Stop`], after the remaining items have been handed out
    /// for [`ShutdownMode::Drain`].
    pub fn pop(&self) -> Option<T> {
        let mut ring = lock(&self.ring, "work queue");
        loop {
            if ring.closed == Some(ShutdownMode::Stop) {
                return None;
            }
            let item = ring.pop();
            if item.is_some() || ring.closed.is_some() {
                if ring.len == 0 {
                    self.emptied.notify_all();
                }
                return item;
            }
            ring = wait(&self.available, ring, "work queue");
        }
    }

    /// Block until every queued item has been handed out or `timeout`
    /// passes. Returns whether the queue is empty.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ring = lock(&self.ring, "work queue");
        while ring.len > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            ring = wait_timeout(&self.emptied, ring, deadline - now, "work queue");
        }
        true
    }

    /// Refuse further pushes and wake every blocked consumer.
    pub fn close(&self, mode: ShutdownMode) {
        lock(&self.ring, "work queue").closed = Some(mode);
        self.available.notify_all();
    }

    /// Take whatever is still queued, oldest first.
    pub fn drain_remaining(&self) -> Vec<T> {
        let mut ring = lock(&self.ring, "work queue");
        let mut items = Vec::with_capacity(ring.len);
        while let Some(item) = ring.pop() {
            items.push(item);
        }
        drop(ring);
        self.emptied.notify_all();
        items
    }

    pub fn len(&self) -> usize {
        lock(&self.ring, "work queue").len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.ring, "work queue").slots.len()
    }
}
