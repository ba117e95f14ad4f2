//! Bounded blocking queue shared between pipeline stages.
//!
//! Each queue is a mutex-protected ring with two condition variables, one per
//! direction. On top of the usual blocking push/pop it supports two
//! out-of-band mechanisms the pipeline depends on:
//!
//! - [`BoundedQueue::notify`] wakes every blocked caller *without* adding or
//!   removing an item, so a stage parked on the queue re-checks a pending
//!   seek/reset immediately instead of at the next natural item arrival;
//! - [`BoundedQueue::interrupt`] permanently unblocks the queue for shutdown.
//!
//! A blocking call that returns because of either reports "nothing happened"
//! (`false` / `None`) and leaves the caller to re-evaluate its loop condition.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    /// Bumped by `notify`; waiters return empty-handed when it changes.
    nudges: u64,
}

/// Thread-safe FIFO with bounded capacity and interruptible waits.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
    interrupted: AtomicBool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                nudges: 0,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Pushes an item, blocking while the queue is full.
    ///
    /// Returns false (dropping the item) when the wait was ended by
    /// `interrupt` or `notify` — the producer must re-check its loop
    /// conditions before retrying.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        let seen = inner.nudges;
        while inner.items.len() >= self.capacity {
            if self.interrupted.load(Ordering::Acquire) || inner.nudges != seen {
                return false;
            }
            self.not_full.wait(&mut inner);
        }
        if self.interrupted.load(Ordering::Acquire) {
            return false;
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Pops the next item, blocking while the queue is empty.
    ///
    /// Returns None when the wait was ended by `interrupt` or `notify`.
    pub fn wait_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let seen = inner.nudges;
        loop {
            if self.interrupted.load(Ordering::Acquire) {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.nudges != seen {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Waits until an item is at the front and returns a clone of it,
    /// leaving the queue unchanged.
    ///
    /// Returns None when woken by `interrupt` or `notify`.
    pub fn wait_front(&self) -> Option<T>
    where
        T: Clone,
    {
        let mut inner = self.inner.lock();
        let seen = inner.nudges;
        loop {
            if self.interrupted.load(Ordering::Acquire) {
                return None;
            }
            if let Some(item) = inner.items.front() {
                return Some(item.clone());
            }
            if inner.nudges != seen {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Removes the front item without blocking.
    pub fn pop_front(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Returns a clone of the front item without blocking or removing it.
    pub fn front(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().items.front().cloned()
    }

    /// Non-blocking check for a poppable item.
    pub fn can_pop(&self) -> bool {
        !self.inner.lock().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the queue and wakes blocked producers.
    ///
    /// Callers ensure no stage depends on the discarded items: the seek
    /// protocol clears the packet queue only after recording the new target,
    /// and close clears both queues after the stage threads have exited.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.items.len();
        inner.items.clear();
        if dropped > 0 {
            tracing::trace!(dropped, "queue cleared");
        }
        self.not_full.notify_all();
    }

    /// Wakes every thread blocked on the queue without adding an item, so it
    /// re-checks an out-of-band condition (pending seek/reset).
    pub fn notify(&self) {
        let mut inner = self.inner.lock();
        inner.nudges = inner.nudges.wrapping_add(1);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Permanently unblocks the queue for shutdown. Blocking calls return
    /// empty-handed from now on.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        // Holding the lock while notifying: a waiter between its flag check
        // and the wait would otherwise miss the wakeup.
        let _guard = self.inner.lock();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(8);
        for i in 0..8 {
            assert!(queue.push(i));
        }
        for i in 0..8 {
            assert_eq!(queue.wait_pop(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_notify_wakes_blocked_pop_without_item() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));
        let q = Arc::clone(&queue);
        let waiter = thread::spawn(move || q.wait_pop());
        // Give the waiter time to block on the empty queue.
        thread::sleep(Duration::from_millis(50));
        queue.notify();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_interrupt_unblocks_full_push() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
        assert!(queue.push(1));
        let q = Arc::clone(&queue);
        let producer = thread::spawn(move || q.push(2));
        thread::sleep(Duration::from_millis(50));
        queue.interrupt();
        assert!(!producer.join().unwrap());
        // The queue stays unblocked after interrupt.
        assert_eq!(queue.wait_pop(), None);
    }

    #[test]
    fn test_clear_unblocks_producer() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
        assert!(queue.push(1));
        let q = Arc::clone(&queue);
        let producer = thread::spawn(move || q.push(2));
        thread::sleep(Duration::from_millis(50));
        queue.clear();
        assert!(producer.join().unwrap());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_front(), Some(2));
    }

    #[test]
    fn test_front_leaves_item_in_place() {
        let queue = BoundedQueue::new(4);
        assert!(queue.push("a"));
        assert_eq!(queue.front(), Some("a"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_front(), Some("a"));
        assert!(!queue.can_pop());
    }
}
