//! Lock-free min-priority queue for multi-producer multi-consumer use.
//!
//! A skiplist ordered by `T`, with logical deletion and hazard-pointer
//! reclamation. Any number of threads may push and pop concurrently; no
//! operation holds a lock (the only mutex in the crate guards the
//! hazard domain's retired list, touched during retirement only).
//!
//! # Overview
//!
//! - [`PriorityQueue::push`] - insert a value; lock-free, retried
//!   internally on contention
//! - [`PriorityQueue::pop`] - remove and return the smallest value, or
//!   `None` when empty
//! - [`PriorityQueue::pop_blocking`] - spin until a value arrives or a
//!   deadline passes
//!
//! # Example
//!
//! ```
//! use cascade::PriorityQueue;
//!
//! let queue = PriorityQueue::new();
//!
//! queue.push(3u64).expect("allocation");
//! queue.push(1).expect("allocation");
//! queue.push(2).expect("allocation");
//!
//! assert_eq!(queue.pop(), Some(1));
//! assert_eq!(queue.pop(), Some(2));
//! assert_eq!(queue.pop(), Some(3));
//! assert_eq!(queue.pop(), None);
//! ```
//!
//! # Ordering guarantees
//!
//! A pop observes some instant at which its value was the queue minimum.
//! Within one consumer thread, successive pops are non-decreasing.
//! Equal keys carry no FIFO guarantee: ties are broken by insertion
//! race outcome, and two consumers may see equal keys in either order.
//!
//! [`len`] and [`is_empty`] are estimates under concurrency, never
//! linearization points; don't gate correctness on them.
//!
//! [`len`]: PriorityQueue::len
//! [`is_empty`]: PriorityQueue::is_empty

pub(crate) mod node;
pub(crate) mod skiplist;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use minstant::Instant;

use crate::hazard::HazardDomain;
use crate::hazard::domain::with_thread_lease;
use self::skiplist::SkipList;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Push failed because the allocator refused a node.
///
/// Carries the rejected value so the caller can retry or recover it.
/// The queue is unchanged.
#[derive(Debug, Eq, PartialEq)]
pub struct PushError<T> {
    /// The value that was not inserted.
    pub value: T,
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue node allocation failed")
    }
}

impl<T: fmt::Debug> std::error::Error for PushError<T> {}

/// Concurrent skiplist min-priority queue.
///
/// Cheap to share behind an [`Arc`]; all operations take `&self`.
///
/// # Thread Safety
///
/// `push`/`pop`/`len` are safe from any number of threads. Destruction
/// is **not** concurrent-safe: dropping the queue requires that no other
/// thread is still operating on it, which Rust's ownership rules enforce
/// for safe callers (the last `Arc` owner drops it).
pub struct PriorityQueue<T: Ord + Clone> {
    list: SkipList<T>,
    count: AtomicUsize,
}

impl<T: Ord + Clone> PriorityQueue<T> {
    /// Creates a queue backed by the process-wide hazard domain.
    #[must_use]
    pub fn new() -> Self {
        Self::with_domain(Arc::clone(HazardDomain::global()))
    }

    /// Creates a queue that retires nodes into `domain`.
    ///
    /// Several queues may share one domain; its slot capacity bounds the
    /// number of threads that can operate on them concurrently.
    #[must_use]
    pub fn with_domain(domain: Arc<HazardDomain>) -> Self {
        Self {
            list: SkipList::new(domain),
            count: AtomicUsize::new(0),
        }
    }

    /// Inserts a value (lock-free).
    ///
    /// Duplicates are allowed. Contention is absorbed internally by
    /// retrying the splice.
    ///
    /// # Errors
    ///
    /// Returns [`PushError`] holding the value if node allocation fails;
    /// the queue is left unchanged and remains usable.
    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        let result = with_thread_lease(self.list.domain(), |lease| {
            let result = self.list.insert(value, lease);
            lease.clear_all();
            result
        });
        match result {
            Ok(()) => {
                self.count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(value) => Err(PushError { value }),
        }
    }

    /// Removes and returns the smallest value (lock-free).
    ///
    /// Returns `None` if the queue is empty. Losing a race for the
    /// current minimum moves on to the next one rather than failing.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let popped = with_thread_lease(self.list.domain(), |lease| {
            let popped = self.list.remove_min(lease);
            lease.clear_all();
            popped
        });
        if popped.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        popped
    }

    /// Spins until a value is available, then pops.
    ///
    /// Returns `None` on timeout.
    #[must_use]
    pub fn pop_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            if let Some(value) = self.pop() {
                return Some(value);
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                return None;
            }
            std::hint::spin_loop();
        }
    }

    /// Approximate number of values in the queue.
    ///
    /// Exact only at quiescence; concurrent operations may be counted
    /// before or after they become visible.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Approximate emptiness check; see [`len`](Self::len).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Ord + Clone> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
