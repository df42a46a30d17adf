//! cascade: a concurrent skiplist min-priority queue.
//!
//! Multiple producers insert with [`PriorityQueue::push`]; multiple
//! consumers take the smallest element with [`PriorityQueue::pop`]. No
//! operation holds a lock: progress comes from single-word atomic
//! updates plus cooperative helping, and removed nodes are reclaimed
//! through the hazard-pointer [`HazardDomain`] so no traversal ever
//! touches freed memory.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use cascade::PriorityQueue;
//!
//! let queue = Arc::new(PriorityQueue::new());
//!
//! let producer = {
//!     let queue = Arc::clone(&queue);
//!     std::thread::spawn(move || {
//!         for i in (0..100u64).rev() {
//!             queue.push(i).expect("allocation");
//!         }
//!     })
//! };
//! producer.join().unwrap();
//!
//! assert_eq!(queue.pop(), Some(0));
//! assert_eq!(queue.len(), 99);
//! ```

pub mod hazard;
pub mod pq;

pub(crate) mod trace;

#[doc(inline)]
pub use hazard::HazardDomain;
#[doc(inline)]
pub use pq::{PriorityQueue, PushError, Timeout};

pub use trace::init_tracing;
