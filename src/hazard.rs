//! Safe memory reclamation via hazard pointers.
//!
//! This module contains the [`HazardDomain`] registry used by
//! [`crate::pq`] to defer freeing unlinked skiplist nodes until no
//! traversal can still dereference them.

pub(crate) mod domain;

pub use domain::{DEFAULT_SLOT_CAPACITY, HazardDomain, SLOTS_PER_THREAD};
