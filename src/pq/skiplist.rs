//! Core lock-free skiplist algorithm.
//!
//! This module provides the ordered-list machinery behind
//! [`crate::pq::PriorityQueue`]: the descending traversal, the
//! multi-level splice, and the freeze-then-unlink removal that feeds
//! retired nodes to the hazard domain.
//!
//! # Protocol
//!
//! - Insertion linearizes at the level-0 CAS; higher levels are stitched
//!   afterwards and `fully_linked` is release-stored last.
//! - Removal linearizes at the `marked` false→true CAS. The winner owns
//!   unlinking and retirement; every traversal cooperatively unlinks
//!   condemned nodes it walks across.
//! - Unlinking a node at a level is two-phase. First the node's forward
//!   pointer is *frozen* by tagging its low bit, which makes every
//!   splice behind the node fail (splices expect an untagged word).
//!   Only then is the predecessor swung past the node. Without the
//!   freeze, an insert could slip between reading the successor and
//!   swinging the predecessor and be lost off the chain.
//! - A node is retired only once it is unreachable from the head, so a
//!   validated hazard always denotes a node whose successor pointers
//!   still lead back into the list.
//!
//! # Hazard discipline
//!
//! Traversals rotate the thread's three leased slots (pred, curr, succ)
//! along the walk: every pointer is published (stripped of its tag) and
//! re-validated against its source before the first dereference, and an
//! already-protected pointer moves between slots with a plain publish.
//! The head and tail sentinels live as long as the queue and are never
//! marked, frozen, or retired.

use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::hazard::HazardDomain;
use crate::hazard::domain::SlotLease;
use crate::trace::trace;

use super::node::{
    LEVELS, MAX_LEVEL, Node, alloc_node, dealloc_node, drop_node, is_frozen, random_level, strip,
    tag_frozen, take_back,
};

/// Lease-local slot roles for the traversal rotation.
const PRED: usize = 0;
const CURR: usize = 1;
const SUCC: usize = 2;

/// Spins between reloads while an inserter finishes stitching, yielding
/// the core every `SPINS_BEFORE_YIELD` iterations.
const SPINS_BEFORE_YIELD: u32 = 64;

fn backoff(spins: &mut u32) {
    *spins = spins.wrapping_add(1);
    if *spins % SPINS_BEFORE_YIELD == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

/// The skiplist: head/tail sentinels plus the domain nodes retire into.
pub(crate) struct SkipList<T> {
    head: NonNull<Node<T>>,
    tail: NonNull<Node<T>>,
    domain: Arc<HazardDomain>,
}

// SAFETY: all cross-thread state is atomic (tower pointers, flags), node
// values are written once before publication and only read until the
// storage is reclaimed, and reclamation itself is fenced by the hazard
// protocol. T: Send because values are dropped and moved on foreign
// threads; T: Sync because traversals compare values through shared
// references.
unsafe impl<T: Send + Sync> Send for SkipList<T> {}
unsafe impl<T: Send + Sync> Sync for SkipList<T> {}

impl<T> SkipList<T> {
    /// Allocates the sentinels and links head→tail at every level.
    pub(crate) fn new(domain: Arc<HazardDomain>) -> Self {
        let head = match alloc_node::<T>(None, MAX_LEVEL) {
            Ok(node) => node,
            Err(_) => std::alloc::handle_alloc_error(std::alloc::Layout::new::<Node<T>>()),
        };
        let tail = match alloc_node::<T>(None, MAX_LEVEL) {
            Ok(node) => node,
            Err(_) => std::alloc::handle_alloc_error(std::alloc::Layout::new::<Node<T>>()),
        };
        for level in 0..LEVELS {
            // SAFETY: both sentinels are freshly allocated and private.
            unsafe {
                (*head.as_ptr()).next[level].store(tail.as_ptr(), Ordering::Relaxed);
            }
        }
        Self { head, tail, domain }
    }

    pub(crate) fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }
}

/// Publishes the stripped form of `*src` in a hazard slot, re-reading
/// until the raw word is stable. Returns the raw word: navigation uses
/// [`strip`] of it, the freeze check uses its tag bit, and CAS expected
/// values use it verbatim.
fn protect_link<T>(lease: &SlotLease, role: usize, src: &AtomicPtr<Node<T>>) -> *mut Node<T> {
    let mut raw = src.load(Ordering::Acquire);
    loop {
        lease.publish(role, strip(raw));
        let reread = src.load(Ordering::Acquire);
        if reread == raw {
            return raw;
        }
        raw = reread;
    }
}

impl<T: Ord + Clone> SkipList<T> {
    /// Descends from `MAX_LEVEL` to `stop_level`, returning the
    /// predecessor/successor pair at `stop_level` with both pointers
    /// still hazard-protected (pred in the pred slot, successor in the
    /// curr slot). Every returned pointer is untagged.
    ///
    /// At each level the walk advances past nodes ordered strictly below
    /// `key` and cooperatively freezes-and-unlinks any condemned node it
    /// meets; interference restarts the walk from the head (a tagged
    /// word read out of a predecessor means that predecessor is being
    /// unlinked itself and is no longer worth CASing through).
    ///
    /// When `record` is given, the pair observed at every level is
    /// written into the arrays.
    fn walk(
        &self,
        key: &T,
        lease: &SlotLease,
        stop_level: usize,
        mut record: Option<(&mut [*mut Node<T>; LEVELS], &mut [*mut Node<T>; LEVELS])>,
    ) -> (*mut Node<T>, *mut Node<T>) {
        let tail = self.tail.as_ptr();

        'restart: loop {
            let mut pred = self.head.as_ptr();
            lease.publish(PRED, pred);

            let mut level = MAX_LEVEL;
            loop {
                // SAFETY: pred is the head sentinel or protected by the
                // pred slot; either way its tower is dereferenceable.
                let mut curr = protect_link(lease, CURR, unsafe { &(*pred).next[level] });
                if is_frozen(curr) {
                    // pred is being unlinked at this level.
                    continue 'restart;
                }
                loop {
                    if curr == tail {
                        break;
                    }
                    // SAFETY: curr is untagged, protected, not a sentinel.
                    let succ = protect_link(lease, SUCC, unsafe { &(*curr).next[level] });

                    let condemned =
                        is_frozen(succ) || unsafe { (*curr).marked.load(Ordering::Acquire) };
                    if condemned {
                        // Freeze curr's forward pointer if its owner has
                        // not yet, then help swing pred past it.
                        if !is_frozen(succ) {
                            let frozen = unsafe {
                                (*curr).next[level]
                                    .compare_exchange(
                                        succ,
                                        tag_frozen(succ),
                                        Ordering::AcqRel,
                                        Ordering::Acquire,
                                    )
                                    .is_ok()
                            };
                            if !frozen {
                                // A late splice landed behind curr;
                                // re-read the successor and try again.
                                continue;
                            }
                        }
                        let next = strip(succ);
                        // SAFETY: pred is protected by the pred slot.
                        let helped = unsafe {
                            (*pred).next[level]
                                .compare_exchange(
                                    curr,
                                    next,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                        };
                        if helped {
                            curr = next;
                            lease.publish(CURR, curr);
                            continue;
                        }
                        // pred moved under us; rewalk this level.
                        curr = protect_link(lease, CURR, unsafe { &(*pred).next[level] });
                        if is_frozen(curr) {
                            continue 'restart;
                        }
                        continue;
                    }

                    // SAFETY: curr is protected and nodes keep their
                    // value until reclamation, so the read is backed.
                    if unsafe { (*curr).value.assume_init_ref() } < key {
                        pred = curr;
                        lease.publish(PRED, pred);
                        curr = strip(succ);
                        lease.publish(CURR, curr);
                    } else {
                        break;
                    }
                }

                if let Some((preds, succs)) = record.as_mut() {
                    preds[level] = pred;
                    succs[level] = curr;
                }
                if level == stop_level {
                    return (pred, curr);
                }
                level -= 1;
            }
        }
    }

    /// Fills `preds`/`succs` for `key` at every level and reports whether
    /// the level-0 successor carries exactly `key`. Neither insert nor
    /// removal depends on the report; it exists for parity with the
    /// classic traversal contract.
    pub(crate) fn find(
        &self,
        key: &T,
        lease: &SlotLease,
        preds: &mut [*mut Node<T>; LEVELS],
        succs: &mut [*mut Node<T>; LEVELS],
    ) -> bool {
        let (_, curr) = self.walk(key, lease, 0, Some((preds, succs)));
        // SAFETY: curr is protected by the curr slot; tail checked first.
        curr != self.tail.as_ptr() && unsafe { (*curr).value.assume_init_ref() } == key
    }

    /// Splices a new node carrying `value` at a randomly drawn height.
    ///
    /// Returns the value on allocator exhaustion; the list is unchanged
    /// in that case.
    pub(crate) fn insert(&self, value: T, lease: &SlotLease) -> Result<(), T> {
        let top_level = random_level();
        let mut preds = [ptr::null_mut(); LEVELS];
        let mut succs = [ptr::null_mut(); LEVELS];
        let mut value = value;

        let node = loop {
            let _ = self.find(&value, lease, &mut preds, &mut succs);
            let node = match alloc_node(Some(value), top_level) {
                Ok(node) => node,
                Err(returned) => {
                    return Err(returned.expect("insert allocation carries a value"));
                }
            };
            // Still private; no other thread can observe these stores.
            for level in 0..=top_level {
                // SAFETY: node is unpublished.
                unsafe {
                    (*node.as_ptr()).next[level].store(succs[level], Ordering::Relaxed);
                }
            }

            // The walk's final descent still protects the level-0 pair,
            // so the linearizing CAS never touches reclaimed memory. If
            // pred's forward pointer was frozen in the meantime, the
            // untagged expected value makes the CAS fail and we refind.
            let (pred, succ) = (preds[0], succs[0]);
            // SAFETY: pred is protected by the pred slot.
            let spliced = unsafe {
                (*pred).next[0]
                    .compare_exchange(succ, node.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            };
            if spliced {
                break node;
            }
            // SAFETY: the CAS failed, so the node was never published.
            value = unsafe { take_back(node) };
            trace!("level-0 splice lost the race; refinding");
        };

        // Reachable at level 0 now, but fully_linked is still false: no
        // consumer may mark it, so nothing can condemn it mid-stitch.
        // SAFETY: value bytes are immutable while the node is live.
        let key = unsafe { (*node.as_ptr()).value.assume_init_ref() };
        for level in 1..=top_level {
            loop {
                let (pred, succ) = self.walk(key, lease, level, None);
                // Refresh the forward pointer to the successor observed
                // by this attempt before trying to swing pred.
                // SAFETY: node's tower entry at an unstitched level is
                // only read by others after the splice below succeeds.
                unsafe {
                    (*node.as_ptr()).next[level].store(succ, Ordering::Relaxed);
                }
                // SAFETY: pred is protected by the pred slot.
                let spliced = unsafe {
                    (*pred).next[level]
                        .compare_exchange(succ, node.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                };
                if spliced {
                    break;
                }
            }
        }

        // SAFETY: node is alive; this is the publication barrier that
        // makes it eligible for removal.
        unsafe {
            (*node.as_ptr()).fully_linked.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Marks, unlinks, and retires the leftmost fully-linked node,
    /// returning a clone of its value.
    pub(crate) fn remove_min(&self, lease: &SlotLease) -> Option<T> {
        let head = self.head.as_ptr();
        let tail = self.tail.as_ptr();
        let mut spins = 0u32;
        loop {
            // SAFETY: head lives as long as the queue, and its forward
            // pointers always hold untagged words (the head is never
            // condemned).
            let candidate = protect_link(lease, CURR, unsafe { &(*head).next[0] });
            if candidate == tail {
                return None;
            }

            // SAFETY: candidate is protected by the curr slot.
            if !unsafe { (*candidate).fully_linked.load(Ordering::Acquire) } {
                // The inserter is between its level-0 splice and its
                // publication store; re-read shortly.
                backoff(&mut spins);
                continue;
            }

            let won = unsafe {
                (*candidate)
                    .marked
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            };
            if !won {
                // Another consumer owns this node; take the next minimum.
                continue;
            }

            trace!("marked minimum for removal");
            // The winning CAS transfers unlink-and-retire ownership; from
            // here the node cannot be freed under us, hazards aside.
            // SAFETY: the value stays initialized until the deleter runs.
            let value = unsafe { (*candidate).value.assume_init_ref() }.clone();
            self.unlink(candidate, lease);
            // SAFETY: unlink returned, so the node is unreachable from
            // the head and can never be re-linked; the deleter drops the
            // value and frees the storage exactly once.
            unsafe {
                self.domain.retire(candidate.cast::<u8>(), retire_node::<T>);
            }
            return Some(value);
        }
    }

    /// Unlinks a marked node from every level it occupies, top down.
    ///
    /// Per level: freeze the node's forward pointer, then walk the level
    /// by identity (past smaller keys and past equal keys that are not
    /// the node) and swing its live predecessor. A level is left only
    /// once the node is verifiably absent from it; with duplicate keys a
    /// failed swing can mean an equal-key insert landed ahead of the
    /// node, not that a helper finished the job. Only after the last
    /// level is clear may the caller retire the node.
    fn unlink(&self, node: *mut Node<T>, lease: &SlotLease) {
        let tail = self.tail.as_ptr();
        // SAFETY: the caller owns the marked node.
        let top_level = unsafe { (*node).top_level };
        let key = unsafe { (*node).value.assume_init_ref() };

        for level in (0..=top_level).rev() {
            // Freeze first: after this loop no splice can land behind
            // the node at this level, so the successor we unlink to is
            // final.
            let frozen_next = loop {
                // SAFETY: we own the marked node.
                let raw = unsafe { (*node).next[level].load(Ordering::Acquire) };
                if is_frozen(raw) {
                    break strip(raw);
                }
                let froze = unsafe {
                    (*node).next[level]
                        .compare_exchange(
                            raw,
                            tag_frozen(raw),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                };
                if froze {
                    break raw;
                }
            };

            'level: loop {
                let mut pred = self.head.as_ptr();
                lease.publish(PRED, pred);
                // SAFETY: head is never condemned; its links are untagged.
                let mut curr = protect_link(lease, CURR, unsafe { &(*pred).next[level] });
                loop {
                    if curr == tail {
                        // Walked the whole level without meeting the
                        // node: a helper finished this level already.
                        break 'level;
                    }
                    if curr == node {
                        // SAFETY: pred is protected by the pred slot; a
                        // successful swing through a live predecessor
                        // removes the node from this level for good (a
                        // frozen predecessor holds a tagged word and
                        // fails the untagged comparison).
                        let unlinked = unsafe {
                            (*pred).next[level]
                                .compare_exchange(
                                    curr,
                                    frozen_next,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                        };
                        if unlinked {
                            break 'level;
                        }
                        continue 'level;
                    }

                    // SAFETY: curr is untagged, protected, not a sentinel.
                    let succ = protect_link(lease, SUCC, unsafe { &(*curr).next[level] });
                    let condemned =
                        is_frozen(succ) || unsafe { (*curr).marked.load(Ordering::Acquire) };
                    if condemned {
                        if !is_frozen(succ) {
                            let froze = unsafe {
                                (*curr).next[level]
                                    .compare_exchange(
                                        succ,
                                        tag_frozen(succ),
                                        Ordering::AcqRel,
                                        Ordering::Acquire,
                                    )
                                    .is_ok()
                            };
                            if !froze {
                                continue;
                            }
                        }
                        let next = strip(succ);
                        // SAFETY: pred is protected by the pred slot.
                        let helped = unsafe {
                            (*pred).next[level]
                                .compare_exchange(
                                    curr,
                                    next,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                        };
                        if helped {
                            curr = next;
                            lease.publish(CURR, curr);
                            continue;
                        }
                        continue 'level;
                    }

                    // Advance through smaller keys and through equal keys
                    // that are not the node itself.
                    // SAFETY: values stay readable until reclamation.
                    if unsafe { (*curr).value.assume_init_ref() } <= key {
                        pred = curr;
                        lease.publish(PRED, pred);
                        curr = strip(succ);
                        lease.publish(CURR, curr);
                    } else {
                        // Past the key's run: the node is absent here.
                        break 'level;
                    }
                }
            }
        }
    }
}

/// Deleter handed to the hazard domain: drops the (still present) value
/// and frees the node storage.
unsafe fn retire_node<T>(ptr: *mut u8) {
    unsafe { drop_node(ptr.cast::<Node<T>>()) };
}

impl<T> Drop for SkipList<T> {
    /// Frees every node reachable at level 0 plus both sentinels.
    ///
    /// Callers guarantee quiescence by owning the list exclusively; any
    /// node still on the chain carries a live value and is dropped in
    /// place. Nodes already handed to the domain are reclaimed by the
    /// domain, not here.
    fn drop(&mut self) {
        let tail = self.tail.as_ptr();
        // SAFETY: exclusive access; the chain is immutable now. Links
        // out of reachable nodes are untagged (a frozen node is either
        // already off the chain and owned by the domain, or mid-removal,
        // which quiescence rules out).
        unsafe {
            let mut node = strip((*self.head.as_ptr()).next[0].load(Ordering::Relaxed));
            dealloc_node(self.head.as_ptr());
            while node != tail {
                let next = strip((*node).next[0].load(Ordering::Relaxed));
                drop_node(node);
                node = next;
            }
            dealloc_node(tail);
        }
    }
}
