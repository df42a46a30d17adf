//! Hazard-pointer domain: protected-pointer registry and deferred reclamation.
//!
//! A [`HazardDomain`] owns a fixed array of hazard slots and a list of
//! retired allocations. Readers publish a pointer into a slot before
//! dereferencing it; reclaimers only free an allocation once no slot
//! names it. The protocol is the classic publish / re-validate rendezvous:
//!
//! 1. Reader loads `*src`, stores the pointer into its slot (release),
//!    then re-reads `*src` (acquire). It retries until both observations
//!    agree; from then on the pointee cannot be freed under it.
//! 2. A reclaimer snapshots every slot (acquire) during [`scan`] and
//!    keeps any retired entry whose pointer appears in the snapshot.
//!
//! The only lock in the crate lives here: a mutex over the retired list,
//! held for O(retired + slots) and never across user code that could
//! re-enter the domain.
//!
//! [`scan`]: HazardDomain::scan

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::trace::{debug, error, info, trace, warn};

/// Default number of hazard slots in a domain.
///
/// Each thread leases [`SLOTS_PER_THREAD`] slots on first use, so the
/// default supports 42 concurrent threads per domain. The retired list
/// is scanned whenever it grows past the slot count.
pub const DEFAULT_SLOT_CAPACITY: usize = 128;

/// Hazard slots leased to each thread: one per traversal role
/// (predecessor, current, successor).
pub const SLOTS_PER_THREAD: usize = 3;

/// A deferred deallocation: the address plus its type-erased deleter.
struct Retired {
    ptr: *mut u8,
    deleter: unsafe fn(*mut u8),
}

// SAFETY: a Retired entry is the sole handle to an allocation that is no
// longer reachable from any shared structure; moving it between threads
// transfers that ownership.
unsafe impl Send for Retired {}

/// One hazard slot: the published pointer plus a claim flag used by the
/// slot-leasing protocol.
struct Slot {
    protected: AtomicPtr<u8>,
    claimed: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            protected: AtomicPtr::new(ptr::null_mut()),
            claimed: AtomicBool::new(false),
        }
    }
}

/// Registry of protected pointers and deferred deletions.
///
/// Construct one per logical group of queues with [`HazardDomain::new`] /
/// [`HazardDomain::with_capacity`], or share the lazily-initialized
/// process-wide instance from [`HazardDomain::global`].
pub struct HazardDomain {
    slots: Box<[Slot]>,
    retired: Mutex<Vec<Retired>>,
}

impl HazardDomain {
    /// Creates a domain with [`DEFAULT_SLOT_CAPACITY`] hazard slots.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SLOT_CAPACITY)
    }

    /// Creates a domain with `capacity` hazard slots.
    ///
    /// `capacity / SLOTS_PER_THREAD` threads can operate on the domain's
    /// queues concurrently. The retired list triggers an inline [`scan`]
    /// once it grows past `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity < SLOTS_PER_THREAD` (no thread could ever
    /// lease its slots).
    ///
    /// [`scan`]: HazardDomain::scan
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity >= SLOTS_PER_THREAD,
            "hazard domain capacity {capacity} cannot fit a single thread's {SLOTS_PER_THREAD} slots",
        );
        Self {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Returns the process-wide domain, created on first use.
    pub fn global() -> &'static Arc<HazardDomain> {
        static GLOBAL: OnceLock<Arc<HazardDomain>> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            info!(capacity = DEFAULT_SLOT_CAPACITY, "global hazard domain initialized");
            Arc::new(HazardDomain::new())
        })
    }

    /// Number of hazard slots in this domain.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of retired allocations not yet reclaimed.
    ///
    /// Observational only; another thread may retire or scan concurrently.
    #[must_use]
    pub fn retired_len(&self) -> usize {
        self.retired
            .lock()
            .expect("hazard domain mutex poisoned")
            .len()
    }

    /// Publishes `*src` in `slot` and re-reads `src` until both agree.
    ///
    /// The returned pointer stays dereferenceable until the slot is
    /// overwritten or cleared. The release store followed by the acquire
    /// re-read guarantees that once the check passes, any retirer's
    /// subsequent [`scan`] observes the publication.
    ///
    /// [`scan`]: HazardDomain::scan
    pub(crate) fn protect<T>(&self, slot: usize, src: &AtomicPtr<T>) -> *mut T {
        let mut ptr = src.load(Ordering::Acquire);
        loop {
            self.slots[slot]
                .protected
                .store(ptr.cast::<u8>(), Ordering::Release);
            let reread = src.load(Ordering::Acquire);
            if reread == ptr {
                return ptr;
            }
            ptr = reread;
        }
    }

    /// Publishes an already-protected pointer into another slot.
    ///
    /// Used to rotate protection along a traversal (pred ← curr ← succ).
    /// The caller must currently protect `ptr` through a different slot
    /// of its lease, so no validation re-read is needed.
    pub(crate) fn publish<T>(&self, slot: usize, ptr: *mut T) {
        self.slots[slot]
            .protected
            .store(ptr.cast::<u8>(), Ordering::Release);
    }

    /// Resets `slot` to null.
    pub(crate) fn clear(&self, slot: usize) {
        self.slots[slot]
            .protected
            .store(ptr::null_mut(), Ordering::Release);
    }

    /// Defers deallocation of `ptr` until no hazard slot names it.
    ///
    /// Runs an inline [`scan`] when the retired list outgrows the slot
    /// capacity, so the list length is bounded by `capacity` plus the
    /// number of concurrently protected pointers.
    ///
    /// # Safety
    ///
    /// `ptr` must no longer be reachable from any shared structure (new
    /// readers must be unable to obtain it), `deleter(ptr)` must be sound
    /// once no hazard slot holds `ptr`, and `ptr` must not be retired
    /// twice.
    ///
    /// [`scan`]: HazardDomain::scan
    pub unsafe fn retire(&self, ptr: *mut u8, deleter: unsafe fn(*mut u8)) {
        let mut retired = self.retired.lock().expect("hazard domain mutex poisoned");
        retired.push(Retired { ptr, deleter });
        if retired.len() > self.slots.len() {
            self.scan_locked(&mut retired);
        }
    }

    /// Reclaims every retired allocation not currently protected.
    ///
    /// Entries whose pointer appears in the hazard snapshot stay on the
    /// list for a later scan.
    pub fn scan(&self) {
        let mut retired = self.retired.lock().expect("hazard domain mutex poisoned");
        self.scan_locked(&mut retired);
    }

    fn scan_locked(&self, retired: &mut Vec<Retired>) {
        let mut hazards: Vec<*mut u8> = Vec::with_capacity(self.slots.len());
        for slot in self.slots.iter() {
            let ptr = slot.protected.load(Ordering::Acquire);
            if !ptr.is_null() {
                hazards.push(ptr);
            }
        }

        let before = retired.len();
        retired.retain(|entry| {
            if hazards.contains(&entry.ptr) {
                true
            } else {
                // SAFETY: the entry's pointer is unreachable (retire
                // contract) and absent from the snapshot; the publish /
                // re-validate protocol means no reader can still hold it.
                unsafe { (entry.deleter)(entry.ptr) };
                false
            }
        });

        debug!(reclaimed = before - retired.len(), kept = retired.len(), "hazard scan");
        if retired.len() > self.slots.len() {
            warn!(
                retired = retired.len(),
                capacity = self.slots.len(),
                "retired list exceeds slot capacity after scan"
            );
        }
    }
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardDomain {
    fn drop(&mut self) {
        // Exclusive ownership: no reader can hold a slot anymore, so
        // every remaining entry is reclaimable.
        let retired = self
            .retired
            .get_mut()
            .expect("hazard domain mutex poisoned");
        for entry in retired.drain(..) {
            // SAFETY: see above; drop order guarantees quiescence.
            unsafe { (entry.deleter)(entry.ptr) };
        }
    }
}

/// A thread's claim on [`SLOTS_PER_THREAD`] hazard slots of one domain.
///
/// Leases are handed out on a thread's first operation against a domain
/// and cached in thread-local storage; the thread-exit destructor clears
/// the slots and returns them to the domain. Claiming is lock-free: a
/// CAS per slot flag.
pub(crate) struct SlotLease {
    domain: Arc<HazardDomain>,
    index: [usize; SLOTS_PER_THREAD],
}

impl SlotLease {
    /// Claims [`SLOTS_PER_THREAD`] free slots from `domain`.
    ///
    /// # Panics
    ///
    /// Panics when the domain has no free slots left, i.e. more than
    /// `capacity / SLOTS_PER_THREAD` threads touched the domain without
    /// terminating. Size the domain with
    /// [`HazardDomain::with_capacity`] for wider deployments.
    fn acquire(domain: Arc<HazardDomain>) -> Self {
        let mut index = [0usize; SLOTS_PER_THREAD];
        let mut found = 0;
        for (i, slot) in domain.slots.iter().enumerate() {
            if slot
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                index[found] = i;
                found += 1;
                if found == SLOTS_PER_THREAD {
                    trace!(slots = ?index, "hazard slot lease acquired");
                    return Self { domain, index };
                }
            }
        }

        // Roll back partial claims before reporting the misconfiguration.
        for &i in &index[..found] {
            domain.slots[i].claimed.store(false, Ordering::Release);
        }
        error!(
            capacity = domain.slots.len(),
            "hazard slot capacity exhausted; too many live threads for this domain"
        );
        panic!(
            "hazard domain out of slots: capacity {} supports at most {} threads",
            domain.slots.len(),
            domain.slots.len() / SLOTS_PER_THREAD,
        );
    }

    /// Publishes `*src` in the slot for `role` (see
    /// [`HazardDomain::protect`]).
    pub(crate) fn protect<T>(&self, role: usize, src: &AtomicPtr<T>) -> *mut T {
        self.domain.protect(self.index[role], src)
    }

    /// Moves an already-protected pointer into the slot for `role`.
    pub(crate) fn publish<T>(&self, role: usize, ptr: *mut T) {
        self.domain.publish(self.index[role], ptr);
    }

    /// Clears every slot of the lease. Operations call this on exit so a
    /// parked thread never pins reclamation.
    pub(crate) fn clear_all(&self) {
        for &i in &self.index {
            self.domain.clear(i);
        }
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        for &i in &self.index {
            self.domain.clear(i);
            self.domain.slots[i].claimed.store(false, Ordering::Release);
        }
        trace!(slots = ?self.index, "hazard slot lease released");
    }
}

thread_local! {
    /// The calling thread's lease for the domain it touched most
    /// recently. Replaced (old lease released) when the thread switches
    /// domains; dropped at thread exit.
    static LEASE: RefCell<Option<SlotLease>> = const { RefCell::new(None) };
}

/// Runs `f` with the calling thread's slot lease for `domain`, claiming
/// one first if needed.
pub(crate) fn with_thread_lease<R>(
    domain: &Arc<HazardDomain>,
    f: impl FnOnce(&SlotLease) -> R,
) -> R {
    LEASE.with(|cell| {
        let mut cached = cell.borrow_mut();
        let hit = matches!(&*cached, Some(lease) if Arc::ptr_eq(&lease.domain, domain));
        if !hit {
            *cached = Some(SlotLease::acquire(Arc::clone(domain)));
        }
        f(cached.as_ref().expect("lease installed above"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;

    // Shared by every test that counts reclamations; those tests are
    // marked #[serial] so the deltas stay exact.
    static RECLAIMED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn counting_deleter(ptr: *mut u8) {
        RECLAIMED.fetch_add(1, Ordering::Relaxed);
        // SAFETY: test-owned Box<u64> allocation.
        drop(unsafe { Box::from_raw(ptr.cast::<u64>()) });
    }

    fn retire_boxed(domain: &HazardDomain, value: u64) -> *mut u64 {
        let ptr = Box::into_raw(Box::new(value));
        // SAFETY: the box is unreachable from anywhere else.
        unsafe { domain.retire(ptr.cast(), counting_deleter) };
        ptr
    }

    #[test]
    fn protect_returns_stable_pointer() {
        let domain = HazardDomain::with_capacity(8);
        let boxed = Box::into_raw(Box::new(7u64));
        let src = AtomicPtr::new(boxed);

        let protected = domain.protect(0, &src);
        assert_eq!(protected, boxed);
        // SAFETY: protected and still owned by this test.
        assert_eq!(unsafe { *protected }, 7);

        domain.clear(0);
        // SAFETY: never retired; reclaim manually.
        drop(unsafe { Box::from_raw(boxed) });
    }

    #[test]
    #[serial]
    fn scan_defers_protected_pointers() {
        let domain = HazardDomain::with_capacity(8);
        let start = RECLAIMED.load(Ordering::Relaxed);

        let held = Box::into_raw(Box::new(1u64));
        let src = AtomicPtr::new(held);
        let protected = domain.protect(0, &src);
        assert_eq!(protected, held);

        // SAFETY: no reachable path to the allocation besides the slot.
        unsafe { domain.retire(held.cast(), counting_deleter) };
        retire_boxed(&domain, 2);

        domain.scan();
        assert_eq!(RECLAIMED.load(Ordering::Relaxed), start + 1);
        assert_eq!(domain.retired_len(), 1);

        domain.clear(0);
        domain.scan();
        assert_eq!(RECLAIMED.load(Ordering::Relaxed), start + 2);
        assert_eq!(domain.retired_len(), 0);
    }

    #[test]
    #[serial]
    fn overflow_triggers_inline_scan() {
        let domain = HazardDomain::with_capacity(4);
        let start = RECLAIMED.load(Ordering::Relaxed);

        for value in 0..5 {
            retire_boxed(&domain, value);
        }

        // The fifth retire pushed the list past capacity and scanned with
        // no hazards held, so everything was reclaimed.
        assert_eq!(domain.retired_len(), 0);
        assert_eq!(RECLAIMED.load(Ordering::Relaxed), start + 5);
    }

    #[test]
    #[serial]
    fn drop_reclaims_remaining() {
        let start = RECLAIMED.load(Ordering::Relaxed);
        {
            let domain = HazardDomain::with_capacity(8);
            retire_boxed(&domain, 1);
            retire_boxed(&domain, 2);
            assert_eq!(domain.retired_len(), 2);
        }
        assert_eq!(RECLAIMED.load(Ordering::Relaxed), start + 2);
    }

    #[test]
    fn global_domain_is_shared() {
        let a = Arc::clone(HazardDomain::global());
        let b = Arc::clone(HazardDomain::global());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn lease_claims_and_releases_slots() {
        let domain = Arc::new(HazardDomain::with_capacity(SLOTS_PER_THREAD));
        with_thread_lease(&domain, |lease| {
            let boxed = Box::into_raw(Box::new(3u64));
            let src = AtomicPtr::new(boxed);
            assert_eq!(lease.protect(0, &src), boxed);
            lease.clear_all();
            // SAFETY: never retired.
            drop(unsafe { Box::from_raw(boxed) });
        });

        // A second thread cannot lease while this thread's cached lease
        // holds every slot of the domain.
        let contended = Arc::clone(&domain);
        let result = std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                with_thread_lease(&contended, |_| {});
            }));
            outcome.is_err()
        })
        .join()
        .expect("thread join");
        assert!(result, "second lease on a full domain must fail");
    }
}
