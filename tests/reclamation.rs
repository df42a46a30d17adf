//! Reclamation bounds at quiescence.
//!
//! After every thread quiesces and one final scan runs, the hazard
//! domain must have reclaimed every retired allocation exactly once:
//! nothing leaks past the retired list and nothing is freed twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use serial_test::serial;

use cascade::{HazardDomain, PriorityQueue};

static DELETED: AtomicUsize = AtomicUsize::new(0);

unsafe fn counting_deleter(ptr: *mut u8) {
    DELETED.fetch_add(1, Ordering::Relaxed);
    // SAFETY: every pointer retired by these tests is a leaked Box<u64>.
    drop(unsafe { Box::from_raw(ptr.cast::<u64>()) });
}

#[test]
#[serial]
fn deleters_run_exactly_once_across_threads() {
    const THREADS: usize = 8;
    const RETIRES_PER_THREAD: usize = 1_250;

    let domain = Arc::new(HazardDomain::with_capacity(128));
    let before = DELETED.load(Ordering::Relaxed);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let domain = Arc::clone(&domain);
            thread::spawn(move || {
                for value in 0..RETIRES_PER_THREAD as u64 {
                    let ptr = Box::into_raw(Box::new(value));
                    // SAFETY: the box was never shared; the deleter frees
                    // it exactly once when no hazard names it.
                    unsafe { domain.retire(ptr.cast(), counting_deleter) };
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("retiring thread");
    }

    domain.scan();
    assert_eq!(domain.retired_len(), 0, "retired list must drain");
    assert_eq!(
        DELETED.load(Ordering::Relaxed) - before,
        THREADS * RETIRES_PER_THREAD,
        "every deleter runs exactly once",
    );
}

#[test]
#[serial]
fn queue_drain_leaves_no_retired_nodes() {
    const PRODUCERS: usize = 2;
    const CONSUMERS: usize = 8;
    const PUSHES_PER_PRODUCER: u64 = 5_000;

    let domain = Arc::new(HazardDomain::with_capacity(128));
    let queue = Arc::new(PriorityQueue::with_domain(Arc::clone(&domain)));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..PUSHES_PER_PRODUCER {
                    queue.push(i * PRODUCERS as u64 + id as u64).expect("node allocation");
                }
            })
        })
        .collect();
    for handle in producers {
        handle.join().expect("producer thread");
    }

    let drained = Arc::new(AtomicUsize::new(0));
    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let drained = Arc::clone(&drained);
            thread::spawn(move || {
                while queue.pop().is_some() {
                    drained.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for handle in consumers {
        handle.join().expect("consumer thread");
    }

    assert_eq!(
        drained.load(Ordering::Relaxed) as u64,
        PRODUCERS as u64 * PUSHES_PER_PRODUCER,
    );
    assert!(queue.is_empty());

    // Worker threads released their hazard slots on exit and this thread
    // cleared its own after every operation, so a final scan reclaims
    // the entire retired set.
    domain.scan();
    assert_eq!(domain.retired_len(), 0, "retirement must be bounded at quiescence");
}

#[test]
#[serial]
fn dropping_the_queue_releases_outstanding_values() {
    let domain = Arc::new(HazardDomain::with_capacity(128));
    {
        let queue = PriorityQueue::with_domain(Arc::clone(&domain));
        for i in 0..1_000u64 {
            queue.push(i).expect("node allocation");
        }
        // Pop a few so some nodes go through retirement, then drop the
        // queue with most values still linked.
        for expected in 0..10 {
            assert_eq!(queue.pop(), Some(expected));
        }
    }
    domain.scan();
    assert_eq!(domain.retired_len(), 0);
}
