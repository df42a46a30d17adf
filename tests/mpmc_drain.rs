//! Multi-producer multi-consumer stress tests.
//!
//! Checks the queue's end-to-end contract under real thread contention:
//! every pushed value is popped exactly once, each consumer observes a
//! non-decreasing sequence, and a full drain leaves the queue empty.
//!
//! Run with: cargo test --release --test mpmc_drain

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use serial_test::serial;

use cascade::{PriorityQueue, Timeout};

const PRODUCERS: usize = 4;
const CONSUMERS: usize = 4;
const PUSHES_PER_PRODUCER: usize = 25_000;

/// Spawns `PRODUCERS` threads pushing random 32-bit keys and `CONSUMERS`
/// threads draining until the producers are done and the queue is empty.
/// Returns (pushed values per producer, popped values per consumer).
fn run_drain(queue: &Arc<PriorityQueue<u32>>) -> (Vec<Vec<u32>>, Vec<Vec<u32>>) {
    let done = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let queue = Arc::clone(queue);
            thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(0x5EED ^ id as u64);
                let mut pushed = Vec::with_capacity(PUSHES_PER_PRODUCER);
                for _ in 0..PUSHES_PER_PRODUCER {
                    let value = rng.next_u32();
                    queue.push(value).expect("node allocation");
                    pushed.push(value);
                }
                pushed
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(queue);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut popped = Vec::new();
                loop {
                    match queue.pop() {
                        Some(value) => popped.push(value),
                        None => {
                            if done.load(Ordering::Acquire) && queue.is_empty() {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                }
                popped
            })
        })
        .collect();

    let pushed: Vec<Vec<u32>> = producers
        .into_iter()
        .map(|h| h.join().expect("producer thread"))
        .collect();
    done.store(true, Ordering::Release);
    let popped: Vec<Vec<u32>> = consumers
        .into_iter()
        .map(|h| h.join().expect("consumer thread"))
        .collect();

    (pushed, popped)
}

#[test]
#[serial]
fn mpmc_drain_preserves_multiset() {
    let queue = Arc::new(PriorityQueue::new());
    let (pushed, popped) = run_drain(&queue);

    let mut all_pushed: Vec<u32> = pushed.into_iter().flatten().collect();
    let mut all_popped: Vec<u32> = popped.iter().flatten().copied().collect();
    assert_eq!(all_pushed.len(), PRODUCERS * PUSHES_PER_PRODUCER);
    assert_eq!(all_popped.len(), all_pushed.len(), "push/pop conservation");

    all_pushed.sort_unstable();
    all_popped.sort_unstable();
    assert_eq!(all_pushed, all_popped, "popped multiset differs from pushed");

    // Per-consumer local monotonicity: each consumer's successful pops
    // form a non-decreasing sequence.
    for (consumer, values) in popped.iter().enumerate() {
        for window in values.windows(2) {
            assert!(
                window[0] <= window[1],
                "consumer {consumer} saw {} after {}",
                window[1],
                window[0],
            );
        }
    }

    assert!(queue.is_empty());
    assert_eq!(queue.pop(), None);
}

#[test]
#[serial]
fn interleaved_producer_and_consumer() {
    let queue = Arc::new(PriorityQueue::new());
    let total = 1_000u64;

    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            for value in 1..=total {
                queue.push(value).expect("node allocation");
            }
        })
    };

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut received = Vec::with_capacity(total as usize);
            while received.len() < total as usize {
                if let Some(value) = queue.pop_blocking(Timeout::Duration(Duration::from_secs(30)))
                {
                    received.push(value);
                } else {
                    panic!("consumer starved while the producer was active");
                }
            }
            received
        })
    };

    producer.join().expect("producer thread");
    let received = consumer.join().expect("consumer thread");

    assert_eq!(received.len() as u64, total);
    let mut sorted = received.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (1..=total).collect::<Vec<_>>());
    assert!(queue.is_empty());
    assert_eq!(queue.pop(), None);
}

#[test]
#[serial]
fn concurrent_inserts_stay_reachable_at_every_level() {
    // Concurrent splicing must leave every node reachable from the head
    // regardless of tower height; a sequential drain afterwards recovers
    // the exact sorted multiset, which fails if any level lost a node.
    let queue = Arc::new(PriorityQueue::new());
    let per_thread = 10_000u64;

    let handles: Vec<_> = (0..4)
        .map(|id| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                // Interleaved key ranges force neighbors to come from
                // different threads at every level.
                for i in 0..per_thread {
                    queue.push(i * 4 + id).expect("node allocation");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("producer thread");
    }

    assert_eq!(queue.len() as u64, per_thread * 4);
    let mut previous = None;
    let mut drained = 0u64;
    while let Some(value) = queue.pop() {
        if let Some(p) = previous {
            assert!(p <= value, "drain went backwards: {p} then {value}");
        }
        previous = Some(value);
        drained += 1;
    }
    assert_eq!(drained, per_thread * 4);
}

#[test]
#[serial]
fn duplicate_keys_under_contention() {
    let queue = Arc::new(PriorityQueue::new());
    let per_thread = 5_000usize;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for _ in 0..per_thread {
                    queue.push(7u32).expect("node allocation");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("producer thread");
    }

    let mut drained = 0usize;
    while queue.pop() == Some(7) {
        drained += 1;
    }
    assert_eq!(drained, per_thread * 4);
    assert!(queue.is_empty());
}
