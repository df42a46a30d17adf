//! Skiplist node layout, raw allocation, and level generation.
//!
//! Nodes are allocated by hand through [`std::alloc`] so that an
//! exhausted allocator surfaces as a recoverable push failure instead of
//! an abort. A node keeps its value until the storage is reclaimed
//! (removal hands a clone to the caller), so concurrent traversals can
//! always compare the key of a protected node, marked or not.

use std::alloc::{Layout, alloc, dealloc};
use std::cell::RefCell;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr};

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

/// Highest skiplist level; nodes participate in levels `0..=top_level`.
pub(crate) const MAX_LEVEL: usize = 16;

/// Tower height of the sentinels, and array length of every tower.
pub(crate) const LEVELS: usize = MAX_LEVEL + 1;

/// Low bit of a forward pointer, set when the pointer is frozen: the
/// owning node is being unlinked at that level and no splice may land
/// behind it anymore. `Node` contains pointers, so its alignment always
/// leaves the bit free.
const FROZEN_BIT: usize = 1;

/// Tags a forward pointer as frozen.
pub(crate) fn tag_frozen<T>(ptr: *mut Node<T>) -> *mut Node<T> {
    ((ptr as usize) | FROZEN_BIT) as *mut Node<T>
}

/// Removes the freeze tag, yielding a dereferenceable address.
pub(crate) fn strip<T>(ptr: *mut Node<T>) -> *mut Node<T> {
    ((ptr as usize) & !FROZEN_BIT) as *mut Node<T>
}

/// Whether a forward pointer carries the freeze tag.
pub(crate) fn is_frozen<T>(ptr: *mut Node<T>) -> bool {
    (ptr as usize) & FROZEN_BIT != 0
}

/// A skiplist node.
///
/// `value` is uninitialized only on the two sentinels, which are never
/// compared or removed; every other node's value is written once before
/// publication and stays in place until the storage is reclaimed.
///
/// Lifecycle flags:
/// - `fully_linked` - set once, release-ordered, after the node is
///   stitched in at every level. Consumers must not mark a node before
///   observing it true.
/// - `marked` - a single false-to-true CAS is the logical removal; the
///   winning consumer owns unlinking and retirement from then on.
#[repr(C)]
pub(crate) struct Node<T> {
    pub(crate) value: MaybeUninit<T>,
    pub(crate) top_level: usize,
    pub(crate) marked: AtomicBool,
    pub(crate) fully_linked: AtomicBool,
    pub(crate) next: [AtomicPtr<Node<T>>; LEVELS],
}

/// Allocates a node, handing the value back on allocator failure.
///
/// Sentinels pass `None` and never read `value`.
pub(crate) fn alloc_node<T>(
    value: Option<T>,
    top_level: usize,
) -> Result<NonNull<Node<T>>, Option<T>> {
    let layout = Layout::new::<Node<T>>();
    // SAFETY: Node<T> has non-zero size (it contains the tower array).
    let raw = unsafe { alloc(layout) }.cast::<Node<T>>();
    let Some(node) = NonNull::new(raw) else {
        return Err(value);
    };

    // SAFETY: `raw` is a fresh, properly aligned allocation for Node<T>.
    unsafe {
        node.as_ptr().write(Node {
            value: match value {
                Some(v) => MaybeUninit::new(v),
                None => MaybeUninit::uninit(),
            },
            top_level,
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(false),
            next: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        });
    }
    Ok(node)
}

/// Frees a node's storage without touching `value`.
///
/// # Safety
///
/// `node` must come from [`alloc_node`], must not be referenced again,
/// and its value must be uninitialized or already moved out.
pub(crate) unsafe fn dealloc_node<T>(node: *mut Node<T>) {
    unsafe { dealloc(node.cast::<u8>(), Layout::new::<Node<T>>()) };
}

/// Drops the contained value in place, then frees the storage.
///
/// # Safety
///
/// Same as [`dealloc_node`], and `value` must be initialized.
pub(crate) unsafe fn drop_node<T>(node: *mut Node<T>) {
    unsafe {
        (*node).value.assume_init_drop();
        dealloc_node(node);
    }
}

/// Moves the value back out of an unpublished node and frees it.
///
/// Used when the level-0 splice loses its race and the push retries with
/// a fresh `find`.
///
/// # Safety
///
/// The node must never have been visible to another thread.
pub(crate) unsafe fn take_back<T>(node: NonNull<Node<T>>) -> T {
    unsafe {
        let value = (*node.as_ptr()).value.assume_init_read();
        dealloc_node(node.as_ptr());
        value
    }
}

thread_local! {
    /// Per-thread generator for tower heights. Seeded independently per
    /// thread; level draws never coordinate.
    static LEVEL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

/// Draws a tower height from a geometric distribution with p = 0.5,
/// capped at [`MAX_LEVEL`].
///
/// The count of trailing one-bits in a uniform word is geometric, and
/// masking to `MAX_LEVEL` bits caps the draw without skewing lower
/// levels.
pub(crate) fn random_level() -> usize {
    LEVEL_RNG.with(|rng| {
        let bits = rng.borrow_mut().next_u64();
        (bits & ((1u64 << MAX_LEVEL) - 1)).trailing_ones() as usize
    })
}
