use core::fmt::{self, Debug, Formatter};
use core::ptr;
use core::sync::atomic::Ordering::Relaxed;

use crate::cfg::atomic::{AtomicBool, AtomicPtr};

/// A waiter's position in an MCS queue.
///
/// A node links to its successor through `next`, and its owner spins on its
/// own `locked` flag until the predecessor clears it. The node must stay at a
/// fixed address from the moment it is queued until its owner releases the
/// lock, so it is always reached through a shared reference and every field
/// is atomic.
pub struct QueueNode {
    pub(super) next: AtomicPtr<QueueNode>,
    pub(super) locked: AtomicBool,
}

impl QueueNode {
    /// Creates a new, unlinked and unlocked node (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        let next = AtomicPtr::new(ptr::null_mut());
        let locked = AtomicBool::new(false);
        Self { next, locked }
    }

    /// Creates a new, unlinked and unlocked Loom based node (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        let next = AtomicPtr::new(ptr::null_mut());
        let locked = AtomicBool::new(false);
        Self { next, locked }
    }

    /// Returns this node as the raw pointer stored in queue links.
    pub(super) fn as_ptr(&self) -> *mut Self {
        ptr::addr_of!(*self).cast_mut()
    }
}

impl Default for QueueNode {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for QueueNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueNode")
            .field("next", &self.next.load(Relaxed))
            .field("locked", &self.locked.load(Relaxed))
            .finish()
    }
}
