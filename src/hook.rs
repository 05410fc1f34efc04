//! Filepath: src/hook.rs
//!
//! Per-node structural fields.
//!
//! Every node couples its payload with a hook holding the four structural
//! fields: `up` (parent), `prev` (previous sibling, toward the oldest),
//! `tail` (most recently inserted child) and `fan` (direct child count).
//! Children thus form an intrusive singly-linked list in
//! reverse-insertion order, threaded through the store by id.
//!
//! Two variants are selected at the tree-type level:
//!
//! - [`SequentialHook`]: plain fields, 16 bytes.
//! - [`ConcurrentHook`]: the same four fields as atomics (`fan` shrunk to
//!   16 bits), plus a one-byte spin lock guarding this node's child list
//!   and a one-byte `done` flag distinguishing a constructed slot from a
//!   merely allocated (zero-filled) one. Also 16 bytes.

use std::sync::atomic::{AtomicI16, AtomicI32, AtomicU8, Ordering};

use crate::node_id::NodeId;
use crate::spinlock::{SpinGuard, SpinLock};

/// Read access to the structural fields shared by both hook variants.
pub trait Hook {
    /// Parent id; invalid only for the sentinel and, transiently, for a
    /// freshly allocated concurrent node.
    fn up(&self) -> NodeId;

    /// Previous sibling, or invalid for the first-inserted child.
    fn prev(&self) -> NodeId;

    /// Most recently inserted child, or invalid for a leaf.
    fn tail(&self) -> NodeId;

    /// Number of direct children.
    fn fan(&self) -> usize;
}

// ============================================================================
//  SequentialHook
// ============================================================================

/// Hook of the sequential tree.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SequentialHook {
    pub(crate) up: NodeId,
    pub(crate) prev: NodeId,
    pub(crate) tail: NodeId,
    pub(crate) fan: i32,
}

impl SequentialHook {
    /// A fully unlinked hook.
    pub(crate) const fn new() -> Self {
        Self {
            up: NodeId::INVALID,
            prev: NodeId::INVALID,
            tail: NodeId::INVALID,
            fan: 0,
        }
    }

    /// Hook of a fresh child: linked upward and to its elder sibling,
    /// childless itself.
    pub(crate) const fn child_of(up: NodeId, prev: NodeId) -> Self {
        Self {
            up,
            prev,
            tail: NodeId::INVALID,
            fan: 0,
        }
    }
}

impl Default for SequentialHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Hook for SequentialHook {
    #[inline]
    fn up(&self) -> NodeId {
        self.up
    }

    #[inline]
    fn prev(&self) -> NodeId {
        self.prev
    }

    #[inline]
    fn tail(&self) -> NodeId {
        self.tail
    }

    #[inline]
    fn fan(&self) -> usize {
        debug_assert!(self.fan >= 0);
        self.fan as usize
    }
}

// ============================================================================
//  ConcurrentHook
// ============================================================================

/// Hook of the concurrent tree.
///
/// The all-zero byte pattern is a valid hook: unlinked, unlocked and not
/// yet constructed, exactly the state of a freshly claimed slot.
///
/// # Field protocols
///
/// - `done` is released by the inserting thread after the payload and
///   `up` are written; readers acquire it (spinning if necessary) before
///   trusting anything else in the slot.
/// - `tail`, `fan`, and the `prev` of a freshly published child are
///   written only under this node's `lock` when it acts as a parent.
///   `tail` is stored with release so readers that learn a child id from
///   it also observe that child's fields.
#[derive(Debug)]
pub struct ConcurrentHook {
    pub(crate) up: AtomicI32,
    pub(crate) prev: AtomicI32,
    pub(crate) tail: AtomicI32,
    pub(crate) fan: AtomicI16,
    pub(crate) lock: SpinLock,
    pub(crate) done: AtomicU8,
}

impl ConcurrentHook {
    /// Maximum fan-out of one concurrent node.
    pub const MAX_FAN: usize = i16::MAX as usize;

    pub(crate) const fn new() -> Self {
        Self {
            up: AtomicI32::new(0),
            prev: AtomicI32::new(0),
            tail: AtomicI32::new(0),
            fan: AtomicI16::new(0),
            lock: SpinLock::new(),
            done: AtomicU8::new(0),
        }
    }

    /// Whether the payload of this slot has been fully constructed.
    ///
    /// Acquire: observing `true` also makes the payload and `up` visible.
    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire) == 1
    }

    /// Publish the slot as constructed.
    ///
    /// Release: everything written to the slot before this call becomes
    /// visible to readers that observe the flag.
    #[inline]
    pub(crate) fn set_done(&self) {
        self.done.store(1, Ordering::Release);
    }

    #[inline]
    pub(crate) fn set_up(&self, up: NodeId) {
        self.up.store(up.raw(), Ordering::Relaxed);
    }

    /// Lock this node's child list for a publish.
    #[inline]
    pub(crate) fn lock_children(&self) -> SpinGuard<'_> {
        self.lock.lock()
    }

    /// Swing the child-list head to a fully prepared child. Caller holds
    /// `lock` and has already stored the child's `prev`.
    ///
    /// Release: a reader that learns `new_tail` from this store also
    /// observes the child's fields.
    #[inline]
    pub(crate) fn publish_tail(&self, new_tail: NodeId) {
        self.tail.store(new_tail.raw(), Ordering::Release);
    }

    /// Store the elder-sibling link of a child being published. Caller
    /// holds the parent's `lock`.
    #[inline]
    pub(crate) fn set_prev(&self, prev: NodeId) {
        self.prev.store(prev.raw(), Ordering::Relaxed);
    }

    /// Count one more child. Caller holds `lock`. Returns the new count.
    #[inline]
    pub(crate) fn bump_fan(&self) -> usize {
        let old = self.fan.fetch_add(1, Ordering::Relaxed);
        debug_assert!((old as usize) < Self::MAX_FAN, "fan-out bound exceeded");
        old as usize + 1
    }
}

impl Default for ConcurrentHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Hook for ConcurrentHook {
    #[inline]
    fn up(&self) -> NodeId {
        NodeId::new(self.up.load(Ordering::Relaxed))
    }

    #[inline]
    fn prev(&self) -> NodeId {
        NodeId::new(self.prev.load(Ordering::Acquire))
    }

    #[inline]
    fn tail(&self) -> NodeId {
        NodeId::new(self.tail.load(Ordering::Acquire))
    }

    #[inline]
    fn fan(&self) -> usize {
        let fan = self.fan.load(Ordering::Relaxed);
        debug_assert!(fan >= 0);
        fan as usize
    }
}
