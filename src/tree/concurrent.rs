//! Filepath: src/tree/concurrent.rs
//!
//! The thread-safe rooted tree.
//!
//! Same surface as [`RootedTree`](super::RootedTree), safe under any
//! number of producers. Inserting is two phases:
//!
//! 1. **Allocation**: lock-free with respect to inserts under other
//!    parents: the backing [`VmConcurrentVec`] hands the thread a
//!    zero-filled slot; the payload and the `up` link are written, then
//!    the hook's `done` byte is published with release.
//! 2. **Publish**: serialized per *parent* only. Under the parent's
//!    one-byte spin lock the child's `prev` is pointed at the old list
//!    head, the parent's `tail` is swung to the child (release), and the
//!    parent's fan is bumped.
//!
//! Readers spin-yield on ids learned from `tail`/`prev` until the slot is
//! allocated and its `done` byte reads 1; the release/acquire pairing on
//! `done` and `tail` then guarantees a fully initialized payload and
//! hook. Traversals racing with insertion observe each child list
//! growing monotonically at its head.

use std::cell::UnsafeCell;
use std::mem::{self, MaybeUninit};

use super::cursor::{
    BreadthCursor, DepthCursor, DownCursor, InternalCursor, LeafCursor, TreeView, UpCursor,
};
use super::structure;
use crate::error::Error;
use crate::hook::{ConcurrentHook, Hook};
use crate::node_id::NodeId;
use crate::vec::{VmConcurrentVec, ZeroInit};

/// Default store capacity, in node slots. Reservation is address space
/// only, so the default is generous.
pub const DEFAULT_CAPACITY: usize = 1 << 26;

/// One slot of the concurrent store.
///
/// The payload lives behind `UnsafeCell<MaybeUninit<T>>`: it is written
/// exactly once by the thread that claimed the slot, before the hook's
/// `done` byte is released, and never mutated after.
pub(crate) struct ConcurrentNode<T> {
    pub(crate) hook: ConcurrentHook,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the zero pattern is a valid node: an unlinked, unlocked hook
// with `done == 0`, and a payload slot that `MaybeUninit` leaves free to
// hold anything.
unsafe impl<T> ZeroInit for ConcurrentNode<T> {}

// SAFETY: the payload is written only by the claiming thread before
// `done` is released, and read only after `done` is acquired; the hook
// fields are atomics. `T: Send` lets payloads cross threads, `T: Sync`
// lets readers share them.
unsafe impl<T: Send + Sync> Sync for ConcurrentNode<T> {}

impl<T> ConcurrentNode<T> {
    /// Write the payload of a freshly claimed slot.
    ///
    /// # Safety
    ///
    /// The calling thread must have claimed this slot and not yet
    /// published it (`done == 0`); nothing else may access the payload.
    #[inline]
    pub(crate) unsafe fn init_value(&self, value: T) {
        // SAFETY: exclusive access per the caller contract.
        unsafe { (*self.value.get()).write(value) };
    }

    /// Read the payload.
    ///
    /// # Safety
    ///
    /// The slot must have been observed with `done == 1`.
    #[inline]
    pub(crate) unsafe fn value_ref(&self) -> &T {
        // SAFETY: `done == 1` means the payload was fully written before
        // the release that made the flag visible.
        unsafe { (*self.value.get()).assume_init_ref() }
    }

    /// Move the payload out, leaving the slot unconstructed.
    pub(crate) fn take_value(&mut self) -> Option<T> {
        if *self.hook.done.get_mut() != 1 {
            return None;
        }
        *self.hook.done.get_mut() = 0;
        // SAFETY: the flag said constructed, and we just cleared it so
        // the drop glue will not read the payload again.
        Some(unsafe { self.value.get_mut().assume_init_read() })
    }
}

impl<T> Drop for ConcurrentNode<T> {
    fn drop(&mut self) {
        if mem::needs_drop::<T>() && *self.hook.done.get_mut() == 1 {
            // SAFETY: constructed payload, dropped exactly once.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

/// A rooted tree safe under N producer threads.
///
/// # Example
///
/// ```rust
/// use vmtree::{ConcurrentTree, NodeId};
///
/// let tree = ConcurrentTree::with_root(0u64)?;
/// let child = tree.insert(NodeId::ROOT, 1)?;
/// tree.insert(child, 2)?;
///
/// assert_eq!(tree.height(NodeId::ROOT), 3);
/// # Ok::<(), vmtree::Error>(())
/// ```
pub struct ConcurrentTree<T> {
    nodes: VmConcurrentVec<ConcurrentNode<T>>,
}

impl<T> ConcurrentTree<T> {
    /// An empty tree over a store of `capacity` node slots (sentinel
    /// included).
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailure`] if the host rejects the reservation.
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        assert!(
            capacity <= i32::MAX as usize,
            "node ids are 32-bit; capacity cannot exceed i32::MAX slots"
        );

        let nodes = VmConcurrentVec::with_capacity(capacity)?;

        // Slot 0: the sentinel. Its hook is live from the start; its
        // payload slot stays unconstructed forever (`done == 0`).
        let sentinel = nodes.push_zeroed()?;
        debug_assert_eq!(sentinel, 0);

        Ok(Self { nodes })
    }

    /// An empty tree with the default capacity.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailure`] if the host rejects the reservation.
    pub fn new() -> Result<Self, Error> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A default-capacity tree with its root already emplaced at
    /// [`NodeId::ROOT`].
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailure`] if the host rejects the reservation.
    pub fn with_root(value: T) -> Result<Self, Error> {
        let tree = Self::new()?;
        tree.insert(NodeId::INVALID, value)?;
        Ok(tree)
    }

    /// Add a child under `parent`; pass the invalid id to emplace the
    /// root.
    ///
    /// Allocation is lock-free with respect to inserts under other
    /// parents; only the link into `parent`'s child list takes `parent`'s
    /// spin lock. Inserting a second root is a precondition violation
    /// (debug-asserted); concurrent root creations are not serialized.
    ///
    /// # Errors
    ///
    /// [`Error::CapacityExhausted`] past the store capacity;
    /// [`Error::AllocationFailure`] if a page commit is refused. Either
    /// way the tree is unchanged: a slot is published only after its
    /// construction succeeded.
    pub fn insert(&self, parent: NodeId, value: T) -> Result<NodeId, Error> {
        let index = self.nodes.push_zeroed()?;
        let id = NodeId::from_index(index);

        // Allocation phase: construct in the zero-filled slot, publish
        // `done` last.
        let node = self.node(index);
        // SAFETY: the slot was claimed by this thread and is unpublished.
        unsafe { node.init_value(value) };
        node.hook.set_up(parent);
        node.hook.set_done();

        // Publish phase, serialized on the parent only.
        let parent_node = self.parent_node(parent);
        {
            let _guard = parent_node.hook.lock_children();
            debug_assert!(
                parent.is_valid() || parent_node.hook.tail().is_invalid(),
                "a rooted tree has exactly one root"
            );

            let elder = parent_node.hook.tail();
            node.hook.set_prev(elder);
            parent_node.hook.publish_tail(id);
            parent_node.hook.bump_fan();
        }

        Ok(id)
    }

    /// Whether a root has been emplaced.
    #[must_use]
    pub fn has_root(&self) -> bool {
        self.node(0).hook.tail().is_valid()
    }

    /// Claimed store slots, sentinel included. Exact once producers are
    /// joined.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds no nodes beyond the sentinel.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    /// The fixed store capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.nodes.capacity()
    }

    /// Payload of `id` without blocking: `None` for the sentinel, the
    /// invalid id, unallocated ids and slots still under construction.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&T> {
        if id.is_invalid() {
            return None;
        }
        let node = self.nodes.get(id.index())?;
        if !node.hook.is_done() {
            return None;
        }
        // SAFETY: `done` was acquired above.
        Some(unsafe { node.value_ref() })
    }

    // ========================================================================
    //  Cursors (shared flavors only; exclusive cursors are a sequential
    //  tree feature)
    // ========================================================================

    /// Walk the direct children of `parent`, newest first.
    #[must_use]
    pub fn children(&self, parent: NodeId) -> DownCursor<'_, Self> {
        DownCursor::new(self, parent)
    }

    /// Walk from `start` through its ancestors to the root.
    #[must_use]
    pub fn ancestors(&self, start: NodeId) -> UpCursor<'_, Self> {
        UpCursor::new(self, start)
    }

    /// Depth-first walk of the subtree under `start`.
    #[must_use]
    pub fn depth_first(&self, start: NodeId) -> DepthCursor<'_, Self> {
        DepthCursor::new(self, start)
    }

    /// Level-order walk of the subtree under `start`, at most `max_depth`
    /// levels (0 = unbounded).
    #[must_use]
    pub fn breadth_first(&self, start: NodeId, max_depth: usize) -> BreadthCursor<'_, Self> {
        BreadthCursor::new(self, start, max_depth)
    }

    /// Depth-first walk yielding only leaves.
    #[must_use]
    pub fn leaves(&self, start: NodeId) -> LeafCursor<'_, Self> {
        LeafCursor::new(self, start)
    }

    /// Depth-first walk yielding only internal nodes.
    #[must_use]
    pub fn internal(&self, start: NodeId) -> InternalCursor<'_, Self> {
        InternalCursor::new(self, start)
    }

    // ========================================================================
    //  Structural operators
    // ========================================================================

    /// Number of levels from `from` down to the deepest leaf; 0 when
    /// `from` addresses no node.
    #[must_use]
    pub fn height(&self, from: NodeId) -> usize {
        structure::height_width(self, from).0
    }

    /// [`height`](Self::height) plus the maximum level width.
    #[must_use]
    pub fn height_width(&self, from: NodeId) -> (usize, usize) {
        structure::height_width(self, from)
    }

    /// Breadth-first search: the first id whose `(id, value)` satisfies
    /// `pred` within `max_depth` levels (0 = unbounded), else the invalid
    /// id.
    pub fn find<F>(&self, from: NodeId, max_depth: usize, pred: F) -> NodeId
    where
        F: FnMut(NodeId, &T) -> bool,
    {
        structure::find_breadth(self, from, max_depth, pred)
    }

    /// A fresh tree holding `from` and its descendants down to
    /// `max_depth` levels (0 = unbounded), densely renumbered in
    /// breadth-first order. Whole-structure operation; run it quiescent.
    ///
    /// # Errors
    ///
    /// Allocation errors from building the fresh store.
    pub fn subtree(&self, from: NodeId, max_depth: usize) -> Result<Self, Error>
    where
        T: Clone,
    {
        let plan = structure::subtree_plan(self, from, max_depth);
        let sub = Self::with_capacity(self.capacity())?;
        for (src, parent) in plan {
            if let Some(value) = self.value(src) {
                sub.insert(parent, value.clone())?;
            }
        }
        Ok(sub)
    }

    /// Replace this tree by [`subtree`](Self::subtree) of itself, moving
    /// payloads instead of cloning them. Whole-structure operation; ids
    /// handed out before no longer apply.
    ///
    /// # Errors
    ///
    /// Allocation errors from building the fresh store. After a mid-way
    /// failure the tree is poisoned (payloads already moved out stay
    /// gone); there is no partial-failure recovery.
    pub fn prune(&mut self, from: NodeId, max_depth: usize) -> Result<(), Error> {
        let plan = structure::subtree_plan(self, from, max_depth);

        let fresh = Self::with_capacity(self.capacity())?;
        for (src, parent) in plan {
            let Some(node) = self.nodes.get_mut(src.index()) else {
                continue;
            };
            let Some(value) = node.take_value() else {
                continue;
            };
            fresh.insert(parent, value)?;
        }

        // The old store drops here: reservation released, registry entry
        // retired.
        self.nodes = fresh.nodes;
        Ok(())
    }

    /// Make `from` the new root, keeping exactly its descendants.
    ///
    /// # Errors
    ///
    /// See [`prune`](Self::prune).
    pub fn reroot(&mut self, from: NodeId) -> Result<(), Error> {
        self.prune(from, 0)
    }

    /// Keep the root and its direct children only.
    ///
    /// # Errors
    ///
    /// See [`prune`](Self::prune).
    pub fn flatten(&mut self) -> Result<(), Error> {
        self.prune(NodeId::ROOT, 2)
    }

    // ========================================================================
    //  Slot access
    // ========================================================================

    /// The slot at `index`, which must be below the indexable bound.
    #[inline]
    fn node(&self, index: usize) -> &ConcurrentNode<T> {
        match self.nodes.get(index) {
            Some(node) => node,
            None => unreachable!("slot {index} is not allocated"),
        }
    }

    /// The node to lock for a publish under `parent`; the invalid id
    /// addresses the sentinel.
    #[inline]
    fn parent_node(&self, parent: NodeId) -> &ConcurrentNode<T> {
        if parent.is_invalid() {
            self.node(0)
        } else {
            self.wait_ready(parent)
        }
    }

    /// Spin-yield until `id`'s slot is allocated and constructed.
    ///
    /// Ids learned from `tail`/`prev` always get there; an id that was
    /// never handed out by `insert` spins forever.
    fn wait_ready(&self, id: NodeId) -> &ConcurrentNode<T> {
        debug_assert!(id.is_valid());
        let index = id.index();
        debug_assert!(index < self.capacity(), "id out of store");

        loop {
            if let Some(node) = self.nodes.get(index) {
                if node.hook.is_done() {
                    return node;
                }
            }
            std::thread::yield_now();
        }
    }

    /// The hook of `id`; the invalid id addresses the sentinel's hook.
    #[inline]
    fn hook_of(&self, id: NodeId) -> &ConcurrentHook {
        if id.is_invalid() {
            &self.node(0).hook
        } else {
            &self.wait_ready(id).hook
        }
    }
}

impl<T> TreeView for ConcurrentTree<T> {
    type Value = T;

    #[inline]
    fn up_of(&self, id: NodeId) -> NodeId {
        self.hook_of(id).up()
    }

    #[inline]
    fn prev_of(&self, id: NodeId) -> NodeId {
        self.hook_of(id).prev()
    }

    #[inline]
    fn tail_of(&self, id: NodeId) -> NodeId {
        self.hook_of(id).tail()
    }

    #[inline]
    fn fan_of(&self, id: NodeId) -> usize {
        self.hook_of(id).fan()
    }

    #[inline]
    fn value(&self, id: NodeId) -> Option<&T> {
        if id.is_invalid() {
            return None;
        }
        let node = self.wait_ready(id);
        // SAFETY: `done` was acquired by the wait.
        Some(unsafe { node.value_ref() })
    }

    #[inline]
    fn slot_count(&self) -> usize {
        self.nodes.indexable_len()
    }

    #[inline]
    fn contains(&self, id: NodeId) -> bool {
        id.is_valid()
            && self
                .nodes
                .get(id.index())
                .is_some_and(|node| node.hook.is_done())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ConcurrentTree<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentTree")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
