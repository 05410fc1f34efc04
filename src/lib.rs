//! # vmtree
//!
//! Rooted trees in two modes, sequential and thread-safe, over an
//! append-only indexed node store, plus the virtual-memory-backed
//! contiguous vector that makes the concurrent mode possible.
//!
//! ## Design
//!
//! The tree is an arena of dense 32-bit ids, not a pointer graph. Slot 0
//! is a payload-less sentinel, slot 1 the root; each node's children form
//! an intrusive singly-linked list in reverse-insertion order, threaded
//! through per-node hooks (`up`, `prev`, `tail`, `fan`). Slots never
//! move, so ids stay valid for the tree's lifetime and serialization is
//! just the underlying integers.
//!
//! The concurrent store reserves its whole capacity as address space up
//! front and commits pages on demand, so growth never invalidates
//! references held by other threads. Producers append through per-thread
//! bump regions and serialize only when refilling a run; linking a child
//! takes a one-byte spin lock on the *parent* alone. Freshly committed
//! pages read as zero, and that zero doubles as every slot's "allocated
//! but not yet constructed" state: writers release a `done` byte after
//! construction, readers acquire it before trusting the slot.
//!
//! ## Performance
//!
//! - Appends: lock-free between different parents; a short per-parent
//!   critical section of three field writes otherwise
//! - Lookups: O(1) array indexing by id
//! - Write contention scales with insertions into the same parent, not
//!   with tree size

pub mod error;
pub mod hook;
pub mod node_id;
pub mod spinlock;
pub mod tree;
pub mod vec;
pub mod vm;

mod tracing_helpers;

pub use error::Error;
pub use node_id::NodeId;
pub use tree::{ConcurrentTree, RootedTree, TreeView};
pub use vec::{VmConcurrentVec, VmVec, ZeroInit};
