//! Filepath: src/error.rs
//!
//! Errors surfaced by the VM-backed vectors and the trees built on them.
//!
//! Allocation and bounds failures are returned to the caller; precondition
//! violations (second root, fan-out overflow, popping an empty vector) are
//! debug assertions instead, consistent with a low-level systems component.

use std::fmt as StdFmt;

/// Errors produced by [`VmVec`](crate::vec::VmVec),
/// [`VmConcurrentVec`](crate::vec::VmConcurrentVec) and the trees over them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The host refused a virtual-memory reservation or commit.
    AllocationFailure {
        /// Size of the rejected reservation or commit, in bytes.
        bytes: usize,
    },

    /// An append would pass the configured logical capacity.
    ///
    /// The container is left unchanged; no commit is attempted beyond the
    /// reserved range.
    CapacityExhausted {
        /// The configured logical capacity, in elements.
        capacity: usize,
    },

    /// Checked random access outside `[0, len)`.
    OutOfBounds {
        /// The offending index.
        index: usize,
        /// The container length at the time of the access.
        len: usize,
    },
}

impl StdFmt::Display for Error {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::AllocationFailure { bytes } => {
                write!(f, "virtual memory allocation of {bytes} bytes refused")
            }

            Self::CapacityExhausted { capacity } => {
                write!(f, "append past the logical capacity of {capacity} elements")
            }

            Self::OutOfBounds { index, len } => {
                write!(f, "index {index} out of bounds for length {len}")
            }
        }
    }
}

impl std::error::Error for Error {}
