//! Filepath: src/vec/concurrent.rs
//!
//! Many-producer vector over reserved virtual memory.
//!
//! Producers append through per-thread bump regions: a thread claims a run
//! of [`RUN_LEN`] consecutive slots under the vector's refill lock and
//! then fills the run with no synchronization at all. Elements never move,
//! so readers of older slots are undisturbed by growth.
//!
//! Slots are handed out zero-filled (freshly committed pages read as
//! zero), which is why elements must be [`ZeroInit`]: the zero pattern is
//! the element's own "allocated but not yet constructed" state, and
//! publication of a constructed element is the element's concern (the
//! trees use a `done` byte in their hooks).
//!
//! # Two sizes
//!
//! - [`len`](VmConcurrentVec::len) counts claimed slots; it is exact once
//!   producers are joined.
//! - [`indexable_len`](VmConcurrentVec::indexable_len) is the reserved
//!   high-water mark: every index below it refers to committed (if
//!   possibly still zero-filled) storage. Both only ever grow.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::regions::{self, BumpRegion, RUN_LEN, VecInstanceId};
use crate::error::Error;
use crate::spinlock::SpinLock;
use crate::tracing_helpers::trace_log;
use crate::vm;

/// Marker for types whose all-zero bit pattern is a valid value.
///
/// # Safety
///
/// Implementors guarantee that a slot filled with zero bytes may be read
/// as a `Self` (typically: integers, atomics whose zero state is
/// meaningful, and structs of such fields with `MaybeUninit` payloads).
pub unsafe trait ZeroInit {}

// SAFETY: zero is a valid value of every primitive integer.
unsafe impl ZeroInit for u8 {}
// SAFETY: as above.
unsafe impl ZeroInit for u16 {}
// SAFETY: as above.
unsafe impl ZeroInit for u32 {}
// SAFETY: as above.
unsafe impl ZeroInit for u64 {}
// SAFETY: as above.
unsafe impl ZeroInit for usize {}
// SAFETY: as above.
unsafe impl ZeroInit for i8 {}
// SAFETY: as above.
unsafe impl ZeroInit for i16 {}
// SAFETY: as above.
unsafe impl ZeroInit for i32 {}
// SAFETY: as above.
unsafe impl ZeroInit for i64 {}
// SAFETY: as above.
unsafe impl ZeroInit for isize {}

/// A many-producer append-only vector over reserved virtual memory.
///
/// Appending takes `&self` and is safe from any number of threads; all
/// other growth-adjacent operations (`get`, `len`, iteration) are
/// concurrent-safe as well. Elements never move.
pub struct VmConcurrentVec<T: ZeroInit> {
    base: NonNull<T>,
    /// Logical capacity in elements.
    capacity: usize,
    reserved_bytes: usize,

    /// Claimed-slot count. Exact once producers are joined.
    len: AtomicUsize,

    /// High-water mark of slots covered by handed-out runs; the safe
    /// indexing bound. Grows under `grow_lock`, published with release.
    indexable: AtomicUsize,

    /// Bytes currently committed. Only touched under `grow_lock`.
    committed_bytes: AtomicUsize,

    /// Serializes run refills and page commits.
    grow_lock: SpinLock,

    instance: VecInstanceId,
    _marker: PhantomData<T>,
}

// SAFETY: the vector exclusively owns its mapping. Producers move `T`s in
// (`T: Send`); concurrent readers share `&T` (`T: Sync`).
unsafe impl<T: ZeroInit + Send> Send for VmConcurrentVec<T> {}
// SAFETY: see above.
unsafe impl<T: ZeroInit + Send + Sync> Sync for VmConcurrentVec<T> {}

impl<T: ZeroInit> VmConcurrentVec<T> {
    /// Reserve address space for `capacity` elements.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailure`] if the host rejects the reservation.
    ///
    /// # Panics
    ///
    /// Panics on zero-sized element types, which need no storage.
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        assert!(mem::size_of::<T>() != 0, "zero-sized elements need no storage");

        let bytes = capacity
            .checked_mul(mem::size_of::<T>())
            .ok_or(Error::AllocationFailure { bytes: usize::MAX })?;
        let reserved = vm::round_up(bytes.max(1), vm::CHUNK);

        let base = vm::reserve(reserved).ok_or(Error::AllocationFailure { bytes: reserved })?;

        Ok(Self {
            base: base.cast::<T>(),
            capacity,
            reserved_bytes: reserved,
            len: AtomicUsize::new(0),
            indexable: AtomicUsize::new(0),
            committed_bytes: AtomicUsize::new(0),
            grow_lock: SpinLock::new(),
            instance: regions::register(),
            _marker: PhantomData,
        })
    }

    /// Claimed-slot count. Exact once producers are joined.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether no slot has been claimed yet.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fixed logical capacity.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Monotonic bound below which every index refers to committed
    /// storage (possibly still zero-filled).
    #[inline]
    #[must_use]
    pub fn indexable_len(&self) -> usize {
        self.indexable.load(Ordering::Acquire)
    }

    /// Claim the next slot of the calling thread's bump region and return
    /// its index. The slot content is all zeroes.
    ///
    /// The claiming thread owns the slot exclusively until it publishes
    /// the index to other threads by its own means.
    ///
    /// # Errors
    ///
    /// [`Error::CapacityExhausted`] past the logical capacity;
    /// [`Error::AllocationFailure`] if a page commit is refused.
    pub fn push_zeroed(&self) -> Result<usize, Error> {
        let index = regions::claim_slot(self.instance, || self.refill_region())?;
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(index)
    }

    /// Claim a slot and move `value` into it.
    ///
    /// The write is not synchronized with concurrent readers of the same
    /// index; publish the returned index through an atomic the readers
    /// acquire (the trees use their hooks), or join producers first.
    pub fn push(&self, value: T) -> Result<usize, Error> {
        let index = self.push_zeroed()?;

        // SAFETY: the slot was claimed by this thread and nothing else
        // references it yet. The zero pattern it holds counts as "not yet
        // constructed", so overwriting it without a drop is the contract.
        unsafe { ptr::write(self.slot_ptr(index), value) };
        Ok(index)
    }

    /// Raw pointer to the slot at `index`, for in-place initialization by
    /// the thread that claimed it.
    #[inline]
    #[must_use]
    pub fn slot_ptr(&self, index: usize) -> *mut T {
        debug_assert!(index < self.indexable_len());
        // SAFETY: indexable slots are committed; forming the pointer is
        // in-bounds of the reservation.
        unsafe { self.base.as_ptr().add(index) }
    }

    /// Shared access to the slot at `index`, or `None` past the indexable
    /// bound.
    ///
    /// A slot below the bound is always a valid `T` (the zero pattern, or
    /// whatever its claimant wrote before publishing).
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index < self.indexable_len() {
            // SAFETY: committed and ZeroInit-valid.
            Some(unsafe { &*self.base.as_ptr().add(index) })
        } else {
            None
        }
    }

    /// Exclusive access to the slot at `index`.
    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index < self.indexable_len() {
            // SAFETY: committed, ZeroInit-valid, and `&mut self` excludes
            // every other access.
            Some(unsafe { &mut *self.base.as_ptr().add(index) })
        } else {
            None
        }
    }

    /// Iterate over every indexable slot.
    ///
    /// Under concurrent production this includes slots that are claimed
    /// but not yet constructed (still the zero pattern); callers that care
    /// must check the element's own publication state.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        // SAFETY: every slot below the bound is committed and valid.
        (0..self.indexable_len()).map(move |i| unsafe { &*self.base.as_ptr().add(i) })
    }

    /// Reserve a fresh run for the calling thread.
    fn refill_region(&self) -> Result<BumpRegion, Error> {
        let _guard = self.grow_lock.lock();

        let begin = self.indexable.load(Ordering::Relaxed);
        if begin == self.capacity {
            return Err(Error::CapacityExhausted {
                capacity: self.capacity,
            });
        }
        let end = (begin + RUN_LEN).min(self.capacity);

        let needed = end * mem::size_of::<T>();
        let committed = self.committed_bytes.load(Ordering::Relaxed);
        if needed > committed {
            let target = vm::round_up(needed, vm::CHUNK).min(self.reserved_bytes);
            let grow = target - committed;

            // SAFETY: a chunk-aligned subrange of our reservation.
            let ok = unsafe { vm::commit(self.base.as_ptr().cast::<u8>().add(committed), grow) };
            if !ok {
                return Err(Error::AllocationFailure { bytes: grow });
            }

            trace_log!(grow, total = target, "committed pages");
            self.committed_bytes.store(target, Ordering::Relaxed);
        }

        // Publish the new bound only after its storage is committed.
        self.indexable.store(end, Ordering::Release);
        trace_log!(begin, end, "refilled bump region");
        Ok(BumpRegion::new(begin, end))
    }
}

impl<T: ZeroInit> Drop for VmConcurrentVec<T> {
    fn drop(&mut self) {
        regions::unregister(self.instance);

        if mem::needs_drop::<T>() {
            let indexable = *self.indexable.get_mut();
            // SAFETY: every indexable slot is a valid T; `&mut self`
            // excludes every other access.
            unsafe {
                ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.base.as_ptr(), indexable));
            }
        }

        // SAFETY: exact reservation; no references outlive `self`.
        unsafe { vm::release(self.base.as_ptr().cast::<u8>(), self.reserved_bytes) };
    }
}

impl<T: ZeroInit> std::fmt::Debug for VmConcurrentVec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmConcurrentVec")
            .field("len", &self.len())
            .field("indexable", &self.indexable_len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
