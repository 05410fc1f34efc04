//! Thread-local bump regions for the concurrent vector.
//!
//! Each (vector instance, thread) pair owns a small run of consecutive
//! slots, claimed from the vector under its refill lock and then consumed
//! without any further synchronization. Threads serialize only when
//! refilling a run, not per element.
//!
//! Instance handles are process-unique and never recycled, so a region
//! left behind by a dropped vector can never alias a newer one; such dead
//! entries are pruned from the thread-local maps on the refill slow path,
//! consulting the process-wide registry of live instances.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::Error;

/// Slots handed to a thread per refill.
pub(crate) const RUN_LEN: usize = 32;

/// Thread-local maps larger than this prune dead entries on refill.
const PRUNE_THRESHOLD: usize = 8;

/// A run of consecutive slot indices owned by one thread.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BumpRegion {
    /// Next slot to hand out.
    next: usize,
    /// One past the last slot of the run.
    end: usize,
}

impl BumpRegion {
    pub(crate) const fn new(begin: usize, end: usize) -> Self {
        Self { next: begin, end }
    }

    pub(crate) const fn is_exhausted(&self) -> bool {
        self.next == self.end
    }

    /// Claim the next slot of the run.
    pub(crate) fn take_slot(&mut self) -> usize {
        debug_assert!(!self.is_exhausted());
        let slot = self.next;
        self.next += 1;
        slot
    }
}

/// Process-unique handle of one concurrent-vector instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub(crate) struct VecInstanceId(u64);

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Instances that are still alive; consulted when pruning.
static LIVE: Mutex<BTreeSet<u64>> = Mutex::new(BTreeSet::new());

thread_local! {
    /// This thread's bump region per vector instance.
    static LOCAL: RefCell<HashMap<VecInstanceId, BumpRegion>> = RefCell::new(HashMap::new());
}

/// Register a new vector instance and return its handle.
pub(crate) fn register() -> VecInstanceId {
    let id = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
    LIVE.lock().insert(id);
    VecInstanceId(id)
}

/// Remove a dropped vector instance from the registry.
///
/// Regions other threads still hold for it become dead entries; they are
/// pruned lazily because the handle is never reused.
pub(crate) fn unregister(id: VecInstanceId) {
    LIVE.lock().remove(&id.0);
}

/// Claim one slot of `id`'s store for the calling thread.
///
/// The fast path bumps the thread's existing region without touching any
/// lock. When the region is exhausted (or the thread has none yet),
/// `refill` is called to reserve a fresh run from the vector.
pub(crate) fn claim_slot<F>(id: VecInstanceId, refill: F) -> Result<usize, Error>
where
    F: FnOnce() -> Result<BumpRegion, Error>,
{
    LOCAL.with(|cell| {
        let mut map = cell.borrow_mut();

        if let Some(region) = map.get_mut(&id) {
            if !region.is_exhausted() {
                return Ok(region.take_slot());
            }
        }

        // Slow path: reserve a fresh run, then tidy up dead entries while
        // we are off the fast path anyway.
        let mut region = refill()?;
        let slot = region.take_slot();
        prune_dead(&mut map);
        map.insert(id, region);
        Ok(slot)
    })
}

fn prune_dead(map: &mut HashMap<VecInstanceId, BumpRegion>) {
    if map.len() < PRUNE_THRESHOLD {
        return;
    }

    let live = LIVE.lock();
    map.retain(|id, _| live.contains(&id.0));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_hand_out_consecutive_slots() {
        let mut region = BumpRegion::new(32, 36);
        assert!(!region.is_exhausted());
        assert_eq!(region.take_slot(), 32);
        assert_eq!(region.take_slot(), 33);
        assert_eq!(region.take_slot(), 34);
        assert_eq!(region.take_slot(), 35);
        assert!(region.is_exhausted());
    }

    #[test]
    fn instance_ids_are_unique() {
        let a = register();
        let b = register();
        assert_ne!(a, b);
        unregister(a);
        unregister(b);
    }

    #[test]
    fn claim_refills_only_on_exhaustion() {
        let id = register();
        let mut refills = 0usize;

        for expect in 0..6 {
            let slot = claim_slot(id, || {
                refills += 1;
                Ok(BumpRegion::new((refills - 1) * 3, refills * 3))
            })
            .unwrap();
            assert_eq!(slot, expect);
        }

        // Six slots out of three-slot runs: exactly two refills.
        assert_eq!(refills, 2);
        unregister(id);
    }

    #[test]
    fn claim_propagates_refill_errors() {
        let id = register();
        let err = claim_slot(id, || Err(Error::CapacityExhausted { capacity: 0 }));
        assert_eq!(err, Err(Error::CapacityExhausted { capacity: 0 }));
        unregister(id);
    }
}
