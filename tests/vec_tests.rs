//! Integration tests for the VM-backed vectors.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

mod common;

use std::sync::Arc;
use std::thread;
use vmtree::{Error, VmConcurrentVec, VmVec};

#[test]
fn growth_crosses_commit_chunks_without_moving_elements() {
    common::init_tracing();

    // 9M u64 elements cross the 64 MiB commit unit.
    const COUNT: usize = 9_000_000;

    let mut v: VmVec<u64> = VmVec::with_capacity(COUNT).unwrap();
    let first: *const u64 = v.push(0xDEAD_BEEF).unwrap();

    for i in 1..COUNT as u64 {
        v.push(i).unwrap();
    }

    assert_eq!(v.len(), COUNT);
    // SAFETY: the vector never reallocates.
    assert_eq!(unsafe { *first }, 0xDEAD_BEEF);
    assert_eq!(v[COUNT - 1], COUNT as u64 - 1);
}

#[test]
fn logical_capacity_is_a_hard_wall() {
    common::init_tracing();

    let mut v: VmVec<u64> = VmVec::with_capacity(1024).unwrap();
    for i in 0..1024u64 {
        v.push(i).unwrap();
    }

    assert_eq!(
        v.push(1024),
        Err(Error::CapacityExhausted { capacity: 1024 })
    );
    assert_eq!(v.len(), 1024);
}

#[test]
fn concurrent_references_stay_valid_while_others_append() {
    common::init_tracing();

    const WRITERS: usize = 4;
    const PER_WRITER: usize = 50_000;

    // Padding absorbs the partially used bump run each thread leaves
    // behind.
    let v: Arc<VmConcurrentVec<u64>> =
        Arc::new(VmConcurrentVec::with_capacity(WRITERS * PER_WRITER + 1024).unwrap());

    // Pin down an early element before the stampede.
    let early_index = v.push(7777).unwrap();
    let early: *const u64 = v.get(early_index).unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|t| {
            let v = Arc::clone(&v);
            thread::spawn(move || {
                for i in 0..PER_WRITER {
                    v.push((t * PER_WRITER + i) as u64 + 10_000).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(v.len(), WRITERS * PER_WRITER + 1);
    // SAFETY: slots never move and nothing rewrote this one.
    assert_eq!(unsafe { *early }, 7777);
    assert_eq!(*v.get(early_index).unwrap(), 7777);
}

#[test]
fn many_vectors_share_the_region_registry() {
    common::init_tracing();

    // Interleaved lifetimes across threads: every vector ends consistent
    // and drops cleanly out of the process-wide registry.
    let handles: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                for round in 0..8 {
                    let v: VmConcurrentVec<u64> = VmConcurrentVec::with_capacity(4096).unwrap();
                    for i in 0..(round + 1) * 100 {
                        v.push(i as u64 + 1).unwrap();
                    }
                    assert_eq!(v.len(), (round + 1) * 100);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}
