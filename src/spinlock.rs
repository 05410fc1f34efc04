//! Filepath: src/spinlock.rs
//!
//! A one-byte test-and-set spin lock.
//!
//! This is the lock embedded in every concurrent node hook and in the
//! concurrent vector's refill path. Critical sections are a handful of
//! field writes, so a spin lock beats a full mutex: contention is rare and
//! short. The unlocked state is the all-zero byte, which lets freshly
//! zero-filled storage start out unlocked.
//!
//! # Concurrency Model
//!
//! 1. `lock()` spins on `swap(LOCKED, Acquire)` until it observes the
//!    unlocked byte, yielding to the scheduler after a short busy phase.
//! 2. The returned [`SpinGuard`] is proof the lock is held; it releases
//!    with a `store(UNLOCKED, Release)` on drop, panic-safe.
//!
//! # Type-State Pattern
//!
//! Operations that require the lock take the guard as proof. Guards are
//! `!Send`/`!Sync` via `PhantomData<*mut ()>` so they cannot cross thread
//! boundaries.

use std::hint;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

#[cfg(all(loom, test))]
mod loom_tests;

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;

/// Busy spins before each yield to the scheduler.
const SPINS_BEFORE_YIELD: u32 = 64;

/// A one-byte test-and-set mutex.
///
/// # Example
///
/// ```rust
/// use vmtree::spinlock::SpinLock;
///
/// let lock = SpinLock::new();
/// {
///     let _guard = lock.lock();
///     assert!(lock.is_locked());
/// }
/// assert!(!lock.is_locked());
/// ```
#[derive(Debug)]
#[repr(transparent)]
pub struct SpinLock {
    flag: AtomicU8,
}

/// Proof that a [`SpinLock`] is held.
///
/// The lock is released when the guard drops, even during unwinding.
#[derive(Debug)]
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,

    // PhantomData<*mut ()> makes this type !Send + !Sync.
    _marker: PhantomData<*mut ()>,
}

impl SpinLock {
    /// Create an unlocked lock.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flag: AtomicU8::new(UNLOCKED),
        }
    }

    /// Acquire the lock, spinning until it is free.
    #[inline]
    pub fn lock(&self) -> SpinGuard<'_> {
        let mut spins: u32 = 0;
        while self.flag.swap(LOCKED, Ordering::Acquire) == LOCKED {
            spins = spins.wrapping_add(1);
            if spins % SPINS_BEFORE_YIELD == 0 {
                std::thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }

        SpinGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Acquire the lock without blocking.
    ///
    /// Returns `None` if the lock is already held.
    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        if self.flag.swap(LOCKED, Ordering::Acquire) == LOCKED {
            return None;
        }

        Some(SpinGuard {
            lock: self,
            _marker: PhantomData,
        })
    }

    /// Whether the lock is currently held (racy; diagnostic only).
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed) == LOCKED
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.flag.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = SpinLock::new();
        assert!(!lock.is_locked());

        {
            let _guard = lock.lock();
            assert!(lock.is_locked());
            // Guard drops here, releasing the lock.
        }

        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new();

        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn lock_is_one_byte() {
        assert_eq!(std::mem::size_of::<SpinLock>(), 1);
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        const THREADS: usize = 4;
        const ITERS: usize = 10_000;

        let lock = Arc::new(SpinLock::new());
        // Plain (non-atomic through the lock) counter; only the lock makes
        // the increments race-free.
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        let _guard = lock.lock();
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), THREADS * ITERS);
        assert!(!lock.is_locked());
    }
}
