//! Filepath: src/vm.rs
//!
//! Minimal virtual-memory adapter.
//!
//! The containers in this crate consume exactly four operations from the
//! host: reserve an address range without backing pages, commit a
//! page-aligned subrange read-write, release the whole reservation, and
//! (optionally) decommit a subrange. Everything else is self-contained.
//!
//! Reservations cost address space only; committed pages are the ones the
//! kernel actually backs, and they read as zero until first written. The
//! containers lean on that zero guarantee: a freshly committed slot is a
//! valid "not yet constructed" value.
//!
//! Only Unix hosts are supported; commit sizes are whole multiples of
//! [`CHUNK`], which is a multiple of every page size in the wild (4 KiB
//! and 64 KiB families alike), so alignment holds on any host.

#[cfg(not(unix))]
compile_error!("the virtual-memory adapter supports Unix hosts only");

use std::ptr::NonNull;

/// Commit unit: reserved ranges are backed read-write in blocks of this
/// many bytes.
pub const CHUNK: usize = 64 * 1024 * 1024; // 64 MiB

/// Round `n` up to the next multiple of `multiple`.
#[inline]
#[must_use]
pub(crate) const fn round_up(n: usize, multiple: usize) -> usize {
    ((n + multiple - 1) / multiple) * multiple
}

/// Reserve `bytes` of virtual address space without backing pages.
///
/// Returns `None` if the host rejects the reservation. The range is
/// inaccessible until subranges are passed to [`commit`].
#[must_use]
pub fn reserve(bytes: usize) -> Option<NonNull<u8>> {
    debug_assert!(bytes > 0, "empty reservation");

    // SAFETY: anonymous private mapping with no access rights; the kernel
    // picks the placement, no existing mapping is disturbed.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            bytes,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return None;
    }

    NonNull::new(ptr.cast::<u8>())
}

/// Back `[ptr, ptr + bytes)` with zero-filled read-write pages.
///
/// Returns `false` if the host refuses the commit.
///
/// # Safety
///
/// `ptr` must be page-aligned and the range must lie inside a live
/// reservation obtained from [`reserve`].
#[must_use]
pub unsafe fn commit(ptr: *mut u8, bytes: usize) -> bool {
    // SAFETY: per the caller contract the range is ours and page-aligned.
    unsafe { libc::mprotect(ptr.cast::<libc::c_void>(), bytes, libc::PROT_READ | libc::PROT_WRITE) == 0 }
}

/// Release an entire reservation.
///
/// # Safety
///
/// `ptr` and `bytes` must be exactly the values of a live [`reserve`]
/// call, and nothing may reference the range afterwards.
pub unsafe fn release(ptr: *mut u8, bytes: usize) {
    // SAFETY: per the caller contract this unmaps exactly our reservation.
    let rc = unsafe { libc::munmap(ptr.cast::<libc::c_void>(), bytes) };
    debug_assert_eq!(rc, 0, "munmap of a live reservation cannot fail");
}

/// Return the physical backing of `[ptr, ptr + bytes)` to the host while
/// keeping the address range reserved.
///
/// Not required by the containers; offered for completeness.
///
/// # Safety
///
/// `ptr` must be page-aligned and the range must lie inside a live
/// reservation; nothing may read the range until it is committed again.
pub unsafe fn decommit(ptr: *mut u8, bytes: usize) {
    // SAFETY: per the caller contract the range is ours and page-aligned.
    unsafe {
        libc::madvise(ptr.cast::<libc::c_void>(), bytes, libc::MADV_DONTNEED);
        libc::mprotect(ptr.cast::<libc::c_void>(), bytes, libc::PROT_NONE);
    }
}

/// The host's page granularity.
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(size > 0);
    size as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_multiples() {
        assert_eq!(round_up(0, CHUNK), 0);
        assert_eq!(round_up(1, CHUNK), CHUNK);
        assert_eq!(round_up(CHUNK, CHUNK), CHUNK);
        assert_eq!(round_up(CHUNK + 1, CHUNK), 2 * CHUNK);
        assert_eq!(round_up(10, 4), 12);
    }

    #[test]
    fn chunk_is_page_aligned() {
        assert_eq!(CHUNK % page_size(), 0);
    }

    #[test]
    fn reserve_commit_write_release() {
        let bytes = CHUNK;
        let base = reserve(bytes).expect("reservation");

        // Commit the first page-aligned prefix and use it.
        let prefix = page_size();
        // SAFETY: prefix lies inside the reservation and is page-aligned.
        assert!(unsafe { commit(base.as_ptr(), prefix) });

        // Freshly committed pages read as zero.
        // SAFETY: the prefix is committed read-write.
        unsafe {
            assert_eq!(*base.as_ptr(), 0);
            assert_eq!(*base.as_ptr().add(prefix - 1), 0);

            *base.as_ptr() = 0xA5;
            assert_eq!(*base.as_ptr(), 0xA5);
        }

        // SAFETY: exact reservation, nothing references it afterwards.
        unsafe { release(base.as_ptr(), bytes) };
    }

    #[test]
    fn decommit_rezeroes() {
        let bytes = CHUNK;
        let base = reserve(bytes).expect("reservation");
        let prefix = page_size();

        // SAFETY: committed prefix of our reservation.
        unsafe {
            assert!(commit(base.as_ptr(), prefix));
            *base.as_ptr() = 7;

            decommit(base.as_ptr(), prefix);
            assert!(commit(base.as_ptr(), prefix));
            assert_eq!(*base.as_ptr(), 0);

            release(base.as_ptr(), bytes);
        }
    }
}
