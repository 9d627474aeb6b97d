//! Anonymous shared mappings that outlive `fork`/`clone`
//!
//! A [`SharedRegion`] is created once in the parent and inherited by every
//! child cloned afterwards. Unlike ordinary heap memory it is not copied on
//! write: all processes see the same bytes, so the only sound contents are
//! atomics.

#![allow(unsafe_code)]

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

use mountns_core::{Error, Result};

/// Types whose all-zero bit pattern is a valid value and that are safe to
/// share between processes
///
/// # Safety
/// Implementors must be valid when zero-initialised and must only be
/// mutated through atomic operations.
pub unsafe trait ZeroValid: Sync {}

// SAFETY: valid at zero and only mutated atomically.
unsafe impl ZeroValid for AtomicU32 {}
// SAFETY: an array of zero-valid elements is zero-valid.
unsafe impl<T: ZeroValid, const N: usize> ZeroValid for [T; N] {}

/// A `MAP_SHARED | MAP_ANONYMOUS` mapping holding one `T`
pub struct SharedRegion<T: ZeroValid> {
    ptr: NonNull<T>,
    len: NonZeroUsize,
}

impl<T: ZeroValid> SharedRegion<T> {
    /// Map a zero-initialised `T`
    ///
    /// Must be called before any clone/fork that should share the region.
    pub fn new() -> Result<Self> {
        let len = NonZeroUsize::new(size_of::<T>()).ok_or_else(|| Error::InvalidConfig {
            message: "Shared region type has zero size".to_string(),
        })?;

        // SAFETY: a fresh anonymous mapping does not alias any Rust object.
        let raw = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| {
            tracing::error!(error = %e, bytes = len.get(), "Failed to map shared region");
            Error::resource("mmap shared region", e)
        })?;

        tracing::trace!(bytes = len.get(), addr = ?raw, "Mapped shared region");

        Ok(Self {
            ptr: raw.cast(),
            len,
        })
    }

    /// Size of the mapping in bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len.get()
    }

    /// Always false; a mapping is never empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

impl<T: ZeroValid> Deref for SharedRegion<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mapping is live, page aligned and zero-valid for T
        // until drop.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ZeroValid> Drop for SharedRegion<T> {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in `new`, and no
        // reference into it outlives `self`.
        if let Err(e) = unsafe { munmap(self.ptr.cast(), self.len.get()) } {
            tracing::warn!(error = %e, "Failed to unmap shared region");
        }
    }
}

impl<T: ZeroValid> std::fmt::Debug for SharedRegion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("addr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

// SAFETY: T is Sync and only touched through shared references.
unsafe impl<T: ZeroValid> Send for SharedRegion<T> {}
// SAFETY: as above.
unsafe impl<T: ZeroValid> Sync for SharedRegion<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_region_is_zeroed() {
        let region = SharedRegion::<[AtomicU32; 4]>::new().unwrap();
        assert_eq!(region.len(), 16);
        assert!(region.iter().all(|w| w.load(Ordering::SeqCst) == 0));
    }

    #[test]
    fn test_region_shared_across_fork() {
        let region = SharedRegion::<AtomicU32>::new().unwrap();

        // SAFETY: the child only touches atomics and exits immediately.
        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                region.store(42, Ordering::SeqCst);
                // SAFETY: terminate the forked test process without unwinding.
                unsafe { libc::_exit(0) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                nix::sys::wait::waitpid(child, None).unwrap();
            }
        }

        assert_eq!(region.load(Ordering::SeqCst), 42);
    }
}
