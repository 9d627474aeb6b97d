//! Thin futex(2) wrappers
//!
//! nix does not expose futex, so these go through `libc::syscall`. The
//! process-private flag is never set: the words live in shared mappings.

#![allow(unsafe_code)]

use nix::errno::Errno;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Block while `word` still holds `expected`, for at most `timeout`
///
/// Returns `EAGAIN` when the value already differs, `ETIMEDOUT` when the
/// timeout expired and `EINTR` on signal delivery. Callers re-check their
/// condition in every case.
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<(), Errno> {
    #[allow(clippy::cast_possible_wrap, clippy::cast_lossless)]
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs() as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| std::ptr::from_ref(t));

    // SAFETY: `word` is a valid, aligned u32 for the duration of the call
    // and `ts_ptr` is either null or points at a live timespec.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if ret == -1 { Err(Errno::last()) } else { Ok(()) }
}

/// Wake every process sleeping on `word`, returning how many were woken
pub fn wake_all(word: &AtomicU32) -> Result<usize, Errno> {
    // SAFETY: `word` is a valid, aligned u32 for the duration of the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            libc::c_int::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if ret == -1 {
        Err(Errno::last())
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(ret as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_value_mismatch() {
        let word = AtomicU32::new(5);
        assert_eq!(wait(&word, 4, None), Err(Errno::EAGAIN));
    }

    #[test]
    fn test_wait_times_out() {
        let word = AtomicU32::new(0);
        let result = wait(&word, 0, Some(Duration::from_millis(20)));
        assert_eq!(result, Err(Errno::ETIMEDOUT));
    }

    #[test]
    fn test_wake_without_sleepers() {
        let word = AtomicU32::new(0);
        assert_eq!(wake_all(&word), Ok(0));
    }
}
