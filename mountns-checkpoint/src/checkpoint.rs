//! Ticket-based checkpoint shared between a parent and its cloned children
//!
//! Every `wait` draws a ticket; every `wake(n)` serves the `n` oldest
//! outstanding tickets. A wake never runs ahead of the waits it pairs
//! with: it blocks until `n` tickets are outstanding, so issuing a wake
//! before the counterpart has started waiting is safe.
//!
//! Memory ordering: all three words are accessed with `SeqCst`. A waiter
//! observing `served > ticket` therefore also observes every write the
//! waking process made before calling `wake`, including the completion of
//! its mount syscall.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use mountns_core::{Error, Result};
use nix::errno::Errno;

use crate::futex;
use crate::shared::{SharedRegion, ZeroValid};

/// Shared state of one checkpoint
#[derive(Debug)]
#[repr(C)]
pub struct CheckpointState {
    /// Number of wakes issued so far
    phase: AtomicU32,
    /// Tickets handed out to waiters
    tickets: AtomicU32,
    /// Tickets released by wakes
    served: AtomicU32,
}

// SAFETY: three atomics, valid at zero.
unsafe impl ZeroValid for CheckpointState {}

/// Process-shared rendezvous point
///
/// Create it before cloning; the child inherits the mapping and both sides
/// call [`wait`](Self::wait), [`wake`](Self::wake) and
/// [`wake_and_wait`](Self::wake_and_wait) on it.
#[derive(Debug)]
pub struct Checkpoint {
    state: SharedRegion<CheckpointState>,
    release_count: u32,
}

impl Checkpoint {
    /// Allocate a checkpoint whose default wake releases `initial_waiters`
    ///
    /// # Errors
    /// Returns `InvalidConfig` for zero waiters and `Resource` when the
    /// shared mapping cannot be created.
    pub fn create(initial_waiters: u32) -> Result<Self> {
        if initial_waiters == 0 {
            return Err(Error::InvalidConfig {
                message: "Checkpoint needs at least one waiter".to_string(),
            });
        }

        let state = SharedRegion::<CheckpointState>::new()?;
        tracing::debug!(release_count = initial_waiters, "Checkpoint created");

        Ok(Self {
            state,
            release_count: initial_waiters,
        })
    }

    /// Number of waiters a default wake releases
    #[must_use]
    pub const fn release_count(&self) -> u32 {
        self.release_count
    }

    /// Number of wakes issued so far
    #[must_use]
    pub fn phase(&self) -> u32 {
        self.state.phase.load(Ordering::SeqCst)
    }

    /// Number of processes currently blocked in `wait`
    #[must_use]
    pub fn waiters(&self) -> u32 {
        let tickets = self.state.tickets.load(Ordering::SeqCst);
        let served = self.state.served.load(Ordering::SeqCst);
        tickets.wrapping_sub(served)
    }

    /// Block until a wake releases this caller
    ///
    /// # Errors
    /// Returns `Timeout` when `timeout` elapses first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_until(Instant::now(), timeout, None)
    }

    /// Release the `target_count` oldest waiters and advance the phase
    ///
    /// Blocks until that many waiters are outstanding.
    ///
    /// # Errors
    /// Returns `Timeout` when not enough waiters arrive within `timeout`.
    pub fn wake(&self, target_count: u32, timeout: Option<Duration>) -> Result<()> {
        self.wake_from(Instant::now(), target_count, timeout, None)
    }

    /// Wake the counterpart, then wait for it to wake us back
    ///
    /// Both halves share one timeout budget. The counterpart may wake us
    /// before we have drawn our ticket; its wake then blocks until we do,
    /// so the release is never lost.
    ///
    /// # Errors
    /// Returns `Timeout` when either half exceeds the budget.
    pub fn wake_and_wait(&self, target_count: u32, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        self.wake_from(start, target_count, timeout, None)?;
        self.wait_until(start, timeout, None)
    }

    /// [`wake`](Self::wake) with the release count given at creation
    ///
    /// # Errors
    /// Same as [`wake`](Self::wake)
    pub fn wake_default(&self, timeout: Option<Duration>) -> Result<()> {
        self.wake(self.release_count, timeout)
    }

    /// [`wake_and_wait`](Self::wake_and_wait) with the release count given
    /// at creation
    ///
    /// # Errors
    /// Same as [`wake_and_wait`](Self::wake_and_wait)
    pub fn wake_and_wait_default(&self, timeout: Option<Duration>) -> Result<()> {
        self.wake_and_wait(self.release_count, timeout)
    }

    /// [`wait`](Self::wait) that also gives up when `guard` fails
    ///
    /// `guard` is polled every [`GUARD_INTERVAL`] while blocked, typically
    /// to check that the counterpart is still alive. Its error is returned
    /// unless the release arrived in the meantime. An abandoned wait leaves
    /// its ticket behind, so the checkpoint should not be reused.
    ///
    /// # Errors
    /// Returns the guard's error or `Timeout`.
    pub fn wait_guarded(&self, timeout: Option<Duration>, guard: &mut Guard<'_>) -> Result<()> {
        self.wait_until(Instant::now(), timeout, Some(guard))
    }

    /// [`wake`](Self::wake) that also gives up when `guard` fails
    ///
    /// # Errors
    /// Returns the guard's error or `Timeout`.
    pub fn wake_guarded(
        &self,
        target_count: u32,
        timeout: Option<Duration>,
        guard: &mut Guard<'_>,
    ) -> Result<()> {
        self.wake_from(Instant::now(), target_count, timeout, Some(guard))
    }

    /// [`wake_and_wait`](Self::wake_and_wait) that also gives up when
    /// `guard` fails
    ///
    /// # Errors
    /// Returns the guard's error or `Timeout`.
    pub fn wake_and_wait_guarded(
        &self,
        target_count: u32,
        timeout: Option<Duration>,
        guard: &mut Guard<'_>,
    ) -> Result<()> {
        let start = Instant::now();
        self.wake_from(start, target_count, timeout, Some(&mut *guard))?;
        self.wait_until(start, timeout, Some(guard))
    }

    fn wait_until(
        &self,
        start: Instant,
        timeout: Option<Duration>,
        mut guard: Option<&mut Guard<'_>>,
    ) -> Result<()> {
        let state = &*self.state;
        let ticket = state.tickets.fetch_add(1, Ordering::SeqCst);

        // A waker may be sleeping until enough tickets are outstanding.
        futex::wake_all(&state.tickets).map_err(|e| Error::resource("futex wake", e))?;

        tracing::trace!(ticket, "Checkpoint wait");

        loop {
            let served = state.served.load(Ordering::SeqCst);
            if is_released(ticket, served) {
                tracing::trace!(ticket, served, "Checkpoint released");
                return Ok(());
            }

            if let Some(guard) = guard.as_deref_mut() {
                if let Err(e) = guard() {
                    // The counterpart may have released us right before going away.
                    if is_released(ticket, state.served.load(Ordering::SeqCst)) {
                        return Ok(());
                    }
                    tracing::debug!(ticket, error = %e, "Checkpoint wait abandoned");
                    return Err(e);
                }
            }

            let remaining = remaining(start, timeout, "checkpoint wait")?;
            let slice = slice(remaining, guard.is_some());
            match futex::wait(&state.served, served, slice) {
                Ok(()) | Err(Errno::EAGAIN | Errno::EINTR | Errno::ETIMEDOUT) => {}
                Err(e) => return Err(Error::resource("futex wait", e)),
            }
        }
    }

    fn wake_from(
        &self,
        start: Instant,
        target_count: u32,
        timeout: Option<Duration>,
        mut guard: Option<&mut Guard<'_>>,
    ) -> Result<()> {
        let state = &*self.state;

        loop {
            let tickets = state.tickets.load(Ordering::SeqCst);
            let served = state.served.load(Ordering::SeqCst);

            if tickets.wrapping_sub(served) >= target_count {
                if state
                    .served
                    .compare_exchange(
                        served,
                        served.wrapping_add(target_count),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_err()
                {
                    // Another waker served concurrently; re-count.
                    continue;
                }
                break;
            }

            if let Some(guard) = guard.as_deref_mut() {
                if let Err(e) = guard() {
                    let outstanding = state
                        .tickets
                        .load(Ordering::SeqCst)
                        .wrapping_sub(state.served.load(Ordering::SeqCst));
                    if outstanding >= target_count {
                        continue;
                    }
                    tracing::debug!(target_count, error = %e, "Checkpoint wake abandoned");
                    return Err(e);
                }
            }

            let remaining = remaining(start, timeout, "checkpoint wake")?;
            let slice = slice(remaining, guard.is_some());
            match futex::wait(&state.tickets, tickets, slice) {
                Ok(()) | Err(Errno::EAGAIN | Errno::EINTR | Errno::ETIMEDOUT) => {}
                Err(e) => return Err(Error::resource("futex wait", e)),
            }
        }

        let phase = state.phase.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let woken = futex::wake_all(&state.served).map_err(|e| Error::resource("futex wake", e))?;
        tracing::trace!(phase, target_count, woken, "Checkpoint wake");

        Ok(())
    }
}

/// Longest a guarded operation sleeps before polling its guard again
pub const GUARD_INTERVAL: Duration = Duration::from_millis(50);

/// Check run by guarded checkpoint operations while they block
pub type Guard<'a> = dyn FnMut() -> Result<()> + 'a;

/// How long one futex sleep may last
fn slice(remaining: Option<Duration>, guarded: bool) -> Option<Duration> {
    if !guarded {
        return remaining;
    }
    Some(remaining.map_or(GUARD_INTERVAL, |r| r.min(GUARD_INTERVAL)))
}

/// Whether `ticket` has been served given the current `served` counter
#[allow(clippy::cast_possible_wrap)]
const fn is_released(ticket: u32, served: u32) -> bool {
    (served.wrapping_sub(ticket) as i32) > 0
}

/// Time left before the deadline, or a `Timeout` error once it passed
fn remaining(start: Instant, timeout: Option<Duration>, operation: &str) -> Result<Option<Duration>> {
    let Some(limit) = timeout else {
        return Ok(None);
    };

    let elapsed = start.elapsed();
    if elapsed >= limit {
        return Err(Error::Timeout {
            operation: operation.to_string(),
            elapsed,
        });
    }

    Ok(Some(limit - elapsed))
}
