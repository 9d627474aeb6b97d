//! Spawning children into fresh namespaces and reaping them
//!
//! This module uses `unsafe` for clone(2), which is inherently unsafe
//! but necessary to place a child directly into new namespaces.

#![allow(unsafe_code)]

use nix::sched::{CloneCb, clone};
use nix::sys::signal::{Signal, kill};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use mountns_core::{Error, ProcessId, Result};

use crate::config::{NamespaceConfig, NamespaceFlags};

/// Default stack size for cloned children
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Exit code reported when the child routine panicked
pub const PANIC_EXIT_CODE: i32 = 101;

/// Normal termination status of a joined child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitStatus(i32);

impl ExitStatus {
    /// Wrap a raw exit code
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        Self(code)
    }

    /// The exit code
    #[must_use]
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Whether the child exited with code 0
    #[must_use]
    pub const fn success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit code {}", self.0)
    }
}

/// How a reaped child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Exited(ExitStatus),
    Signaled(Signal),
}

/// A cloned child and the namespaces it was created with
///
/// The handle owns the child: [`join`](Self::join) consumes it, and a
/// handle dropped without joining kills and reaps the child so that no
/// stray process outlives a broken case.
#[derive(Debug)]
pub struct NamespaceHandle {
    pid: ProcessId,
    flags: NamespaceFlags,
    reaped: Option<Termination>,
}

impl NamespaceHandle {
    /// Child process ID
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Namespaces the child was given
    #[must_use]
    pub const fn flags(&self) -> NamespaceFlags {
        self.flags
    }

    /// Reap the child if it has already terminated, without blocking
    ///
    /// Returns `None` while the child is still running. Once reaped, the
    /// status is kept and [`join`](Self::join) returns it again.
    ///
    /// # Errors
    /// Returns `Fatal` if the child was killed by a signal, `Namespace` if
    /// it cannot be waited for.
    pub fn try_join(&mut self) -> Result<Option<ExitStatus>> {
        if self.reaped.is_none() {
            self.reaped = wait_for(self.pid, WaitPidFlag::WNOHANG)?;
        }
        self.reaped.map(|t| self.outcome(t)).transpose()
    }

    /// Block until the child terminates
    ///
    /// # Errors
    /// Returns `Fatal` if the child was killed by a signal, `Namespace` if
    /// it cannot be waited for.
    pub fn join(mut self) -> Result<ExitStatus> {
        let termination = match self.reaped {
            Some(termination) => termination,
            None => loop {
                if let Some(termination) = wait_for(self.pid, WaitPidFlag::empty())? {
                    self.reaped = Some(termination);
                    break termination;
                }
            },
        };
        self.outcome(termination)
    }

    fn outcome(&self, termination: Termination) -> Result<ExitStatus> {
        match termination {
            Termination::Exited(status) => Ok(status),
            Termination::Signaled(signal) => {
                tracing::error!(pid = %self.pid, ?signal, "Child terminated by signal");
                Err(Error::Fatal {
                    pid: self.pid.as_raw(),
                    signal: signal.as_str().to_string(),
                })
            }
        }
    }
}

impl Drop for NamespaceHandle {
    fn drop(&mut self) {
        if self.reaped.is_some() {
            return;
        }

        tracing::warn!(pid = %self.pid, "Child dropped without join, killing it");
        let _ = kill(self.pid.as_nix_pid(), Signal::SIGKILL);
        loop {
            match wait_for(self.pid, WaitPidFlag::empty()) {
                Ok(Some(termination)) => {
                    tracing::debug!(pid = %self.pid, ?termination, "Reaped killed child");
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(pid = %self.pid, error = %e, "Could not reap killed child");
                    break;
                }
            }
        }
    }
}

/// Clone a child into the namespaces selected by `config`
///
/// The child runs `child_fn` and exits with its return value. It gets a
/// copy of the parent's address space, so anything it must share with the
/// parent afterwards has to live in a shared mapping such as a
/// `Checkpoint`. Keep the closure small: it is copied, not shared.
///
/// # Errors
/// Returns `PermissionDenied` without the needed privileges and
/// `Resource` for any other clone failure (e.g. namespace limits).
pub fn clone_into_namespaces<F>(
    config: &NamespaceConfig,
    stack_size: usize,
    child_fn: F,
) -> Result<NamespaceHandle>
where
    F: FnOnce() -> i32,
{
    if stack_size < 16 * 1024 {
        return Err(Error::InvalidConfig {
            message: format!("Clone stack of {stack_size} bytes is too small"),
        });
    }

    let flags = config.flags();
    let mut stack = vec![0u8; stack_size];

    let mut child_fn = Some(child_fn);
    let callback: CloneCb<'_> = Box::new(move || {
        let code = child_fn.take().map_or(PANIC_EXIT_CODE, |f| {
            catch_unwind(AssertUnwindSafe(f)).unwrap_or(PANIC_EXIT_CODE)
        });
        code as isize
    });

    tracing::debug!(namespaces = ?flags.names(), stack_size, "Cloning child");

    // SAFETY: the child runs on its own stack in a copied address space
    // (no CLONE_VM) and leaves through the clone trampoline's exit.
    let pid = unsafe {
        clone(
            callback,
            &mut stack,
            config.to_clone_flags(),
            Some(Signal::SIGCHLD as i32),
        )
    }
    .map_err(|e| {
        tracing::error!(error = %e, namespaces = ?flags.names(), "Clone failed");
        Error::resource("clone", e)
    })?;

    // The child owns a private copy of the stack, ours can go.
    drop(stack);

    let pid = ProcessId::from(pid);
    tracing::info!(pid = %pid, namespaces = ?flags.names(), "Child cloned");

    Ok(NamespaceHandle {
        pid,
        flags,
        reaped: None,
    })
}

/// One waitpid(2) round; `None` when the child has not terminated yet
fn wait_for(pid: ProcessId, flags: WaitPidFlag) -> Result<Option<Termination>> {
    match waitpid(pid.as_nix_pid(), Some(flags)) {
        Ok(WaitStatus::Exited(_, code)) => {
            tracing::debug!(pid = %pid, code, "Child exited");
            Ok(Some(Termination::Exited(ExitStatus(code))))
        }
        Ok(WaitStatus::Signaled(_, signal, core_dumped)) => {
            tracing::debug!(pid = %pid, ?signal, core_dumped, "Child signaled");
            Ok(Some(Termination::Signaled(signal)))
        }
        Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => Ok(None),
        Ok(status) => {
            tracing::debug!(pid = %pid, ?status, "Child status changed");
            Ok(None)
        }
        Err(e) => {
            tracing::error!(pid = %pid, error = %e, "Wait failed");
            Err(Error::Namespace {
                message: format!("Failed to wait for child {pid}: {e}"),
            })
        }
    }
}
