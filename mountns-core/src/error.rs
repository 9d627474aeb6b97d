//! Error types for the mount propagation harness

use nix::errno::Errno;
use std::time::Duration;
use thiserror::Error;

use crate::report::Verdict;

/// Harness error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System error from nix
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// Allocation of a kernel resource failed (shared memory, clone, ...)
    #[error("Resource error during {operation}: {source}")]
    Resource {
        /// Operation that failed
        operation: String,
        /// Underlying errno
        source: Errno,
    },

    /// A mount or unmount step failed
    #[error("Mount error at step {step} ({target}): {errno}")]
    Mount {
        /// Ordinal of the failing step
        step: usize,
        /// Path the step operated on
        target: String,
        /// Underlying errno
        errno: Errno,
    },

    /// The counterpart never signaled a checkpoint
    #[error("Timed out after {elapsed:?} during {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Time spent before giving up
        elapsed: Duration,
    },

    /// A cloned child was terminated by a signal
    #[error("Child {pid} was killed by signal {signal}")]
    Fatal {
        /// Child process ID
        pid: i32,
        /// Signal name
        signal: String,
    },

    /// Observed visibility did not match the expectation
    #[error("Assertion failed in {phase}: {message}")]
    Assertion {
        /// Phase in which the check ran
        phase: String,
        /// Error message
        message: String,
    },

    /// Permission denied
    #[error("Permission denied: {operation}")]
    PermissionDenied {
        /// Operation that was denied
        operation: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// The counterpart broke the phase protocol or reported a failure
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message
        message: String,
    },

    /// Namespace operation failed
    #[error("Namespace error: {message}")]
    Namespace {
        /// Error message
        message: String,
    },
}

impl Error {
    /// Build a resource error, routing `EPERM` to [`Error::PermissionDenied`]
    #[must_use]
    pub fn resource(operation: impl Into<String>, errno: Errno) -> Self {
        let operation = operation.into();
        if errno == Errno::EPERM {
            Self::PermissionDenied { operation }
        } else {
            Self::Resource {
                operation,
                source: errno,
            }
        }
    }

    /// The single verdict a case reports when it ends with this error
    #[must_use]
    pub const fn verdict(&self) -> Verdict {
        match self {
            Self::Assertion { .. } => Verdict::Fail,
            Self::PermissionDenied { .. } => Verdict::ConfigSkip,
            _ => Verdict::Broken,
        }
    }

    /// Whether the error indicates the suite itself broke rather than the test
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, Error>;
