//! Mountns Core - Foundation types, verdicts, and reporting
//!
//! This crate provides the core abstractions shared by the mount
//! propagation harness: the error taxonomy, identifiers and the
//! per-case report model.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod report;
pub mod types;

pub use error::{Error, Result};
pub use report::{
    CaseReport, CollectingSink, PhaseResult, ResultSink, TracingSink, Verdict, exit_code,
};
pub use types::{CaseId, ProcessId, Side};
