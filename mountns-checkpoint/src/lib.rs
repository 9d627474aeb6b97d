//! Cross-process checkpoints for ordered parent/child test phases
//!
//! This crate provides a rendezvous primitive that survives `fork`/`clone`:
//! its state lives in an anonymous shared mapping and blocking is done with
//! futexes on that mapping, so cooperating processes never busy-poll.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod checkpoint;
mod futex;
pub mod shared;

pub use checkpoint::{Checkpoint, GUARD_INTERVAL, Guard};
pub use shared::{SharedRegion, ZeroValid};
