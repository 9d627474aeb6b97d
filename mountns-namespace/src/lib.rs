//! Namespace and mount plumbing for propagation tests
//!
//! This crate provides:
//! - Namespace configuration and `unshare` for the calling process
//! - Cloning a child into fresh namespaces and reaping it
//! - A mount fixture that builds and reliably tears down bind mounts
//! - A `/proc/<pid>/mountinfo` reader

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod cloner;
pub mod config;
pub mod fixture;
pub mod manager;
pub mod mountinfo;

pub use cloner::{DEFAULT_STACK_SIZE, ExitStatus, NamespaceHandle, clone_into_namespaces};
pub use config::{NamespaceConfig, NamespaceFlags};
pub use fixture::{MountFixture, MountSpec, Propagation};
pub use manager::{NamespaceInfo, NamespaceManager};
pub use mountinfo::MountEntry;
