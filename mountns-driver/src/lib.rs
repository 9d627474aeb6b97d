//! Mount propagation test driver
//!
//! Runs each propagation case across a parent and a child cloned into a new
//! mount namespace, coordinating the two through a shared
//! [`Checkpoint`](mountns_checkpoint::Checkpoint) and checking what each
//! side can see.
//!
//! # Example
//!
//! ```no_run
//! use mountns_core::TracingSink;
//! use mountns_driver::{HarnessConfig, Suite, builtin_cases};
//!
//! let cases = builtin_cases()?;
//! let mut suite = Suite::new(HarnessConfig::default(), cases)?;
//! let reports = suite.run(&mut TracingSink);
//! println!("exit code {}", mountns_core::exit_code(&reports));
//! # Ok::<(), mountns_core::Error>(())
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod case;
pub mod config;
pub mod context;
pub mod driver;
pub mod outcome;
pub mod suite;

pub use case::{CaseSpec, builtin_cases, select_cases};
pub use config::{DEFAULT_TIMEOUT, HarnessConfig, PeerUnmount};
pub use context::TestContext;
pub use driver::{DriverState, PreRunHook, PropagationDriver};
pub use outcome::ChildOutcome;
pub use suite::Suite;
