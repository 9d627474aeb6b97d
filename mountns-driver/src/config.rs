//! Harness configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mountns_core::{Error, Result};
use mountns_namespace::DEFAULT_STACK_SIZE;

/// Default bound on every checkpoint wait
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Who removes the phase mount once the actor has unmounted it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerUnmount {
    /// Only the acting side unmounts
    #[default]
    Exclusive,
    /// The observer also unmounts the phase mount if it is still visible,
    /// tolerating a mount the actor already removed
    Idempotent,
}

impl fmt::Display for PeerUnmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exclusive => f.write_str("exclusive"),
            Self::Idempotent => f.write_str("idempotent"),
        }
    }
}

impl FromStr for PeerUnmount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exclusive" => Ok(Self::Exclusive),
            "idempotent" => Ok(Self::Idempotent),
            other => Err(Error::InvalidConfig {
                message: format!("Unknown peer unmount policy: {other}"),
            }),
        }
    }
}

/// Settings shared by every case of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Directory under which each case gets its own `A`/`B` pair
    pub workdir: PathBuf,

    /// Bound on checkpoint waits; `None` waits forever
    pub timeout: Option<Duration>,

    /// Stack size for the cloned child
    pub stack_size: usize,

    /// Peer unmount policy
    pub peer_unmount: PeerUnmount,

    /// Move the driver into its own mount namespace before building
    pub unshare_parent: bool,

    /// Make `/` recursively private before building the fixture
    pub isolate_root: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            workdir: std::env::temp_dir().join("mountns"),
            timeout: Some(DEFAULT_TIMEOUT),
            stack_size: DEFAULT_STACK_SIZE,
            peer_unmount: PeerUnmount::default(),
            unshare_parent: true,
            isolate_root: true,
        }
    }
}

impl HarnessConfig {
    /// Create a configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the work directory
    #[must_use]
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Set the checkpoint timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the clone stack size
    #[must_use]
    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Set the peer unmount policy
    #[must_use]
    pub const fn with_peer_unmount(mut self, policy: PeerUnmount) -> Self {
        self.peer_unmount = policy;
        self
    }

    /// Enable or disable unsharing the driver's mount namespace
    #[must_use]
    pub const fn with_unshare_parent(mut self, enable: bool) -> Self {
        self.unshare_parent = enable;
        self
    }

    /// Enable or disable recursive root isolation
    #[must_use]
    pub const fn with_root_isolation(mut self, enable: bool) -> Self {
        self.isolate_root = enable;
        self
    }

    /// Check the configuration before a run
    ///
    /// # Errors
    /// Returns `InvalidConfig` for a relative work directory or a zero timeout
    pub fn validate(&self) -> Result<()> {
        if !self.workdir.is_absolute() {
            return Err(Error::InvalidConfig {
                message: format!("Work directory must be absolute: {}", self.workdir.display()),
            });
        }

        if self.timeout == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig {
                message: "Checkpoint timeout must be positive".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.peer_unmount, PeerUnmount::Exclusive);
        assert!(config.unshare_parent);
        assert!(config.isolate_root);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(HarnessConfig::new().with_workdir("relative").validate().is_err());
        assert!(HarnessConfig::new()
            .with_timeout(Some(Duration::ZERO))
            .validate()
            .is_err());
        assert!(HarnessConfig::new().with_timeout(None).validate().is_ok());
    }

    #[test]
    fn test_peer_unmount_parse() {
        assert_eq!("idempotent".parse::<PeerUnmount>().unwrap(), PeerUnmount::Idempotent);
        assert_eq!(PeerUnmount::Exclusive.to_string(), "exclusive");
        assert!("both".parse::<PeerUnmount>().is_err());
    }

    #[test]
    fn test_config_serde() {
        let config = HarnessConfig::new().with_peer_unmount(PeerUnmount::Idempotent);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"peer_unmount\":\"idempotent\""));
        let back: HarnessConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.peer_unmount, PeerUnmount::Idempotent);
    }
}
