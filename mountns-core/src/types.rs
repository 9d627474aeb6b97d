//! Core type definitions with strong typing and validation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Test case identifier with validation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(try_from = "String", into = "String")]
pub struct CaseId(String);

impl CaseId {
    /// Maximum length for case IDs
    pub const MAX_LENGTH: usize = 64;

    /// Create a new `CaseId` with validation
    ///
    /// # Errors
    /// Returns error if ID is invalid (empty, too long, or contains invalid characters)
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidConfig {
                message: "Case ID cannot be empty".to_string(),
            });
        }

        if id.len() > Self::MAX_LENGTH {
            return Err(Error::InvalidConfig {
                message: format!("Case ID too long (max {} chars)", Self::MAX_LENGTH),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidConfig {
                message: "Case ID can only contain alphanumeric, dash, and underscore".to_string(),
            });
        }

        Ok(())
    }

    /// Get the case ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for CaseId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<CaseId> for String {
    fn from(id: CaseId) -> Self {
        id.0
    }
}

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ProcessId(i32);

impl ProcessId {
    /// Create from raw PID
    #[must_use]
    pub const fn from_raw(pid: i32) -> Self {
        Self(pid)
    }

    /// Convert to `nix::unistd::Pid`
    #[must_use]
    pub const fn as_nix_pid(self) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(self.0)
    }

    /// Get raw PID value
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<nix::unistd::Pid> for ProcessId {
    fn from(pid: nix::unistd::Pid) -> Self {
        Self(pid.as_raw())
    }
}

impl From<ProcessId> for nix::unistd::Pid {
    fn from(pid: ProcessId) -> Self {
        Self::from_raw(pid.0)
    }
}

/// One side of a parent/child protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The process that built the fixture and cloned the child
    Parent,
    /// The cloned process living in the new mount namespace
    Child,
}

impl Side {
    /// The opposite side
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Parent => Self::Child,
            Self::Child => Self::Parent,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parent => write!(f, "parent"),
            Self::Child => write!(f, "child"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_id_validation() {
        assert!(CaseId::new("shared-parent").is_ok());
        assert!(CaseId::new("slave_child2").is_ok());
        assert!(CaseId::new("").is_err());
        assert!(CaseId::new("a".repeat(65)).is_err());
        assert!(CaseId::new("shared parent").is_err());
        assert!(CaseId::new("../etc").is_err());
    }

    #[test]
    fn test_case_id_serde() {
        let id = CaseId::new("shared-child").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"shared-child\"");
        let deserialized: CaseId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);

        assert!(serde_json::from_str::<CaseId>("\"bad id\"").is_err());
    }

    #[test]
    fn test_process_id() {
        let pid = ProcessId::from_raw(123);
        assert_eq!(pid.as_raw(), 123);
        assert_eq!(pid.as_nix_pid().as_raw(), 123);
    }

    #[test]
    fn test_side_peer() {
        assert_eq!(Side::Parent.peer(), Side::Child);
        assert_eq!(Side::Child.peer(), Side::Parent);
        assert_eq!(Side::Child.to_string(), "child");
    }
}
