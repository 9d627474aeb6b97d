//! Namespace lifecycle management for the calling process

use nix::sched::unshare;
use mountns_core::{Error, Result};

use crate::config::{NamespaceConfig, NamespaceFlags};

/// Moves the calling process into fresh namespaces via unshare(2)
///
/// The driver uses this on the parent side so that every mount it makes
/// stays out of the host's mount table.
#[derive(Debug)]
pub struct NamespaceManager {
    config: NamespaceConfig,
    created: bool,
}

impl NamespaceManager {
    /// Create a new namespace manager
    #[must_use]
    pub const fn new(config: NamespaceConfig) -> Self {
        Self {
            config,
            created: false,
        }
    }

    /// Create a new namespace manager with default config
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(NamespaceConfig::default())
    }

    /// Get the configuration
    #[must_use]
    pub const fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /// Check if namespaces have been created
    #[must_use]
    pub const fn is_created(&self) -> bool {
        self.created
    }

    /// Create the configured namespaces
    ///
    /// `CLONE_NEWNS` fails with `EINVAL` when the process is
    /// multi-threaded, so call this before spawning threads.
    ///
    /// # Errors
    /// Returns `PermissionDenied` without `CAP_SYS_ADMIN`, `Resource` otherwise
    pub fn create(&mut self) -> Result<()> {
        if self.created {
            tracing::warn!("Namespaces already created");
            return Ok(());
        }

        if !self.config.has_any() {
            tracing::warn!("No namespaces enabled");
            return Ok(());
        }

        // A new PID namespace only applies to children of the caller
        let config = self.config.with(NamespaceFlags::PID, false);
        if config != self.config {
            tracing::debug!("Skipping PID namespace for the calling process");
        }

        let enabled = config.enabled_namespaces();
        tracing::info!(namespaces = ?enabled, "Unsharing namespaces");

        unshare(config.to_clone_flags()).map_err(|e| {
            tracing::error!(
                error = %e,
                namespaces = ?enabled,
                "Failed to unshare namespaces"
            );
            Error::resource("unshare", e)
        })?;

        self.created = true;
        tracing::debug!(namespaces = ?enabled, "Namespace setup complete");

        Ok(())
    }

    /// Get current namespace IDs
    ///
    /// # Errors
    /// Returns error if reading namespace IDs fails
    pub fn current_namespaces(&self) -> Result<NamespaceInfo> {
        Self::namespaces_for_pid(std::process::id())
    }

    /// Get namespace IDs for a specific PID
    ///
    /// # Errors
    /// Returns error if the process does not exist
    pub fn namespaces_for_pid(pid: u32) -> Result<NamespaceInfo> {
        let base_path = format!("/proc/{pid}/ns");

        if !std::path::Path::new(&base_path).exists() {
            return Err(Error::Namespace {
                message: format!("No namespace information for PID {pid}"),
            });
        }

        let read_ns = |name: &str| -> Option<String> {
            std::fs::read_link(format!("{base_path}/{name}"))
                .map(|p| p.to_string_lossy().into_owned())
                .ok()
        };

        Ok(NamespaceInfo {
            mnt: read_ns("mnt"),
            pid: read_ns("pid"),
            net: read_ns("net"),
            uts: read_ns("uts"),
            ipc: read_ns("ipc"),
            user: read_ns("user"),
            cgroup: read_ns("cgroup"),
        })
    }
}

/// Namespace identities of one process, as read from `/proc/<pid>/ns`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceInfo {
    /// Mount namespace ID
    pub mnt: Option<String>,
    /// PID namespace ID
    pub pid: Option<String>,
    /// Network namespace ID
    pub net: Option<String>,
    /// UTS namespace ID
    pub uts: Option<String>,
    /// IPC namespace ID
    pub ipc: Option<String>,
    /// User namespace ID
    pub user: Option<String>,
    /// CGroup namespace ID
    pub cgroup: Option<String>,
}

impl NamespaceInfo {
    /// Check if in a different mount, PID or network namespace than init
    ///
    /// # Errors
    /// Returns error if cannot read namespaces
    pub fn is_isolated(&self) -> Result<bool> {
        let init_ns = NamespaceManager::namespaces_for_pid(1)?;

        Ok(self.pid != init_ns.pid || self.net != init_ns.net || self.mnt != init_ns.mnt)
    }

    /// Whether both processes see the same mount table
    #[must_use]
    pub fn shares_mount_namespace(&self, other: &Self) -> bool {
        self.mnt.is_some() && self.mnt == other.mnt
    }
}

impl std::fmt::Display for NamespaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Namespace Info:")?;
        let rows = [
            ("MNT", &self.mnt),
            ("PID", &self.pid),
            ("NET", &self.net),
            ("UTS", &self.uts),
            ("IPC", &self.ipc),
            ("USER", &self.user),
            ("CGROUP", &self.cgroup),
        ];
        for (label, value) in rows {
            if let Some(value) = value {
                writeln!(f, "  {:<7} {value}", format!("{label}:"))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_creation() {
        let manager = NamespaceManager::with_defaults();

        assert!(!manager.is_created());
        assert!(manager.config().enables(NamespaceFlags::MNT));
    }

    #[test]
    fn test_empty_config_is_noop() {
        let mut manager = NamespaceManager::new(NamespaceConfig::none());
        manager.create().unwrap();
        assert!(!manager.is_created());
    }

    #[test]
    fn test_current_namespaces() {
        let manager = NamespaceManager::with_defaults();
        let info = manager.current_namespaces().unwrap();

        assert!(info.mnt.is_some());
        assert!(info.shares_mount_namespace(&info.clone()));
    }

    #[test]
    fn test_unknown_pid() {
        assert!(NamespaceManager::namespaces_for_pid(u32::MAX).is_err());
    }

    #[test]
    fn test_namespace_info_display() {
        let info = NamespaceInfo {
            mnt: Some("mnt:[4026531841]".to_string()),
            net: Some("net:[4026531905]".to_string()),
            ..Default::default()
        };

        let display = format!("{info}");
        assert!(display.contains("MNT:    mnt:[4026531841]"));
        assert!(display.contains("NET:"));
        assert!(!display.contains("PID:"));
    }
}
