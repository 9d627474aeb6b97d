//! Which namespaces a cloned child or an unshare gets

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// Set of namespace kinds, one bit per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceFlags(u32);

impl NamespaceFlags {
    /// Mount namespace
    pub const MNT: Self = Self(1);
    /// PID namespace
    pub const PID: Self = Self(1 << 1);
    /// Network namespace
    pub const NET: Self = Self(1 << 2);
    /// UTS namespace
    pub const UTS: Self = Self(1 << 3);
    /// IPC namespace
    pub const IPC: Self = Self(1 << 4);
    /// User namespace
    pub const USER: Self = Self(1 << 5);
    /// Cgroup namespace
    pub const CGROUP: Self = Self(1 << 6);

    /// Every kind above
    pub const ALL: Self = Self((1 << 7) - 1);
    /// Empty set
    pub const NONE: Self = Self(0);

    // Bit, clone(2) flag and /proc/<pid>/ns entry of each kind
    const KINDS: [(Self, CloneFlags, &'static str); 7] = [
        (Self::MNT, CloneFlags::CLONE_NEWNS, "mnt"),
        (Self::PID, CloneFlags::CLONE_NEWPID, "pid"),
        (Self::NET, CloneFlags::CLONE_NEWNET, "net"),
        (Self::UTS, CloneFlags::CLONE_NEWUTS, "uts"),
        (Self::IPC, CloneFlags::CLONE_NEWIPC, "ipc"),
        (Self::USER, CloneFlags::CLONE_NEWUSER, "user"),
        (Self::CGROUP, CloneFlags::CLONE_NEWCGROUP, "cgroup"),
    ];

    /// Build from raw bits; unknown bits are dropped
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every kind in `other` is also in `self`
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no kind is set
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `/proc/<pid>/ns` entry names of the kinds in the set
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        Self::KINDS
            .iter()
            .filter(|(kind, _, _)| self.contains(*kind))
            .map(|(_, _, name)| *name)
            .collect()
    }

    /// Flags for clone(2) and unshare(2)
    #[must_use]
    pub fn clone_flags(self) -> CloneFlags {
        Self::KINDS
            .iter()
            .filter(|(kind, _, _)| self.contains(*kind))
            .fold(CloneFlags::empty(), |acc, (_, flag, _)| acc | *flag)
    }
}

impl std::ops::BitOr for NamespaceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for NamespaceFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Namespaces requested for a cloned child or for the calling process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    namespaces: NamespaceFlags,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self::mount_only()
    }
}

impl NamespaceConfig {
    /// Same as [`mount_only`](Self::mount_only)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh mount namespace and nothing else
    #[must_use]
    pub const fn mount_only() -> Self {
        Self {
            namespaces: NamespaceFlags::MNT,
        }
    }

    /// No new namespaces; a child shares everything with its parent
    #[must_use]
    pub const fn none() -> Self {
        Self {
            namespaces: NamespaceFlags::NONE,
        }
    }

    /// Add or remove `kind`
    #[must_use]
    pub const fn with(mut self, kind: NamespaceFlags, enable: bool) -> Self {
        self.namespaces = if enable {
            NamespaceFlags(self.namespaces.0 | kind.0)
        } else {
            NamespaceFlags(self.namespaces.0 & !kind.0)
        };
        self
    }

    /// Whether `kind` is requested
    #[must_use]
    pub const fn enables(&self, kind: NamespaceFlags) -> bool {
        self.namespaces.contains(kind)
    }

    /// Requested kinds as a flag set
    #[must_use]
    pub const fn flags(&self) -> NamespaceFlags {
        self.namespaces
    }

    /// Flags for clone(2) and unshare(2)
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        self.namespaces.clone_flags()
    }

    /// Whether at least one kind is requested
    #[must_use]
    pub const fn has_any(&self) -> bool {
        !self.namespaces.is_empty()
    }

    /// `/proc/<pid>/ns` names of the requested kinds
    #[must_use]
    pub fn enabled_namespaces(&self) -> Vec<&'static str> {
        self.namespaces.names()
    }
}

impl From<NamespaceFlags> for NamespaceConfig {
    fn from(namespaces: NamespaceFlags) -> Self {
        Self { namespaces }
    }
}
