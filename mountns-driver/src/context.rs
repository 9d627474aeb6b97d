//! Per-case test context

use std::path::{Path, PathBuf};
use std::time::Duration;

use mountns_core::{CaseId, Result};

use crate::case::CaseSpec;
use crate::config::{HarnessConfig, PeerUnmount};

/// Everything one case needs, built fresh for every case
///
/// Passed by reference through the driver; nothing here is process-wide.
#[derive(Debug, Clone)]
pub struct TestContext {
    case: CaseSpec,
    workdir: PathBuf,
    dir_a: PathBuf,
    dir_b: PathBuf,
    timeout: Option<Duration>,
    stack_size: usize,
    peer_unmount: PeerUnmount,
    unshare_parent: bool,
    isolate_root: bool,
}

impl TestContext {
    /// Derive the context of `case` from the run configuration
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the configuration does not validate
    pub fn new(config: &HarnessConfig, case: &CaseSpec) -> Result<Self> {
        config.validate()?;

        let workdir = config.workdir.join(case.name.as_str());
        Ok(Self {
            case: case.clone(),
            dir_a: workdir.join("A"),
            dir_b: workdir.join("B"),
            workdir,
            timeout: config.timeout,
            stack_size: config.stack_size,
            peer_unmount: config.peer_unmount,
            unshare_parent: config.unshare_parent,
            isolate_root: config.isolate_root,
        })
    }

    /// The case being run
    #[must_use]
    pub const fn case(&self) -> &CaseSpec {
        &self.case
    }

    /// Case identifier
    #[must_use]
    pub const fn case_id(&self) -> &CaseId {
        &self.case.name
    }

    /// Directory holding `A` and `B`
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Directory `A`, the mount point under test
    #[must_use]
    pub fn dir_a(&self) -> &Path {
        &self.dir_a
    }

    /// Directory `B`, the bind source
    #[must_use]
    pub fn dir_b(&self) -> &Path {
        &self.dir_b
    }

    /// `A/B`: exists only while `B` is mounted on `A`
    #[must_use]
    pub fn probe(&self) -> PathBuf {
        self.dir_a.join("B")
    }

    /// Checkpoint timeout
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Clone stack size
    #[must_use]
    pub const fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Peer unmount policy
    #[must_use]
    pub const fn peer_unmount(&self) -> PeerUnmount {
        self.peer_unmount
    }

    /// Whether the driver unshares its own mount namespace
    #[must_use]
    pub const fn unshare_parent(&self) -> bool {
        self.unshare_parent
    }

    /// Whether `/` is made recursively private first
    #[must_use]
    pub const fn isolate_root(&self) -> bool {
        self.isolate_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::select_cases;

    #[test]
    fn test_paths() {
        let config = HarnessConfig::new().with_workdir("/run/mountns");
        let case = select_cases(&["shared-parent".to_string()]).unwrap().remove(0);
        let ctx = TestContext::new(&config, &case).unwrap();

        assert_eq!(ctx.workdir(), Path::new("/run/mountns/shared-parent"));
        assert_eq!(ctx.dir_a(), Path::new("/run/mountns/shared-parent/A"));
        assert_eq!(ctx.dir_b(), Path::new("/run/mountns/shared-parent/B"));
        assert_eq!(ctx.probe(), PathBuf::from("/run/mountns/shared-parent/A/B"));
        assert_eq!(ctx.case_id().as_str(), "shared-parent");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = HarnessConfig::new().with_workdir("relative/dir");
        let case = select_cases(&[]).unwrap().remove(0);
        assert!(TestContext::new(&config, &case).is_err());
    }
}
