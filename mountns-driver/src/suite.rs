//! Sequential case runner

use mountns_core::{CaseReport, Result, ResultSink, Verdict};

use crate::case::CaseSpec;
use crate::config::HarnessConfig;
use crate::context::TestContext;
use crate::driver::{PreRunHook, PropagationDriver};

/// A set of cases run one after another with a shared configuration
#[derive(Debug)]
pub struct Suite {
    config: HarnessConfig,
    cases: Vec<CaseSpec>,
    driver: PropagationDriver,
}

impl Suite {
    /// Create a suite
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the configuration does not validate
    pub fn new(config: HarnessConfig, cases: Vec<CaseSpec>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cases,
            driver: PropagationDriver::new(),
        })
    }

    /// Install a hook run before phase 1 of every case
    #[must_use]
    pub fn with_pre_run_hook(mut self, hook: PreRunHook) -> Self {
        self.driver = self.driver.with_pre_run_hook(hook);
        self
    }

    /// Cases in run order
    #[must_use]
    pub fn cases(&self) -> &[CaseSpec] {
        &self.cases
    }

    /// Run every case, reporting each verdict to `sink` as soon as it is known
    ///
    /// A failing or broken case never stops the suite.
    pub fn run(&mut self, sink: &mut dyn ResultSink) -> Vec<CaseReport> {
        tracing::info!(cases = self.cases.len(), workdir = %self.config.workdir.display(), "Suite started");

        let mut reports = Vec::with_capacity(self.cases.len());
        for case in &self.cases {
            let report = match TestContext::new(&self.config, case) {
                Ok(ctx) => self.driver.run(&ctx),
                Err(e) => CaseReport::new(case.name.clone(), e.verdict(), e.to_string()),
            };

            sink.report(&report);
            reports.push(report);
        }

        tracing::info!(
            passed = reports.iter().filter(|r| r.verdict == Verdict::Pass).count(),
            total = reports.len(),
            "Suite finished"
        );
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::select_cases;
    use mountns_core::CollectingSink;

    #[test]
    fn test_invalid_config_rejected() {
        let config = HarnessConfig::new().with_workdir("not/absolute");
        assert!(Suite::new(config, Vec::new()).is_err());
    }

    #[test]
    fn test_empty_suite() {
        let mut suite = Suite::new(HarnessConfig::new(), Vec::new()).unwrap();
        let mut sink = CollectingSink::new();
        assert!(suite.run(&mut sink).is_empty());
        assert_eq!(sink.exit_code(), 0);
    }

    #[test]
    fn test_unprivileged_run_is_skipped_not_failed() {
        if nix::unistd::geteuid().is_root() {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::new().with_workdir(dir.path());
        let cases = select_cases(&["shared-parent".to_string(), "unbindable".to_string()]).unwrap();

        let mut suite = Suite::new(config, cases).unwrap();
        let mut sink = CollectingSink::new();
        let reports = suite.run(&mut sink);

        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert_eq!(report.verdict, Verdict::ConfigSkip, "{report}");
        }
        assert_eq!(sink.exit_code(), 32);
    }
}
