//! Per-case verdicts and result reporting with structured tracing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::{CaseId, Side};

/// Outcome category of a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every assertion held
    Pass,
    /// A visibility assertion did not hold
    Fail,
    /// The harness could not complete the case
    Broken,
    /// The environment cannot run the case (e.g. missing privileges)
    ConfigSkip,
}

impl Verdict {
    /// Bit contributed to the suite exit code
    #[must_use]
    pub const fn exit_bit(self) -> i32 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
            Self::Broken => 2,
            Self::ConfigSkip => 32,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Broken => "BROK",
            Self::ConfigSkip => "CONF",
        };
        f.write_str(label)
    }
}

/// Result of one visibility check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    /// Phase ordinal (1 or 2)
    pub phase: u8,
    /// Side that performed the check
    pub observer: Side,
    /// Whether the probe was expected to exist
    pub expected_visible: bool,
    /// Whether the check held
    pub passed: bool,
}

/// Final report for one test case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseReport {
    /// Case identifier
    pub case: CaseId,
    /// The single verdict for the case
    pub verdict: Verdict,
    /// Human readable message
    pub message: String,
    /// Visibility checks in the order they ran
    #[serde(default)]
    pub phases: Vec<PhaseResult>,
    /// Wall time spent on the case
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl CaseReport {
    /// Create a report without phase details
    #[must_use]
    pub fn new(case: CaseId, verdict: Verdict, message: impl Into<String>) -> Self {
        Self {
            case,
            verdict,
            message: message.into(),
            phases: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Attach phase results
    #[must_use]
    pub fn with_phases(mut self, phases: Vec<PhaseResult>) -> Self {
        self.phases = phases;
        self
    }

    /// Attach the elapsed time
    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Emit structured tracing event
    pub fn emit_trace(&self) {
        let passed = self.phases.iter().filter(|p| p.passed).count();
        match self.verdict {
            Verdict::Pass => {
                tracing::info!(
                    case = %self.case,
                    phases_passed = passed,
                    duration_ms = self.duration.as_millis(),
                    verdict = "pass",
                    "{}",
                    self.message
                );
            }
            Verdict::ConfigSkip => {
                tracing::warn!(
                    case = %self.case,
                    verdict = "config_skip",
                    "{}",
                    self.message
                );
            }
            Verdict::Fail => {
                tracing::error!(
                    case = %self.case,
                    phases_passed = passed,
                    phases_total = self.phases.len(),
                    verdict = "fail",
                    "{}",
                    self.message
                );
            }
            Verdict::Broken => {
                tracing::error!(
                    case = %self.case,
                    verdict = "broken",
                    "{}",
                    self.message
                );
            }
        }
    }
}

impl fmt::Display for CaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.case, self.verdict, self.message)
    }
}

/// Destination for case reports
pub trait ResultSink {
    /// Record the verdict of one case
    fn report(&mut self, report: &CaseReport);
}

/// Sink that only logs each report
#[derive(Debug, Default)]
pub struct TracingSink;

impl ResultSink for TracingSink {
    fn report(&mut self, report: &CaseReport) {
        report.emit_trace();
    }
}

/// Sink that keeps every report in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    reports: Vec<CaseReport>,
}

impl CollectingSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports received so far
    #[must_use]
    pub fn reports(&self) -> &[CaseReport] {
        &self.reports
    }

    /// Exit code for the collected verdicts
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        exit_code(&self.reports)
    }
}

impl ResultSink for CollectingSink {
    fn report(&mut self, report: &CaseReport) {
        self.reports.push(report.clone());
    }
}

/// Process exit code for a set of reports
///
/// Fail and Broken bits are OR-ed together; a run where every case was
/// skipped yields the skip code.
#[must_use]
pub fn exit_code(reports: &[CaseReport]) -> i32 {
    if !reports.is_empty() && reports.iter().all(|r| r.verdict == Verdict::ConfigSkip) {
        return Verdict::ConfigSkip.exit_bit();
    }

    reports
        .iter()
        .filter(|r| r.verdict != Verdict::ConfigSkip)
        .fold(0, |code, r| code | r.verdict.exit_bit())
}

/// Case durations on the wire are whole milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(value.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(verdict: Verdict) -> CaseReport {
        CaseReport::new(CaseId::new("shared-parent").unwrap(), verdict, "done")
    }

    #[test]
    fn test_report_serde() {
        let original = report(Verdict::Fail)
            .with_phases(vec![PhaseResult {
                phase: 1,
                observer: Side::Child,
                expected_visible: true,
                passed: false,
            }])
            .with_duration(Duration::from_millis(1500));

        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains("\"verdict\":\"fail\""));
        assert!(json.contains("\"duration\":1500"));

        let back: CaseReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.verdict, Verdict::Fail);
        assert_eq!(back.phases, original.phases);
    }

    #[test]
    fn test_exit_code_combines_bits() {
        let mut sink = CollectingSink::new();
        assert_eq!(sink.exit_code(), 0);

        sink.report(&report(Verdict::Pass));
        sink.report(&report(Verdict::ConfigSkip));
        assert_eq!(sink.exit_code(), 0);

        sink.report(&report(Verdict::Fail));
        sink.report(&report(Verdict::Broken));
        assert_eq!(sink.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_all_skipped() {
        let mut sink = CollectingSink::new();
        sink.report(&report(Verdict::ConfigSkip));
        sink.report(&report(Verdict::ConfigSkip));
        assert_eq!(sink.exit_code(), 32);
    }

    #[test]
    fn test_display() {
        assert_eq!(report(Verdict::Broken).to_string(), "shared-parent BROK: done");
    }
}
