//! Run report: per-scenario and per-variant outcomes with failure detail.

#![allow(missing_docs)]

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::verify::equivalence::Mismatch;
use crate::verify::guards::GuardViolation;

/// Why a variant (or a scenario's setup) failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// The executor could not run a command at all.
    Transport { code: String, message: String },
    /// Exit status differed from the declared expectation.
    UnexpectedStatus {
        expected: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    Mismatch(Mismatch),
    /// A baseline comparison was requested but no baseline exists.
    NoBaseline,
    GuardViolation(GuardViolation),
    /// Setup, skip evaluation or fixture rendering failed.
    Setup { code: String, message: String },
}

impl Failure {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Transport { message, .. } => format!("transport failure: {message}"),
            Self::UnexpectedStatus {
                expected,
                exit_code,
                stderr,
            } => {
                let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                let mut text = format!("expected {expected}, exit status {code}");
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    let _ = write!(text, "; stderr: {stderr}");
                }
                text
            }
            Self::Mismatch(mismatch) => mismatch.describe(),
            Self::NoBaseline => "no baseline was captured to compare against".to_string(),
            Self::GuardViolation(violation) => {
                format!("guard {} violated: {}", violation.guard, violation.message)
            }
            Self::Setup { message, .. } => format!("setup failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VariantOutcome {
    Passed,
    Failed,
    Skipped { reason: String },
    /// Not run because an earlier failure ended the scenario.
    Aborted { reason: String },
}

impl VariantOutcome {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped { .. } => "skipped",
            Self::Aborted { .. } => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantReport {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    pub outcome: VariantOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<Failure>,
    /// Non-fatal observations, e.g. a variant teardown that failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl VariantReport {
    #[must_use]
    pub fn new(name: impl Into<String>, labels: Vec<String>) -> Self {
        Self {
            name: name.into(),
            labels,
            outcome: VariantOutcome::Passed,
            failures: Vec::new(),
            notes: Vec::new(),
            exit_code: None,
            duration_ms: 0,
        }
    }

    #[must_use]
    pub fn skipped(name: impl Into<String>, labels: Vec<String>, reason: impl Into<String>) -> Self {
        let mut report = Self::new(name, labels);
        report.outcome = VariantOutcome::Skipped {
            reason: reason.into(),
        };
        report
    }

    #[must_use]
    pub fn aborted(name: impl Into<String>, labels: Vec<String>, reason: impl Into<String>) -> Self {
        let mut report = Self::new(name, labels);
        report.outcome = VariantOutcome::Aborted {
            reason: reason.into(),
        };
        report
    }

    /// Record a failure; the outcome becomes `Failed`.
    pub fn fail(&mut self, failure: Failure) {
        self.outcome = VariantOutcome::Failed;
        self.failures.push(failure);
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == VariantOutcome::Passed
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        self.outcome == VariantOutcome::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScenarioOutcome {
    Passed,
    Failed,
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub outcome: ScenarioOutcome,
    /// Primary cause when the scenario failed before or outside any variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_failure: Option<Failure>,
    pub variants: Vec<VariantReport>,
    /// Logged teardown errors. Never replaces the primary failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<String>,
    pub duration_ms: u64,
}

impl ScenarioReport {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: ScenarioOutcome::Passed,
            setup_failure: None,
            variants: Vec::new(),
            teardown_errors: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Derive the scenario outcome from its parts.
    ///
    /// Failed when setup failed or any variant failed or was aborted;
    /// skipped when every variant was skipped; passed otherwise.
    pub fn settle(&mut self) {
        if matches!(self.outcome, ScenarioOutcome::Skipped { .. }) {
            return;
        }
        let any_failed = self.setup_failure.is_some()
            || self.variants.iter().any(|v| {
                matches!(
                    v.outcome,
                    VariantOutcome::Failed | VariantOutcome::Aborted { .. }
                )
            });
        self.outcome = if any_failed {
            ScenarioOutcome::Failed
        } else if !self.variants.is_empty()
            && self
                .variants
                .iter()
                .all(|v| matches!(v.outcome, VariantOutcome::Skipped { .. }))
        {
            ScenarioOutcome::Skipped {
                reason: "every variant was excluded".to_string(),
            }
        } else {
            ScenarioOutcome::Passed
        };
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == ScenarioOutcome::Passed
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        self.outcome == ScenarioOutcome::Failed
    }

    #[must_use]
    pub fn skipped(&self) -> bool {
        matches!(self.outcome, ScenarioOutcome::Skipped { .. })
    }
}

/// Outcome tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub aborted: usize,
}

/// Complete record of one harness run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub target: String,
    /// Hash of the effective configuration.
    pub config_hash: String,
    /// Digest of the scenario catalog that ran.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub catalog_digest: String,
    pub scenarios: Vec<ScenarioReport>,
}

impl RunReport {
    #[must_use]
    pub fn scenario_counts(&self) -> Counts {
        let mut counts = Counts::default();
        for scenario in &self.scenarios {
            match scenario.outcome {
                ScenarioOutcome::Passed => counts.passed += 1,
                ScenarioOutcome::Failed => counts.failed += 1,
                ScenarioOutcome::Skipped { .. } => counts.skipped += 1,
            }
        }
        counts
    }

    #[must_use]
    pub fn variant_counts(&self) -> Counts {
        let mut counts = Counts::default();
        for variant in self.scenarios.iter().flat_map(|s| &s.variants) {
            match variant.outcome {
                VariantOutcome::Passed => counts.passed += 1,
                VariantOutcome::Failed => counts.failed += 1,
                VariantOutcome::Skipped { .. } => counts.skipped += 1,
                VariantOutcome::Aborted { .. } => counts.aborted += 1,
            }
        }
        counts
    }

    /// No scenario failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.scenarios.iter().all(|s| !s.failed())
    }

    #[must_use]
    pub fn scenario(&self, name: &str) -> Option<&ScenarioReport> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    /// Plain-text summary, one line per scenario with indented variants.
    ///
    /// This is the rendering for library callers. The `dip` binary prints its
    /// own colored form instead, which also honors `--verbose` and `--quiet`;
    /// this one always lists every variant, note and teardown error.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for scenario in &self.scenarios {
            let status = match &scenario.outcome {
                ScenarioOutcome::Passed => "PASS".to_string(),
                ScenarioOutcome::Failed => "FAIL".to_string(),
                ScenarioOutcome::Skipped { reason } => format!("SKIP ({reason})"),
            };
            let _ = writeln!(out, "{status:<6} {} [{} ms]", scenario.name, scenario.duration_ms);
            if let Some(failure) = &scenario.setup_failure {
                let _ = writeln!(out, "         {}", failure.describe());
            }
            for variant in &scenario.variants {
                let status = match &variant.outcome {
                    VariantOutcome::Passed => "pass".to_string(),
                    VariantOutcome::Failed => "fail".to_string(),
                    VariantOutcome::Skipped { reason } => format!("skip ({reason})"),
                    VariantOutcome::Aborted { reason } => format!("aborted ({reason})"),
                };
                let _ = writeln!(out, "    {status:<6} {}", variant.name);
                for failure in &variant.failures {
                    let _ = writeln!(out, "           {}", failure.describe());
                }
                for note in &variant.notes {
                    let _ = writeln!(out, "           note: {note}");
                }
            }
            for err in &scenario.teardown_errors {
                let _ = writeln!(out, "    teardown: {err}");
            }
        }
        let s = self.scenario_counts();
        let v = self.variant_counts();
        let _ = write!(
            out,
            "scenarios: {} passed, {} failed, {} skipped; variants: {} passed, {} failed, {} skipped, {} aborted",
            s.passed, s.failed, s.skipped, v.passed, v.failed, v.skipped, v.aborted
        );
        out
    }
}
