//! Scenario model: an ordered group of equivalent invocation variants with
//! shared setup, guards and teardown.
//!
//! Scenarios are plain data. The built-in [`catalog`] constructs them in code
//! and TOML catalogs deserialize into the same types; the
//! [`crate::runner::ScenarioRunner`] is the only interpreter.

#![allow(missing_docs)]

pub mod catalog;
pub mod fixtures;

use serde::{Deserialize, Serialize};

use crate::verify::equivalence::Check;
use crate::verify::guards::GuardSpec;
use crate::verify::skip::SkipCondition;

/// One scenario group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scenario {
    pub name: String,
    /// When set, a failed variant aborts the remaining variants because later
    /// variants depend on host state established by earlier ones.
    #[serde(default)]
    pub ordered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_when: Option<SkipCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineSource>,
    pub variants: Vec<Variant>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<GuardSpec>,
    /// Runs after every variant, whatever its outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_teardown: Option<Step>,
    /// Runs once after the last variant, even after failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown: Option<Step>,
}

impl Scenario {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ordered: false,
            skip_when: None,
            setup: None,
            baseline: None,
            variants: Vec::new(),
            guards: Vec::new(),
            variant_teardown: None,
            teardown: None,
        }
    }

    #[must_use]
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    #[must_use]
    pub fn skip_when(mut self, condition: SkipCondition) -> Self {
        self.skip_when = Some(condition);
        self
    }

    #[must_use]
    pub fn setup(mut self, step: Step) -> Self {
        self.setup = Some(step);
        self
    }

    #[must_use]
    pub fn baseline(mut self, source: BaselineSource) -> Self {
        self.baseline = Some(source);
        self
    }

    #[must_use]
    pub fn variant(mut self, variant: Variant) -> Self {
        self.variants.push(variant);
        self
    }

    #[must_use]
    pub fn guard(mut self, guard: GuardSpec) -> Self {
        self.guards.push(guard);
        self
    }

    #[must_use]
    pub fn variant_teardown(mut self, step: Step) -> Self {
        self.variant_teardown = Some(step);
        self
    }

    #[must_use]
    pub fn teardown(mut self, step: Step) -> Self {
        self.teardown = Some(step);
        self
    }
}

/// A sequence of commands run for their side effects or captured output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub commands: Vec<StepCommand>,
}

impl Step {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command that must succeed.
    #[must_use]
    pub fn run(mut self, command: impl Into<String>) -> Self {
        self.commands.push(StepCommand::new(command));
        self
    }

    /// Append a command whose trimmed stdout becomes fixture `name`.
    #[must_use]
    pub fn capture(mut self, command: impl Into<String>, name: impl Into<String>) -> Self {
        let mut cmd = StepCommand::new(command);
        cmd.capture = Some(name.into());
        cmd.require_output = true;
        self.commands.push(cmd);
        self
    }

    /// Append a command whose exit status is ignored.
    #[must_use]
    pub fn run_lenient(mut self, command: impl Into<String>) -> Self {
        let mut cmd = StepCommand::new(command);
        cmd.require_success = false;
        self.commands.push(cmd);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepCommand {
    pub run: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture: Option<String>,
    #[serde(default = "default_true")]
    pub require_success: bool,
    #[serde(default)]
    pub require_output: bool,
}

impl StepCommand {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            run: command.into(),
            capture: None,
            require_success: true,
            require_output: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Where a scenario's baseline comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaselineSource {
    /// A dedicated command run once after setup (e.g. the host-side listing).
    Command { run: String },
    /// The first declared variant, when it passes. Never a later one.
    FirstVariant,
}

/// Exit status a variant is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedStatus {
    #[default]
    Success,
    Failure,
}

/// One activation mechanism's invocation of the operation under test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Variant {
    pub name: String,
    pub run: String,
    #[serde(default)]
    pub expect: ExpectedStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<Check>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// The mechanism is known to follow the escaping path; containment
    /// guards then demand a loud, specific failure instead of an empty
    /// sandbox alone.
    #[serde(default)]
    pub known_vulnerable: bool,
}

impl Variant {
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: command.into(),
            expect: ExpectedStatus::Success,
            checks: Vec::new(),
            labels: Vec::new(),
            known_vulnerable: false,
        }
    }

    #[must_use]
    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    #[must_use]
    pub fn expect_failure(mut self) -> Self {
        self.expect = ExpectedStatus::Failure;
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    #[must_use]
    pub fn known_vulnerable(mut self) -> Self {
        self.known_vulnerable = true;
        self
    }

    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_builders_set_flags() {
        let step = Step::new()
            .run("docker pull ubuntu")
            .capture("mktemp -d -p $(pwd)", "output_dir")
            .run_lenient("rm -rf {{output_dir}}");
        assert!(step.commands[0].require_success);
        assert_eq!(step.commands[1].capture.as_deref(), Some("output_dir"));
        assert!(step.commands[1].require_output);
        assert!(!step.commands[2].require_success);
    }

    #[test]
    fn variant_defaults_expect_success() {
        let variant = Variant::new("env", "docker run ubuntu true").label("legacy");
        assert_eq!(variant.expect, ExpectedStatus::Success);
        assert!(variant.has_label("legacy"));
        assert!(!variant.has_label("cdi"));
        assert!(!variant.known_vulnerable);
    }

    #[test]
    fn toml_step_command_defaults() {
        let cmd: StepCommand = toml::from_str(r#"run = "docker pull ubuntu""#).unwrap();
        assert!(cmd.require_success);
        assert!(!cmd.require_output);
        assert!(cmd.capture.is_none());
    }
}
