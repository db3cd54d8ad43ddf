//! Pre-setup skip predicate for scenarios that only make sense on older hosts.

#![allow(missing_docs)]

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{DipError, Result};
use crate::remote::RemoteExecutor;
use crate::scenario::fixtures::Fixtures;

static LEADING_MAJOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)").expect("major version regex is valid"));

/// Skip the scenario when the subject version is not older than the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCondition {
    /// Human-readable reason recorded with the skip.
    pub reason: String,
    /// Commands the probes depend on (e.g. pulling the reference image).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prepare: Vec<String>,
    pub subject: VersionProbe,
    pub reference: VersionProbe,
}

/// A command whose stdout yields a version string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionProbe {
    pub run: String,
    #[serde(default)]
    pub extract: VersionExtract,
}

impl VersionProbe {
    #[must_use]
    pub fn new(run: impl Into<String>, extract: VersionExtract) -> Self {
        Self {
            run: run.into(),
            extract,
        }
    }
}

/// How a version string is cut out of probe output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionExtract {
    /// Whole output, trimmed.
    #[default]
    Trimmed,
    /// Text after the first `separator` (`Driver Version   : 550.54.15`).
    AfterSeparator { separator: String },
    /// Base name of a path with `prefix` stripped (`.../libcuda.so.575.51.03`).
    FileNameSuffix { prefix: String },
}

impl VersionExtract {
    #[must_use]
    pub fn apply<'a>(&self, output: &'a str) -> Option<&'a str> {
        let trimmed = output.trim();
        let version = match self {
            Self::Trimmed => trimmed,
            Self::AfterSeparator { separator } => trimmed.split_once(separator.as_str())?.1.trim(),
            Self::FileNameSuffix { prefix } => {
                let first = trimmed.lines().next()?.trim();
                let base = first.rsplit('/').next().unwrap_or(first);
                base.strip_prefix(prefix.as_str()).unwrap_or(base)
            }
        };
        (!version.is_empty()).then_some(version)
    }
}

/// Result of evaluating a [`SkipCondition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipDecision {
    pub skip: bool,
    pub subject_version: String,
    pub reference_version: String,
    pub reason: String,
}

/// Skip when the host is not strictly older than the reference.
#[must_use]
pub const fn should_skip(host_major: u64, reference_major: u64) -> bool {
    host_major >= reference_major
}

/// Leading numeric component of a dotted version (`"550.54.15"` → 550).
#[must_use]
pub fn major_version(raw: &str) -> Option<u64> {
    LEADING_MAJOR
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn probe_version(
    probe: &VersionProbe,
    executor: &dyn RemoteExecutor,
    fixtures: &Fixtures,
    context: &str,
) -> Result<(String, u64)> {
    let command = fixtures.render(&probe.run)?;
    let result = executor.run(&command)?;
    if !result.succeeded {
        return Err(DipError::Runtime {
            details: format!(
                "{context} probe `{command}` failed (exit {}): {}",
                result.exit_code.unwrap_or(-1),
                result.stderr.trim()
            ),
        });
    }
    let parse_error = || DipError::VersionParse {
        context: format!("{context} probe `{command}`"),
        raw: result.stdout.clone(),
    };
    let version = probe.extract.apply(&result.stdout).ok_or_else(parse_error)?;
    let major = major_version(version).ok_or_else(parse_error)?;
    Ok((version.to_string(), major))
}

/// Run the condition's probes and decide.
///
/// Probe failures and unparsable versions are errors: a scenario must not be
/// silently skipped (or silently run) because a version could not be read.
pub fn evaluate(
    condition: &SkipCondition,
    executor: &dyn RemoteExecutor,
    fixtures: &Fixtures,
) -> Result<SkipDecision> {
    for step in &condition.prepare {
        let command = fixtures.render(step)?;
        let result = executor.run(&command)?;
        if !result.succeeded {
            return Err(DipError::Runtime {
                details: format!(
                    "skip preparation `{command}` failed (exit {}): {}",
                    result.exit_code.unwrap_or(-1),
                    result.stderr.trim()
                ),
            });
        }
    }
    let (reference_version, reference_major) =
        probe_version(&condition.reference, executor, fixtures, "reference")?;
    let (subject_version, subject_major) =
        probe_version(&condition.subject, executor, fixtures, "subject")?;
    Ok(SkipDecision {
        skip: should_skip(subject_major, reference_major),
        reason: format!(
            "{} (host {subject_version}, reference {reference_version})",
            condition.reason
        ),
        subject_version,
        reference_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::CommandResult;
    use crate::remote::scripted::ScriptedExecutor;
    use proptest::prelude::*;

    const DRIVER_PROBE: &str = "nvidia-smi -q | grep \"Driver Version\"";
    const COMPAT_PROBE: &str = "ls /usr/local/cuda/compat/libcuda.*.*";

    fn forward_compat() -> SkipCondition {
        SkipCondition {
            reason: "requires an older host driver".to_string(),
            prepare: vec!["docker pull cuda".to_string()],
            subject: VersionProbe::new(
                DRIVER_PROBE,
                VersionExtract::AfterSeparator {
                    separator: ":".to_string(),
                },
            ),
            reference: VersionProbe::new(
                COMPAT_PROBE,
                VersionExtract::FileNameSuffix {
                    prefix: "libcuda.so.".to_string(),
                },
            ),
        }
    }

    #[test]
    fn extracts_versions_from_probe_output() {
        let sep = VersionExtract::AfterSeparator {
            separator: ":".to_string(),
        };
        assert_eq!(
            sep.apply("Driver Version                            : 550.54.15\n"),
            Some("550.54.15")
        );
        assert_eq!(sep.apply("no separator"), None);

        let file = VersionExtract::FileNameSuffix {
            prefix: "libcuda.so.".to_string(),
        };
        assert_eq!(
            file.apply("/usr/local/cuda/compat/libcuda.so.575.51.03\n"),
            Some("575.51.03")
        );
        assert_eq!(VersionExtract::Trimmed.apply("  \n"), None);
    }

    #[test]
    fn major_version_is_numeric() {
        assert_eq!(major_version("550.54.15"), Some(550));
        assert_eq!(major_version("99"), Some(99));
        assert_eq!(major_version("v550"), None);
        // String comparison would put "99" after "550".
        assert!(!should_skip(major_version("99").unwrap(), 550));
    }

    #[test]
    fn older_host_runs_the_scenario() {
        let exec = ScriptedExecutor::new()
            .respond(DRIVER_PROBE, "Driver Version : 550.54.15\n")
            .respond(COMPAT_PROBE, "/usr/local/cuda/compat/libcuda.so.575.51.03\n");
        let decision = evaluate(&forward_compat(), &exec, &Fixtures::new()).unwrap();
        assert!(!decision.skip);
        assert_eq!(decision.subject_version, "550.54.15");
        assert_eq!(decision.reference_version, "575.51.03");
        assert_eq!(exec.issued()[0], "docker pull cuda");
    }

    #[test]
    fn equal_host_is_skipped_with_reason() {
        let exec = ScriptedExecutor::new()
            .respond(DRIVER_PROBE, "Driver Version : 575.57.08\n")
            .respond(COMPAT_PROBE, "/usr/local/cuda/compat/libcuda.so.575.51.03\n");
        let decision = evaluate(&forward_compat(), &exec, &Fixtures::new()).unwrap();
        assert!(decision.skip);
        assert!(decision.reason.contains("requires an older host driver"));
        assert!(decision.reason.contains("575.57.08"));
    }

    #[test]
    fn unparsable_version_is_an_error() {
        let exec = ScriptedExecutor::new()
            .respond(DRIVER_PROBE, "")
            .respond(COMPAT_PROBE, "/usr/local/cuda/compat/libcuda.so.575.51.03\n");
        let err = evaluate(&forward_compat(), &exec, &Fixtures::new()).unwrap_err();
        assert_eq!(err.code(), "DIP-2003");
    }

    #[test]
    fn failed_probe_is_an_error() {
        let exec = ScriptedExecutor::new()
            .reply(COMPAT_PROBE, CommandResult::failed(2, "No such file"));
        let err = evaluate(&forward_compat(), &exec, &Fixtures::new()).unwrap_err();
        assert!(err.to_string().contains("No such file"));
    }

    proptest! {
        #[test]
        fn skip_iff_host_not_older(host in 0u64..1000, reference in 0u64..1000) {
            prop_assert_eq!(should_skip(host, reference), host >= reference);
        }

        #[test]
        fn major_of_formatted_version_roundtrips(major in 0u64..10_000, minor in 0u32..100) {
            let raw = format!("{major}.{minor}.1");
            prop_assert_eq!(major_version(&raw), Some(major));
        }
    }
}
