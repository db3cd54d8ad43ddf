//! Scenario-scoped invariant guards evaluated after every variant.
//!
//! A guard is declared as a [`GuardSpec`], armed once per scenario after setup
//! (capturing whatever "before" state it needs) and then checked after each
//! variant. Guard commands go through the same executor as the variants.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::core::errors::{DipError, Result};
use crate::remote::{CommandResult, RemoteExecutor, Stream};
use crate::scenario::Variant;
use crate::scenario::fixtures::Fixtures;

/// Default mount-table snapshot command.
pub const MOUNT_SNAPSHOT_COMMAND: &str = "mount | sort";

/// Stderr fragment identifying a rejected path-traversal mount.
pub const PATH_ERROR_DIAGNOSTIC: &str = "mount error: path error:";

/// Declarative guard attached to a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardSpec {
    /// The sorted mount table must be unchanged after every variant.
    MountLeak {
        #[serde(default = "default_snapshot_command")]
        snapshot_command: String,
    },
    /// `directory` must stay empty; variants flagged `known_vulnerable` must
    /// additionally fail with `diagnostic` on stderr.
    PathContainment {
        directory: String,
        #[serde(default = "default_diagnostic")]
        diagnostic: String,
    },
    /// A probe must report exactly `expected`. Without a probe command the
    /// variant's own output is inspected.
    FlagValue {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        probe: Option<String>,
        expected: String,
        #[serde(default)]
        stream: Stream,
    },
}

fn default_snapshot_command() -> String {
    MOUNT_SNAPSHOT_COMMAND.to_string()
}

fn default_diagnostic() -> String {
    PATH_ERROR_DIAGNOSTIC.to_string()
}

impl GuardSpec {
    #[must_use]
    pub fn mount_leak() -> Self {
        Self::MountLeak {
            snapshot_command: default_snapshot_command(),
        }
    }

    #[must_use]
    pub fn path_containment(directory: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self::PathContainment {
            directory: directory.into(),
            diagnostic: diagnostic.into(),
        }
    }

    #[must_use]
    pub fn flag_value(expected: impl Into<String>) -> Self {
        Self::FlagValue {
            probe: None,
            expected: expected.into(),
            stream: Stream::Stdout,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MountLeak { .. } => "mount_leak",
            Self::PathContainment { .. } => "path_containment",
            Self::FlagValue { .. } => "flag_value",
        }
    }

    /// Resolve fixtures and capture any "before" state.
    ///
    /// Executor errors propagate unchanged so the caller can tell a transport
    /// failure from an unusable guard.
    pub fn arm(&self, executor: &dyn RemoteExecutor, fixtures: &Fixtures) -> Result<ArmedGuard> {
        match self {
            Self::MountLeak { snapshot_command } => {
                let command = fixtures.render(snapshot_command)?;
                let before = take_snapshot(executor, &command)?;
                if before.is_empty() {
                    return Err(DipError::Runtime {
                        details: format!("mount snapshot `{command}` returned no entries"),
                    });
                }
                Ok(ArmedGuard::MountLeak { command, before })
            }
            Self::PathContainment {
                directory,
                diagnostic,
            } => Ok(ArmedGuard::PathContainment {
                directory: fixtures.render(directory)?,
                diagnostic: diagnostic.clone(),
            }),
            Self::FlagValue {
                probe,
                expected,
                stream,
            } => Ok(ArmedGuard::FlagValue {
                probe: probe.as_deref().map(|p| fixtures.render(p)).transpose()?,
                expected: expected.clone(),
                stream: *stream,
            }),
        }
    }
}

/// A failed guard predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardViolation {
    pub guard: String,
    pub message: String,
}

/// Guard with its scenario-scoped state resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmedGuard {
    MountLeak {
        command: String,
        before: MountSnapshot,
    },
    PathContainment {
        directory: String,
        diagnostic: String,
    },
    FlagValue {
        probe: Option<String>,
        expected: String,
        stream: Stream,
    },
}

impl ArmedGuard {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MountLeak { .. } => "mount_leak",
            Self::PathContainment { .. } => "path_containment",
            Self::FlagValue { .. } => "flag_value",
        }
    }

    /// Check the invariant after `variant` produced `result`.
    ///
    /// `Ok(None)` means the invariant holds; `Err` means a guard command could
    /// not run at all.
    pub fn check(
        &self,
        executor: &dyn RemoteExecutor,
        variant: &Variant,
        result: &CommandResult,
    ) -> Result<Option<GuardViolation>> {
        let message = match self {
            Self::MountLeak { command, before } => {
                let after = take_snapshot(executor, command)?;
                let diff = before.diff(&after);
                if diff.is_clean() {
                    None
                } else {
                    Some(diff.describe())
                }
            }
            Self::PathContainment {
                directory,
                diagnostic,
            } => {
                let listing = executor.run(&format!("ls -A {directory}"))?;
                evaluate_containment(
                    variant.known_vulnerable,
                    result,
                    &listing,
                    directory,
                    diagnostic,
                )
            }
            Self::FlagValue {
                probe,
                expected,
                stream,
            } => {
                let probed;
                let observed = match probe {
                    Some(probe) => {
                        probed = executor.run(probe)?;
                        &probed
                    }
                    None => result,
                };
                let actual = observed.stream(*stream);
                if actual == expected {
                    None
                } else {
                    Some(format!("flag value mismatch: expected {expected:?}, got {actual:?}"))
                }
            }
        };
        Ok(message.map(|message| GuardViolation {
            guard: self.name().to_string(),
            message,
        }))
    }
}

fn take_snapshot(executor: &dyn RemoteExecutor, command: &str) -> Result<MountSnapshot> {
    let result = executor.run(command)?;
    if !result.succeeded {
        return Err(DipError::Runtime {
            details: format!(
                "mount snapshot `{command}` failed (exit {}): {}",
                result.exit_code.unwrap_or(-1),
                result.stderr.trim()
            ),
        });
    }
    Ok(MountSnapshot::from_output(&result.stdout))
}

/// Sorted mount-table lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSnapshot {
    lines: Vec<String>,
}

impl MountSnapshot {
    /// Parse raw `mount` output. Lines are sorted locally as well, so the
    /// comparison never depends on the remote `sort` locale.
    #[must_use]
    pub fn from_output(raw: &str) -> Self {
        let mut lines: Vec<String> = raw
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        lines.sort();
        Self { lines }
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Multiset difference between `self` (before) and `after`.
    #[must_use]
    pub fn diff(&self, after: &Self) -> MountDiff {
        let mut extra = Vec::new();
        let mut missing = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.lines.len() && j < after.lines.len() {
            match self.lines[i].cmp(&after.lines[j]) {
                std::cmp::Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
                std::cmp::Ordering::Less => {
                    missing.push(self.lines[i].clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    extra.push(after.lines[j].clone());
                    j += 1;
                }
            }
        }
        missing.extend(self.lines[i..].iter().cloned());
        extra.extend(after.lines[j..].iter().cloned());
        MountDiff { extra, missing }
    }
}

/// Lines that appeared (`extra`) or vanished (`missing`) between snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDiff {
    pub extra: Vec<String>,
    pub missing: Vec<String>,
}

impl MountDiff {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.extra.is_empty() && self.missing.is_empty()
    }

    #[must_use]
    pub fn describe(&self) -> String {
        use std::fmt::Write as _;

        let mut out = format!(
            "mount table changed: {} extra, {} missing",
            self.extra.len(),
            self.missing.len()
        );
        for line in &self.extra {
            let _ = write!(out, "\n  + {line}");
        }
        for line in &self.missing {
            let _ = write!(out, "\n  - {line}");
        }
        out
    }
}

/// Containment verdict for one operation.
///
/// Holds when the sandbox directory is empty afterwards and, for a mechanism
/// known to follow the escaping path, the operation failed with `diagnostic`
/// on stderr. Returns the violation message otherwise.
#[must_use]
pub fn evaluate_containment(
    known_vulnerable: bool,
    operation: &CommandResult,
    listing: &CommandResult,
    directory: &str,
    diagnostic: &str,
) -> Option<String> {
    let mut problems = Vec::new();
    if known_vulnerable {
        if operation.succeeded {
            problems.push(format!(
                "operation succeeded but was expected to fail with {diagnostic:?}"
            ));
        } else if !operation.stderr.contains(diagnostic) {
            problems.push(format!(
                "operation failed without the expected diagnostic {diagnostic:?}; stderr: {:?}",
                operation.stderr.trim()
            ));
        }
    }
    if !listing.succeeded {
        problems.push(format!(
            "could not list {directory}: {}",
            listing.stderr.trim()
        ));
    } else if !listing.stdout.trim().is_empty() {
        let entries: Vec<&str> = listing.stdout.split_whitespace().collect();
        problems.push(format!(
            "{directory} is not empty after the operation: {}",
            entries.join(", ")
        ));
    }
    if problems.is_empty() {
        None
    } else {
        Some(problems.join("; "))
    }
}
