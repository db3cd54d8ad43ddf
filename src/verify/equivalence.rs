//! Equivalence checker: baseline-vs-candidate comparison plus the per-variant
//! output checks built on it.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::remote::{CommandResult, Stream};

/// How a candidate is compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "literal", rename_all = "snake_case")]
pub enum CompareMode {
    /// Byte-for-byte equality of the selected stream.
    ExactMatch,
    /// The candidate's stream contains the literal.
    ContainsSubstring(String),
}

impl CompareMode {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ExactMatch => "exact_match",
            Self::ContainsSubstring(_) => "contains_substring",
        }
    }
}

/// Stream selection and normalization applied before comparing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompareOptions {
    pub stream: Stream,
    /// Drop one trailing `\n` from both sides before an exact match.
    pub trim_trailing_newline: bool,
}

/// Expected-vs-actual detail of a failed comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub mode: String,
    pub stream: Stream,
    pub expected: String,
    pub actual: String,
}

impl Mismatch {
    /// One-line rendering with both values quoted so whitespace differences
    /// stay visible.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{} on {}: expected {:?}, got {:?}",
            self.mode,
            self.stream.label(),
            self.expected,
            self.actual
        )
    }
}

/// Compare `candidate` against `baseline`.
pub fn compare(
    baseline: &CommandResult,
    candidate: &CommandResult,
    mode: &CompareMode,
    options: CompareOptions,
) -> Result<(), Mismatch> {
    let actual = candidate.stream(options.stream);
    match mode {
        CompareMode::ExactMatch => {
            let expected = baseline.stream(options.stream);
            let (lhs, rhs) = if options.trim_trailing_newline {
                (trim_one_newline(expected), trim_one_newline(actual))
            } else {
                (expected, actual)
            };
            if lhs == rhs {
                Ok(())
            } else {
                Err(Mismatch {
                    mode: mode.label().to_string(),
                    stream: options.stream,
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                })
            }
        }
        CompareMode::ContainsSubstring(literal) => {
            if actual.contains(literal.as_str()) {
                Ok(())
            } else {
                Err(Mismatch {
                    mode: mode.label().to_string(),
                    stream: options.stream,
                    expected: literal.clone(),
                    actual: actual.to_string(),
                })
            }
        }
    }
}

fn trim_one_newline(s: &str) -> &str {
    s.strip_suffix('\n').unwrap_or(s)
}

/// Output assertion attached to a variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    /// Exact match against the scenario baseline.
    MatchesBaseline {
        #[serde(default)]
        stream: Stream,
        #[serde(default)]
        trim_trailing_newline: bool,
    },
    /// Exact match against a literal.
    Equals {
        literal: String,
        #[serde(default)]
        stream: Stream,
        #[serde(default)]
        trim_trailing_newline: bool,
    },
    Contains {
        literal: String,
        #[serde(default)]
        stream: Stream,
    },
    Empty {
        #[serde(default)]
        stream: Stream,
    },
    NotEmpty {
        #[serde(default)]
        stream: Stream,
    },
    /// Split every line at `separator`, trim the head, and require each entry
    /// to appear among the heads.
    ContainsEntries {
        entries: Vec<String>,
        #[serde(default = "default_entry_separator")]
        separator: String,
        #[serde(default)]
        stream: Stream,
    },
}

fn default_entry_separator() -> String {
    " (".to_string()
}

impl Check {
    #[must_use]
    pub const fn matches_baseline() -> Self {
        Self::MatchesBaseline {
            stream: Stream::Stdout,
            trim_trailing_newline: false,
        }
    }

    #[must_use]
    pub fn equals(literal: impl Into<String>) -> Self {
        Self::Equals {
            literal: literal.into(),
            stream: Stream::Stdout,
            trim_trailing_newline: false,
        }
    }

    #[must_use]
    pub fn contains(literal: impl Into<String>) -> Self {
        Self::Contains {
            literal: literal.into(),
            stream: Stream::Stdout,
        }
    }

    #[must_use]
    pub fn stderr_contains(literal: impl Into<String>) -> Self {
        Self::Contains {
            literal: literal.into(),
            stream: Stream::Stderr,
        }
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self::Empty {
            stream: Stream::Stdout,
        }
    }

    #[must_use]
    pub const fn not_empty() -> Self {
        Self::NotEmpty {
            stream: Stream::Stdout,
        }
    }

    #[must_use]
    pub fn contains_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ContainsEntries {
            entries: entries.into_iter().map(Into::into).collect(),
            separator: default_entry_separator(),
            stream: Stream::Stdout,
        }
    }
}

/// Result of evaluating one [`Check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Pass,
    Mismatch(Mismatch),
    /// The check needs a baseline but none was captured.
    NoBaseline,
}

/// Evaluate `check` for `candidate`, using `baseline` where the check needs one.
#[must_use]
pub fn evaluate(
    check: &Check,
    baseline: Option<&CommandResult>,
    candidate: &CommandResult,
) -> CheckOutcome {
    let verdict = match check {
        Check::MatchesBaseline {
            stream,
            trim_trailing_newline,
        } => {
            let Some(baseline) = baseline else {
                return CheckOutcome::NoBaseline;
            };
            compare(
                baseline,
                candidate,
                &CompareMode::ExactMatch,
                CompareOptions {
                    stream: *stream,
                    trim_trailing_newline: *trim_trailing_newline,
                },
            )
        }
        Check::Equals {
            literal,
            stream,
            trim_trailing_newline,
        } => {
            let expected = literal_result(literal, *stream);
            compare(
                &expected,
                candidate,
                &CompareMode::ExactMatch,
                CompareOptions {
                    stream: *stream,
                    trim_trailing_newline: *trim_trailing_newline,
                },
            )
        }
        Check::Contains { literal, stream } => compare(
            candidate,
            candidate,
            &CompareMode::ContainsSubstring(literal.clone()),
            CompareOptions {
                stream: *stream,
                trim_trailing_newline: false,
            },
        ),
        Check::Empty { stream } => {
            let actual = candidate.stream(*stream);
            if actual.trim().is_empty() {
                Ok(())
            } else {
                Err(Mismatch {
                    mode: "empty".to_string(),
                    stream: *stream,
                    expected: String::new(),
                    actual: actual.to_string(),
                })
            }
        }
        Check::NotEmpty { stream } => {
            let actual = candidate.stream(*stream);
            if actual.trim().is_empty() {
                Err(Mismatch {
                    mode: "not_empty".to_string(),
                    stream: *stream,
                    expected: "<any output>".to_string(),
                    actual: actual.to_string(),
                })
            } else {
                Ok(())
            }
        }
        Check::ContainsEntries {
            entries,
            separator,
            stream,
        } => {
            let actual = candidate.stream(*stream);
            let heads = entry_heads(actual, separator);
            let missing: Vec<&String> = entries
                .iter()
                .filter(|entry| !heads.iter().any(|head| head == *entry))
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(Mismatch {
                    mode: "contains_entries".to_string(),
                    stream: *stream,
                    expected: entries.join(", "),
                    actual: heads.join(", "),
                })
            }
        }
    };
    match verdict {
        Ok(()) => CheckOutcome::Pass,
        Err(mismatch) => CheckOutcome::Mismatch(mismatch),
    }
}

/// Leading field of each non-empty line, e.g. `libcuda.so.1` from
/// `libcuda.so.1 (libc6,x86-64) => /usr/lib/...`.
#[must_use]
pub fn entry_heads(output: &str, separator: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.split_once(separator)
                .map_or(line, |(head, _)| head)
                .trim()
                .to_string()
        })
        .collect()
}

fn literal_result(literal: &str, stream: Stream) -> CommandResult {
    match stream {
        Stream::Stdout => CommandResult::ok(literal),
        Stream::Stderr => CommandResult::failed(1, literal),
    }
}
