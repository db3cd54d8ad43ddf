//! DIP-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, DipError>;

/// Top-level error type for the parity harness.
#[derive(Debug, Error)]
pub enum DipError {
    #[error("[DIP-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[DIP-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[DIP-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[DIP-2001] scenario catalog parse failure in {source_name}: {details}")]
    CatalogParse {
        source_name: String,
        details: String,
    },

    #[error("[DIP-2002] unknown installer template: {name}")]
    UnknownTemplate { name: String },

    #[error("[DIP-2003] cannot extract a version from {context}: {raw:?}")]
    VersionParse { context: String, raw: String },

    #[error("[DIP-2004] unresolved fixture placeholder {{{{{name}}}}} in command: {command}")]
    UnresolvedFixture { name: String, command: String },

    #[error("[DIP-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[DIP-3001] transport failure reaching {target}: {details}")]
    Transport { target: String, details: String },

    #[error("[DIP-3002] command timed out after {timeout:?} on {target}")]
    Timeout { target: String, timeout: Duration },

    #[error("[DIP-3003] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[DIP-3004] toolkit installation failed: {details}")]
    Install { details: String },

    #[error("[DIP-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl DipError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "DIP-1001",
            Self::MissingConfig { .. } => "DIP-1002",
            Self::ConfigParse { .. } => "DIP-1003",
            Self::CatalogParse { .. } => "DIP-2001",
            Self::UnknownTemplate { .. } => "DIP-2002",
            Self::VersionParse { .. } => "DIP-2003",
            Self::UnresolvedFixture { .. } => "DIP-2004",
            Self::Serialization { .. } => "DIP-2101",
            Self::Transport { .. } => "DIP-3001",
            Self::Timeout { .. } => "DIP-3002",
            Self::Io { .. } => "DIP-3003",
            Self::Install { .. } => "DIP-3004",
            Self::Runtime { .. } => "DIP-3900",
        }
    }

    /// Whether the executor could not run the command at all.
    ///
    /// Transport-class errors abort the enclosing scenario group; a remote
    /// command that ran and exited non-zero is never reported this way.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for DipError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for DipError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
