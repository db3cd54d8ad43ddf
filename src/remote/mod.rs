//! Remote execution seam: a target host, captured command results, and the
//! executor trait every other component runs commands through.

pub mod scripted;
pub mod ssh;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::Result;

/// Where commands execute. Built once per run and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key handed to the transport; `None` defers to the agent.
    pub identity_file: Option<PathBuf>,
}

impl RemoteTarget {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            identity_file: None,
        }
    }

    #[must_use]
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// `user@host`, the destination form ssh expects.
    #[must_use]
    pub fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.destination(), self.port)
    }
}

/// Output stream selector used by checks and guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    #[default]
    Stdout,
    Stderr,
}

impl Stream {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Captured outcome of one remote command that actually ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub succeeded: bool,
    /// Remote exit status; `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl CommandResult {
    /// Successful result with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            succeeded: true,
            exit_code: Some(0),
            duration_ms: 0,
        }
    }

    /// Failed result with the given exit code and stderr.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            succeeded: false,
            exit_code: Some(exit_code),
            duration_ms: 0,
        }
    }

    #[must_use]
    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn stream(&self, stream: Stream) -> &str {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }
}

/// Runs opaque shell strings on a remote host.
///
/// `run` blocks until the remote command terminates. `Ok` means the command
/// ran, whatever its exit status; `Err` is reserved for the transport failing
/// to run it at all (see [`crate::core::errors::DipError::is_transport`]).
pub trait RemoteExecutor {
    fn target(&self) -> &RemoteTarget;
    fn run(&self, command: &str) -> Result<CommandResult>;
}

impl<T: RemoteExecutor + ?Sized> RemoteExecutor for &T {
    fn target(&self) -> &RemoteTarget {
        (**self).target()
    }

    fn run(&self, command: &str) -> Result<CommandResult> {
        (**self).run(command)
    }
}
