//! SSH transport backed by the system `ssh` binary.
//!
//! Output pipes are drained on helper threads while the child is polled, so a
//! chatty remote command can never deadlock on a full pipe and a hung one can
//! be killed at the per-command timeout.

#![allow(missing_docs)]

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::errors::{DipError, Result};
use crate::remote::{CommandResult, RemoteExecutor, RemoteTarget};

/// Exit status ssh reserves for its own failures (connect, auth, protocol).
///
/// A remote command that itself exits 255 cannot be told apart from these and
/// is reported as a transport failure, so catalogs should not rely on that
/// status as an expected failure.
pub const SSH_TRANSPORT_EXIT: i32 = 255;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Knobs for how the ssh client is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    pub binary: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Disable interactive prompts (passwords, host-key confirmation).
    pub batch_mode: bool,
    /// Extra `-o` options, passed through verbatim.
    pub extra_options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(900),
            batch_mode: true,
            extra_options: Vec::new(),
        }
    }
}

/// Executor that runs every command in a fresh ssh session.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    target: RemoteTarget,
    options: SshOptions,
}

impl SshExecutor {
    #[must_use]
    pub fn new(target: RemoteTarget, options: SshOptions) -> Self {
        Self { target, options }
    }

    #[must_use]
    pub fn options(&self) -> &SshOptions {
        &self.options
    }

    /// Full argument vector for one remote command (binary excluded).
    #[must_use]
    pub fn build_args(&self, command: &str) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.target.port.to_string()];
        if let Some(key) = &self.target.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        if self.options.batch_mode {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        args.push("-o".to_string());
        args.push(format!(
            "ConnectTimeout={}",
            self.options.connect_timeout.as_secs().max(1)
        ));
        for option in &self.options.extra_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(self.target.destination());
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }

    fn transport_error(&self, details: impl Into<String>) -> DipError {
        DipError::Transport {
            target: self.target.to_string(),
            details: details.into(),
        }
    }
}

impl RemoteExecutor for SshExecutor {
    fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn run(&self, command: &str) -> Result<CommandResult> {
        let start = Instant::now();
        let mut child = Command::new(&self.options.binary)
            .args(self.build_args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                self.transport_error(format!(
                    "failed to launch {}: {source}",
                    self.options.binary
                ))
            })?;

        let stdout_handle = child
            .stdout
            .take()
            .map(|mut stdout| thread::spawn(move || read_to_string(&mut stdout)));
        let stderr_handle = child
            .stderr
            .take()
            .map(|mut stderr| thread::spawn(move || read_to_string(&mut stderr)));

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(source) => {
                    let _ = child.kill();
                    return Err(self.transport_error(format!("wait failed: {source}")));
                }
            }
            if start.elapsed() >= self.options.command_timeout {
                // Reader threads are left to finish on their own; a grandchild
                // may still hold the pipes open.
                let _ = child.kill();
                let _ = child.wait();
                return Err(DipError::Timeout {
                    target: self.target.to_string(),
                    timeout: self.options.command_timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = join_output(stdout_handle);
        let stderr = join_output(stderr_handle);
        classify(&self.target, status, stdout, stderr, start.elapsed())
    }
}

fn classify(
    target: &RemoteTarget,
    status: ExitStatus,
    stdout: String,
    stderr: String,
    elapsed: Duration,
) -> Result<CommandResult> {
    let exit_code = status.code();
    if exit_code == Some(SSH_TRANSPORT_EXIT) {
        return Err(DipError::Transport {
            target: target.to_string(),
            details: if stderr.trim().is_empty() {
                format!("ssh exited with status {SSH_TRANSPORT_EXIT}")
            } else {
                stderr.trim().to_string()
            },
        });
    }
    Ok(CommandResult {
        stdout,
        stderr,
        succeeded: status.success(),
        exit_code,
        duration_ms: 0,
    }
    .with_duration(elapsed))
}

fn read_to_string<R: Read>(reader: &mut R) -> String {
    let mut buffer = Vec::new();
    if reader.read_to_end(&mut buffer).is_ok() {
        String::from_utf8_lossy(&buffer).to_string()
    } else {
        String::new()
    }
}

fn join_output(handle: Option<thread::JoinHandle<String>>) -> String {
    handle.map_or_else(String::new, |handle| handle.join().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> SshExecutor {
        SshExecutor::new(
            RemoteTarget::new("gpu-host", 2222, "ubuntu").with_identity_file("/keys/id_ed25519"),
            SshOptions::default(),
        )
    }

    #[test]
    fn args_place_command_after_separator() {
        let args = executor().build_args("nvidia-smi -L");
        let sep = args.iter().position(|a| a == "--").expect("separator");
        assert_eq!(args[sep - 1], "ubuntu@gpu-host");
        assert_eq!(args[sep + 1], "nvidia-smi -L");
        assert_eq!(args.len(), sep + 2);
    }

    #[test]
    fn args_carry_port_key_and_batch_mode() {
        let args = executor().build_args("true");
        assert_eq!(&args[..2], ["-p", "2222"]);
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id_ed25519"]));
        assert!(args.windows(2).any(|w| w == ["-o", "BatchMode=yes"]));
        assert!(args.windows(2).any(|w| w == ["-o", "ConnectTimeout=10"]));
    }

    #[test]
    fn extra_options_are_passed_through() {
        let exec = SshExecutor::new(
            RemoteTarget::new("h", 22, "u"),
            SshOptions {
                batch_mode: false,
                extra_options: vec!["StrictHostKeyChecking=no".to_string()],
                ..SshOptions::default()
            },
        );
        let args = exec.build_args("true");
        assert!(!args.iter().any(|a| a == "BatchMode=yes"));
        assert!(
            args.windows(2)
                .any(|w| w == ["-o", "StrictHostKeyChecking=no"])
        );
    }

    #[test]
    fn missing_binary_is_a_transport_failure() {
        let exec = SshExecutor::new(
            RemoteTarget::new("h", 22, "u"),
            SshOptions {
                binary: "/nonexistent/dip-test-ssh".to_string(),
                ..SshOptions::default()
            },
        );
        let err = exec.run("true").expect_err("spawn should fail");
        assert!(err.is_transport(), "{err}");
    }

    #[cfg(unix)]
    fn fake_ssh(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ssh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[test]
    fn local_shell_stands_in_for_ssh() {
        // The fake client runs its last argument locally, which exercises the
        // capture and exit-code plumbing without a remote host.
        let dir = tempfile::tempdir().unwrap();
        let exec = SshExecutor::new(
            RemoteTarget::new("h", 22, "u"),
            SshOptions {
                binary: fake_ssh(dir.path(), "for last; do :; done\nexec sh -c \"$last\""),
                ..SshOptions::default()
            },
        );

        let ok = exec.run("printf 'GPU 0\\n'").unwrap();
        assert!(ok.succeeded);
        assert_eq!(ok.stdout, "GPU 0\n");

        let failed = exec.run("echo oops >&2; exit 3").unwrap();
        assert!(!failed.succeeded);
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(failed.stderr, "oops\n");

        let transport = exec.run("exit 255").expect_err("255 is the transport code");
        assert!(transport.is_transport());
    }

    #[cfg(unix)]
    #[test]
    fn remote_exit_255_is_reported_as_transport() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SshExecutor::new(
            RemoteTarget::new("h", 22, "u"),
            SshOptions {
                binary: fake_ssh(dir.path(), "for last; do :; done\nexec sh -c \"$last\""),
                ..SshOptions::default()
            },
        );
        let err = exec
            .run("echo 'tool crashed' >&2; exit 255")
            .expect_err("indistinguishable from an ssh failure");
        assert!(err.is_transport());
        assert!(err.to_string().contains("tool crashed"));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SshExecutor::new(
            RemoteTarget::new("h", 22, "u"),
            SshOptions {
                binary: fake_ssh(dir.path(), "exec sleep 5"),
                command_timeout: Duration::from_millis(200),
                ..SshOptions::default()
            },
        );

        let started = Instant::now();
        let err = exec.run("true").expect_err("should time out");
        assert!(matches!(err, DipError::Timeout { .. }), "{err}");
        assert!(err.is_transport());
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
