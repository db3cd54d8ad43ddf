#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

/// Variables the harness reads; scrubbed so the developer's shell never leaks in.
const DIP_ENV: &[&str] = &[
    "DIP_SSH_HOST",
    "DIP_SSH_PORT",
    "DIP_SSH_USER",
    "DIP_SSH_KEY",
    "DIP_SSH_BINARY",
    "DIP_COMMAND_TIMEOUT_SECS",
    "DIP_INSTALL_CTK",
    "DIP_TOOLKIT_IMAGE",
    "DIP_TOOLKIT_IMAGE_TAG",
    "DIP_INSTALL_TEMPLATE",
    "DIP_CATALOG",
    "DIP_EXCLUDE_LABELS",
    "DIP_OUTPUT_FORMAT",
];

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(self.stdout.trim()).unwrap_or_else(|e| {
            panic!(
                "stdout is not a JSON document ({e}); log: {}",
                self.log_path.display()
            )
        })
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_dip") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "dip.exe" } else { "dip" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve dip binary path for integration test"),
    }
}

/// Run the CLI with a throwaway `HOME` so default config and log paths stay isolated.
pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let home = tempfile::tempdir().expect("create temp home");
    run_cli_case_with(case_name, home.path(), args, &[])
}

/// Run the CLI with an explicit `HOME` and extra environment.
pub fn run_cli_case_with(
    case_name: &str,
    home: &Path,
    args: &[&str],
    envs: &[(&str, &str)],
) -> CmdResult {
    let root = std::env::temp_dir().join("dip-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command
        .args(args)
        .env("HOME", home)
        .env("RUST_BACKTRACE", "1")
        .env("NO_COLOR", "1");
    for name in DIP_ENV {
        command.env_remove(name);
    }
    for (name, value) in envs {
        command.env(name, value);
    }
    let output = command.output().expect("execute dip command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("home={}\n", home.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("envs={envs:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Executable stand-in for `ssh` whose body sees the ssh argument vector.
#[cfg(unix)]
pub fn fake_ssh(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-ssh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake ssh");
    let mut perms = fs::metadata(&path).expect("stat fake ssh").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod fake ssh");
    path
}

/// Fake `ssh` that runs the remote command on the local shell.
#[cfg(unix)]
pub fn local_ssh(dir: &Path) -> PathBuf {
    fake_ssh(dir, "for last; do :; done\nexec sh -c \"$last\"")
}

/// Write a config file pointing the executor at `ssh_binary`.
pub fn write_config(dir: &Path, ssh_binary: &Path, extra: &str) -> PathBuf {
    let path = dir.join("config.toml");
    let body = format!(
        "[target]\nhost = \"gpu-under-test\"\nuser = \"ci\"\n\n[executor]\nssh_binary = \"{}\"\nconnect_timeout_secs = 5\ncommand_timeout_secs = 30\n\n{extra}\n",
        ssh_binary.display()
    );
    fs::write(&path, body).expect("write config");
    path
}
