//! CLI smoke tests: parsing, output modes, configuration and catalog listing.

mod common;

use std::fs;

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: dip [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn version_command_prints_version() {
    let result = common::run_cli_case("version_command_prints_version", &["--version"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(
        result
            .stdout
            .contains(&format!("dip {}", env!("CARGO_PKG_VERSION"))),
        "log: {}",
        result.log_path.display()
    );
}

#[test]
fn version_subcommand_emits_json_when_piped() {
    let result = common::run_cli_case("version_subcommand_json", &["version", "--verbose"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = result.json();
    assert_eq!(payload["binary"], "dip");
    assert_eq!(payload["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn list_reports_builtin_catalog() {
    let result = common::run_cli_case("list_reports_builtin_catalog", &["list", "--json"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = result.json();
    let scenarios = payload["scenarios"].as_array().expect("scenario array");
    assert_eq!(scenarios.len(), 8);

    let listing = scenarios
        .iter()
        .find(|s| s["name"] == "device-listing")
        .expect("device-listing present");
    assert_eq!(listing["variants"].as_array().map(Vec::len), Some(5));

    let firmware = scenarios
        .iter()
        .find(|s| s["name"] == "firmware-path-containment")
        .expect("firmware scenario present");
    let hook = firmware["variants"]
        .as_array()
        .and_then(|v| v.iter().find(|variant| variant["name"] == "hook"))
        .expect("hook variant");
    assert_eq!(hook["labels"][0], "legacy");

    let compat = scenarios
        .iter()
        .find(|s| s["name"] == "cuda-forward-compat")
        .expect("compat scenario present");
    assert_eq!(compat["conditional"], true);
    assert_eq!(compat["ordered"], true);
}

#[test]
fn list_human_output_names_scenarios() {
    let home = tempfile::tempdir().unwrap();
    let result = common::run_cli_case_with(
        "list_human_output",
        home.path(),
        &["list"],
        &[("DIP_OUTPUT_FORMAT", "human")],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(result.stdout.contains("device-listing"));
    assert!(result.stdout.contains("shared-mount-propagation (guarded)"));
    assert!(result.stdout.contains("[legacy]"));
}

#[test]
fn config_path_defaults_under_home() {
    let home = tempfile::tempdir().unwrap();
    let result =
        common::run_cli_case_with("config_path_defaults", home.path(), &["config", "path"], &[]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = result.json();
    let expected = home.path().join(".config/dip/config.toml");
    assert_eq!(payload["path"], expected.to_string_lossy().to_string());
    assert_eq!(payload["exists"], false);
}

#[test]
fn config_validate_accepts_defaults() {
    let result = common::run_cli_case("config_validate_defaults", &["config", "validate"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = result.json();
    assert_eq!(payload["valid"], true);
    assert_eq!(payload["target"], "localhost:22");
    assert_eq!(payload["hash"].as_str().map(str::len), Some(16));
}

#[test]
fn config_validate_rejects_bad_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "[target]\nport = 0\n").unwrap();
    let path = path.to_string_lossy().to_string();

    let result = common::run_cli_case(
        "config_validate_rejects_bad_file",
        &["--config", &path, "config", "validate"],
    );
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
    let payload = result.json();
    assert_eq!(payload["valid"], false);
    assert_eq!(payload["code"], "DIP-1001");
}

#[test]
fn config_validate_rejects_bad_env() {
    let home = tempfile::tempdir().unwrap();
    let result = common::run_cli_case_with(
        "config_validate_rejects_bad_env",
        home.path(),
        &["config", "validate"],
        &[("DIP_SSH_PORT", "not-a-port")],
    );
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
    assert_eq!(result.json()["code"], "DIP-1003");
}

#[test]
fn explicit_missing_config_is_user_error() {
    let result = common::run_cli_case(
        "explicit_missing_config",
        &["--config", "/nonexistent/dip.toml", "config", "show"],
    );
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("DIP-1002"));
}

#[test]
fn config_show_reflects_env_overrides() {
    let home = tempfile::tempdir().unwrap();
    let result = common::run_cli_case_with(
        "config_show_env",
        home.path(),
        &["config", "show"],
        &[
            ("DIP_SSH_HOST", "gpu-runner-3"),
            ("DIP_EXCLUDE_LABELS", "legacy"),
        ],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = result.json();
    assert_eq!(payload["config"]["target"]["host"], "gpu-runner-3");
    assert_eq!(payload["config"]["run"]["exclude_labels"][0], "legacy");
}

#[test]
fn completions_generate_for_bash() {
    let result = common::run_cli_case("completions_bash", &["completions", "bash"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(result.stdout.contains("_dip"));
}

#[test]
fn unknown_scenario_is_rejected_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ssh-was-called");
    let ssh = dir.path().join("no-ssh");
    fs::write(
        &ssh,
        format!("#!/bin/sh\ntouch {}\nexit 255\n", marker.display()),
    )
    .unwrap();
    let config = common::write_config(dir.path(), &ssh, "");
    let config = config.to_string_lossy().to_string();

    let result = common::run_cli_case(
        "unknown_scenario",
        &["--config", &config, "run", "--scenario", "no-such-scenario"],
    );
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("no-such-scenario"));
    assert!(!marker.exists());
}

#[test]
fn missing_catalog_file_is_user_error() {
    let result = common::run_cli_case(
        "missing_catalog",
        &["list", "--catalog", "/nonexistent/catalog.toml"],
    );
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("DIP-3003"));
}

#[test]
fn malformed_catalog_is_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.toml");
    fs::write(&path, "[[scenario]]\nname = \"empty\"\n").unwrap();
    let path = path.to_string_lossy().to_string();

    let result = common::run_cli_case("malformed_catalog", &["list", "--catalog", &path]);
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("DIP-2001"));
}
