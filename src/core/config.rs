//! Configuration system: TOML file + env var overrides + defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{DipError, Result};
use crate::installer::{InstallTemplate, InstallerOptions};
use crate::remote::RemoteTarget;
use crate::remote::ssh::SshOptions;

/// Full harness configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub target: TargetConfig,
    pub executor: ExecutorConfig,
    pub installer: InstallerConfig,
    pub run: RunConfig,
    pub paths: PathsConfig,
}

/// Remote host the scenarios run on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    /// Empty defers to the ssh client's default user.
    pub user: String,
    pub identity_file: Option<PathBuf>,
}

/// How the ssh client is invoked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub ssh_binary: String,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub extra_options: Vec<String>,
    pub batch_mode: bool,
}

/// Toolkit installation before the first scenario.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstallerConfig {
    pub enabled: bool,
    pub image: String,
    pub tag: String,
    pub template: String,
}

/// Scenario selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RunConfig {
    /// TOML catalog replacing the built-in one.
    pub catalog_file: Option<PathBuf>,
    /// When non-empty, only these scenarios run.
    pub scenarios: Vec<String>,
    pub exclude_labels: Vec<String>,
}

/// Filesystem paths used by dip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub jsonl_log: PathBuf,
    /// When set, every run also writes its JSON report here.
    pub report_dir: Option<PathBuf>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            user: String::new(),
            identity_file: None,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let ssh = SshOptions::default();
        Self {
            ssh_binary: ssh.binary,
            connect_timeout_secs: ssh.connect_timeout.as_secs(),
            command_timeout_secs: ssh.command_timeout.as_secs(),
            extra_options: ssh.extra_options,
            batch_mode: ssh.batch_mode,
        }
    }
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: String::new(),
            tag: String::new(),
            template: InstallTemplate::default().name().to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[DIP-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("dip").join("config.toml");
        let data = home_dir.join(".local").join("share").join("dip");
        Self {
            config_file: cfg,
            jsonl_log: data.join("runs.jsonl"),
            report_dir: None,
        }
    }
}

impl InstallerConfig {
    /// `image:tag`, or the bare image when no tag is set.
    #[must_use]
    pub fn image_ref(&self) -> String {
        if self.tag.is_empty() {
            self.image.clone()
        } else {
            format!("{}:{}", self.image, self.tag)
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| DipError::io(&path_buf, source))?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(DipError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging and reports.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    #[must_use]
    pub fn remote_target(&self) -> RemoteTarget {
        let target = RemoteTarget::new(&self.target.host, self.target.port, &self.target.user);
        match &self.target.identity_file {
            Some(key) => target.with_identity_file(key),
            None => target,
        }
    }

    #[must_use]
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            binary: self.executor.ssh_binary.clone(),
            connect_timeout: Duration::from_secs(self.executor.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.executor.command_timeout_secs),
            batch_mode: self.executor.batch_mode,
            extra_options: self.executor.extra_options.clone(),
        }
    }

    #[must_use]
    pub fn installer_options(&self) -> InstallerOptions {
        InstallerOptions {
            image: self.installer.image_ref(),
            template: self.installer.template.clone(),
        }
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("DIP_SSH_HOST") {
            self.target.host = raw;
        }
        if let Some(raw) = lookup("DIP_SSH_PORT") {
            self.target.port = raw.parse::<u16>().map_err(|error| DipError::ConfigParse {
                context: "env",
                details: format!("DIP_SSH_PORT={raw:?}: {error}"),
            })?;
        }
        if let Some(raw) = lookup("DIP_SSH_USER") {
            self.target.user = raw;
        }
        if let Some(raw) = lookup("DIP_SSH_KEY") {
            self.target.identity_file = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup("DIP_SSH_BINARY") {
            self.executor.ssh_binary = raw;
        }
        if let Some(raw) = lookup("DIP_COMMAND_TIMEOUT_SECS") {
            self.executor.command_timeout_secs = parse_env_u64("DIP_COMMAND_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("DIP_INSTALL_CTK") {
            self.installer.enabled = parse_env_bool("DIP_INSTALL_CTK", &raw)?;
        }
        if let Some(raw) = lookup("DIP_TOOLKIT_IMAGE") {
            self.installer.image = raw;
        }
        if let Some(raw) = lookup("DIP_TOOLKIT_IMAGE_TAG") {
            self.installer.tag = raw;
        }
        if let Some(raw) = lookup("DIP_INSTALL_TEMPLATE") {
            self.installer.template = raw;
        }
        if let Some(raw) = lookup("DIP_CATALOG") {
            self.run.catalog_file = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup("DIP_EXCLUDE_LABELS") {
            self.run.exclude_labels = raw
                .split(',')
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    /// Trim free-form strings so whitespace in env vars or TOML never reaches ssh.
    fn normalize(&mut self) {
        self.target.host = self.target.host.trim().to_string();
        self.target.user = self.target.user.trim().to_string();
        self.installer.image = self.installer.image.trim().to_string();
        self.installer.tag = self.installer.tag.trim().to_string();
        self.run.exclude_labels.retain(|label| !label.trim().is_empty());
        self.run.scenarios.retain(|name| !name.trim().is_empty());
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.host.trim().is_empty() {
            return Err(DipError::InvalidConfig {
                details: "target.host must not be empty".to_string(),
            });
        }
        if self.target.port == 0 {
            return Err(DipError::InvalidConfig {
                details: "target.port must be in 1..=65535".to_string(),
            });
        }
        if self.executor.ssh_binary.trim().is_empty() {
            return Err(DipError::InvalidConfig {
                details: "executor.ssh_binary must not be empty".to_string(),
            });
        }
        if self.executor.connect_timeout_secs == 0 || self.executor.command_timeout_secs == 0 {
            return Err(DipError::InvalidConfig {
                details: "executor timeouts must be greater than zero".to_string(),
            });
        }
        if self.executor.connect_timeout_secs > self.executor.command_timeout_secs {
            return Err(DipError::InvalidConfig {
                details: format!(
                    "executor.connect_timeout_secs ({}) must not exceed command_timeout_secs ({})",
                    self.executor.connect_timeout_secs, self.executor.command_timeout_secs
                ),
            });
        }
        let template: InstallTemplate = self.installer.template.parse()?;
        if self.installer.enabled && template != InstallTemplate::None && self.installer.image.is_empty() {
            return Err(DipError::InvalidConfig {
                details: "installer.image is required when installer.enabled = true".to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|error| DipError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    raw.trim().parse::<bool>().map_err(|error| DipError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

#[cfg(test)]
mod tests {
    use super::{Config, DipError};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.remote_target().to_string(), "localhost:22");
    }

    #[test]
    fn empty_host_rejected() {
        let mut cfg = Config::default();
        cfg.target.host = "  ".to_string();
        let err = cfg.validate().expect_err("expected invalid host");
        match err {
            DipError::InvalidConfig { details } => assert!(details.contains("target.host")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_port_rejected() {
        let mut cfg = Config::default();
        cfg.target.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn timeouts_must_be_ordered_and_positive() {
        let mut cfg = Config::default();
        cfg.executor.command_timeout_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.executor.connect_timeout_secs = 60;
        cfg.executor.command_timeout_secs = 30;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn enabled_installer_requires_image() {
        let mut cfg = Config::default();
        cfg.installer.enabled = true;
        assert!(cfg.validate().is_err());
        cfg.installer.image = "ghcr.io/nvidia/container-toolkit".to_string();
        assert!(cfg.validate().is_ok());
        cfg.installer.template = "podman".to_string();
        assert_eq!(cfg.validate().unwrap_err().code(), "DIP-2002");
    }

    #[test]
    fn image_ref_joins_tag() {
        let mut cfg = Config::default();
        cfg.installer.image = "ghcr.io/nvidia/container-toolkit".to_string();
        assert_eq!(cfg.installer_options().image, "ghcr.io/nvidia/container-toolkit");
        cfg.installer.tag = "v1.18.0-ubuntu20.04".to_string();
        assert_eq!(
            cfg.installer_options().image,
            "ghcr.io/nvidia/container-toolkit:v1.18.0-ubuntu20.04"
        );
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        let overrides = vars(&[
            ("DIP_SSH_HOST", "gpu-runner-7"),
            ("DIP_SSH_PORT", "2222"),
            ("DIP_SSH_USER", "ubuntu"),
            ("DIP_SSH_KEY", "/home/ci/.ssh/id_ed25519"),
            ("DIP_INSTALL_CTK", "true"),
            ("DIP_TOOLKIT_IMAGE", "ghcr.io/nvidia/container-toolkit"),
            ("DIP_TOOLKIT_IMAGE_TAG", "v1.18.0"),
            ("DIP_EXCLUDE_LABELS", "legacy, ,slow"),
            ("DIP_COMMAND_TIMEOUT_SECS", "120"),
        ]);
        cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect("env overrides should parse");

        assert_eq!(cfg.target.host, "gpu-runner-7");
        assert_eq!(cfg.target.port, 2222);
        assert_eq!(
            cfg.remote_target().identity_file,
            Some(PathBuf::from("/home/ci/.ssh/id_ed25519"))
        );
        assert!(cfg.installer.enabled);
        assert_eq!(cfg.run.exclude_labels, ["legacy", "slow"]);
        assert_eq!(cfg.ssh_options().command_timeout.as_secs(), 120);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_invalid_values_rejected() {
        let mut cfg = Config::default();
        let overrides = vars(&[("DIP_SSH_PORT", "70000")]);
        let err = cfg
            .apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect_err("port out of range should fail");
        match err {
            DipError::ConfigParse { context, details } => {
                assert_eq!(context, "env");
                assert!(details.contains("DIP_SSH_PORT"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let overrides = vars(&[("DIP_INSTALL_CTK", "yes-please")]);
        assert!(
            cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
                .is_err()
        );
    }

    #[test]
    fn toml_sections_parse_with_defaults() {
        let raw = r#"
[target]
host = "10.0.0.5"
user = "ubuntu"

[executor]
extra_options = ["StrictHostKeyChecking=no"]

[run]
exclude_labels = ["legacy"]
"#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert_eq!(cfg.target.host, "10.0.0.5");
        assert_eq!(cfg.target.port, 22);
        assert_eq!(cfg.ssh_options().extra_options, ["StrictHostKeyChecking=no"]);
        assert_eq!(cfg.run.exclude_labels, ["legacy"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[target]\nhost = \" gpu-host \"\nport = 2200\n").unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.paths.config_file, path);
        assert_eq!(cfg.target.port, 2200);
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let result = Config::load(Some(Path::new("/nonexistent/dip/config.toml")));
        assert!(matches!(result, Err(DipError::MissingConfig { .. })));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[target\nhost=").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert_eq!(err.code(), "DIP-1003");
    }

    #[test]
    fn stable_hash_changes_when_config_changes() {
        let cfg = Config::default();
        let hash_before = cfg.stable_hash().expect("hash should compute");
        let mut modified = Config::default();
        modified.target.port += 1;
        let hash_after = modified.stable_hash().expect("hash should compute");
        assert_ne!(hash_before, hash_after);
        assert_eq!(hash_before, cfg.stable_hash().unwrap());
        assert_eq!(hash_before.len(), 16);
    }
}
