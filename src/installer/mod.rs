//! Container toolkit installation on the target host.
//!
//! An install script is rendered from a named template with the toolkit
//! image reference substituted, then executed once through the remote
//! executor before any scenario runs.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::errors::{DipError, Result};
use crate::remote::RemoteExecutor;
use crate::scenario::fixtures::Fixtures;

/// Installs the toolkit as a docker runtime with a systemd-managed restart.
const DOCKER_INSTALL_TEMPLATE: &str = r#"#! /usr/bin/env bash
set -xe

: ${IMAGE:={{image}}}

TEMP_DIR="/tmp/ctk_e2e.$(date +%s)_$RANDOM"
mkdir -p "$TEMP_DIR"

# dockerd probes for the runtime hook at startup.
sudo rm -f /usr/bin/nvidia-container-runtime-hook
sudo ln -s "$TEMP_DIR/toolkit/nvidia-container-runtime-hook" /usr/bin/nvidia-container-runtime-hook

docker run --pid=host --rm -i --privileged \
    -v /:/host \
    -v /var/run/docker.sock:/var/run/docker.sock \
    -v "$TEMP_DIR:$TEMP_DIR" \
    -v /etc/docker:/config-root \
    ${IMAGE} \
    --root "$TEMP_DIR" \
    --runtime=docker \
    --config=/config-root/daemon.json \
    --driver-root=/ \
    --no-daemon \
    --restart-mode=systemd
"#;

/// Named install template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallTemplate {
    #[default]
    Docker,
    /// Installation is a no-op; the toolkit is assumed present.
    None,
}

impl InstallTemplate {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::None => "none",
        }
    }

    #[must_use]
    pub const fn body(self) -> Option<&'static str> {
        match self {
            Self::Docker => Some(DOCKER_INSTALL_TEMPLATE),
            Self::None => None,
        }
    }
}

impl FromStr for InstallTemplate {
    type Err = DipError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "none" => Ok(Self::None),
            _ => Err(DipError::UnknownTemplate {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for InstallTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Installer inputs as they arrive from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerOptions {
    /// Full image reference including tag.
    pub image: String,
    /// Template identifier, e.g. `docker`.
    pub template: String,
}

/// Validated installer ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolkitInstaller {
    image: String,
    template: InstallTemplate,
}

impl ToolkitInstaller {
    /// Validate `options`. Nothing touches the target host yet.
    pub fn new(options: InstallerOptions) -> Result<Self> {
        let template: InstallTemplate = options.template.parse()?;
        let image = options.image.trim();
        if template != InstallTemplate::None && image.is_empty() {
            return Err(DipError::InvalidConfig {
                details: "installer image must not be empty".to_string(),
            });
        }
        if image.chars().any(char::is_whitespace) {
            return Err(DipError::InvalidConfig {
                details: format!("installer image {image:?} contains whitespace"),
            });
        }
        Ok(Self {
            image: image.to_string(),
            template,
        })
    }

    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    #[must_use]
    pub const fn template(&self) -> InstallTemplate {
        self.template
    }

    /// Rendered install script, `None` for the `none` template.
    pub fn script(&self) -> Result<Option<String>> {
        let Some(body) = self.template.body() else {
            return Ok(None);
        };
        let mut fixtures = Fixtures::new();
        fixtures.insert("image", self.image.as_str());
        fixtures.render(body).map(Some)
    }

    /// Run the install script on the target.
    ///
    /// Both a transport failure and a non-zero exit become
    /// [`DipError::Install`] carrying the remote stderr.
    pub fn install(&self, executor: &dyn RemoteExecutor) -> Result<()> {
        let Some(script) = self.script()? else {
            return Ok(());
        };
        let result = executor.run(&script).map_err(|err| DipError::Install {
            details: err.to_string(),
        })?;
        if result.succeeded {
            Ok(())
        } else {
            Err(DipError::Install {
                details: format!(
                    "{} template exited with {}: {}",
                    self.template,
                    result
                        .exit_code
                        .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    tail(&result.stderr, 20)
                ),
            })
        }
    }
}

/// Last `lines` lines of `text`, trimmed.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
