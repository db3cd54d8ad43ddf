//! Scenario catalogs: the built-in docker matrix and TOML catalog files.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::errors::{DipError, Result};
use crate::scenario::{BaselineSource, Scenario, Step, Variant};
use crate::verify::equivalence::Check;
use crate::verify::guards::GuardSpec;
use crate::verify::skip::{SkipCondition, VersionExtract, VersionProbe};

/// Label for mechanisms that predate CDI.
pub const LEGACY: &str = "legacy";

const UBUNTU: &str = "ubuntu";
const VECTOR_ADD_IMAGE: &str = "nvcr.io/nvidia/k8s/cuda-sample:vectoradd-cuda12.5.0";
const DEVICE_QUERY_IMAGE: &str = "nvcr.io/nvidia/k8s/cuda-sample:devicequery-cuda12.5.0";
const COMPAT_IMAGE: &str = "nvcr.io/nvidia/cuda:12.9.0-base-ubi8";

/// Stderr emitted by the legacy hook when the firmware path escapes the rootfs.
pub const FIRMWARE_PATH_DIAGNOSTIC: &str = "nvidia-container-cli.real: mount error: path error:";

/// On-disk catalog: a list of `[[scenario]]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogFile {
    #[serde(default)]
    pub scenario: Vec<Scenario>,
}

/// The docker activation-mechanism matrix.
#[must_use]
pub fn builtin_catalog() -> Vec<Scenario> {
    vec![
        device_listing(),
        sample_equivalence("cuda-vectoradd", VECTOR_ADD_IMAGE, "Test PASSED"),
        sample_equivalence("cuda-devicequery", DEVICE_QUERY_IMAGE, "Result = PASS"),
        forward_compatibility(),
        device_node_creation_disabled(),
        cdi_ldcache(),
        shared_mount_propagation(),
        firmware_containment(),
    ]
}

/// `(name, docker run flags)` for each way of requesting GPUs.
struct Mechanism {
    name: &'static str,
    flags: &'static str,
    legacy: bool,
}

const NVIDIA_VISIBLE_DEVICES: Mechanism = Mechanism {
    name: "nvidia-visible-devices",
    flags: "--runtime=nvidia -e NVIDIA_VISIBLE_DEVICES=all",
    legacy: false,
};
const CDI: Mechanism = Mechanism {
    name: "cdi",
    flags: "--runtime=nvidia -e NVIDIA_VISIBLE_DEVICES=runtime.nvidia.com/gpu=all",
    legacy: false,
};
const CDI_GPUS_FLAG: Mechanism = Mechanism {
    name: "cdi-gpus-flag",
    flags: "--gpus=all --runtime=nvidia -e NVIDIA_VISIBLE_DEVICES=runtime.nvidia.com/gpu=all",
    legacy: false,
};
const RUNTIME_GPUS_FLAG: Mechanism = Mechanism {
    name: "runtime-gpus-flag",
    flags: "--runtime=nvidia --gpus all",
    legacy: false,
};
const HOOK_GPUS_FLAG: Mechanism = Mechanism {
    name: "hook-gpus-flag",
    flags: "--gpus all",
    legacy: true,
};

impl Mechanism {
    fn variant(&self, tail: &str) -> Variant {
        let variant = Variant::new(self.name, format!("docker run --rm -i {} {tail}", self.flags));
        if self.legacy {
            variant.label(LEGACY)
        } else {
            variant
        }
    }
}

fn device_listing() -> Scenario {
    let mut scenario = Scenario::new("device-listing")
        .setup(Step::new().run(format!("docker pull {UBUNTU}")))
        .baseline(BaselineSource::Command {
            run: "nvidia-smi -L".to_string(),
        });
    for mechanism in [
        NVIDIA_VISIBLE_DEVICES,
        CDI,
        CDI_GPUS_FLAG,
        RUNTIME_GPUS_FLAG,
        HOOK_GPUS_FLAG,
    ] {
        scenario = scenario.variant(
            mechanism
                .variant(&format!("{UBUNTU} nvidia-smi -L"))
                .check(Check::matches_baseline()),
        );
    }
    scenario
}

fn sample_equivalence(name: &str, image: &str, marker: &str) -> Scenario {
    let mut scenario = Scenario::new(name)
        .setup(Step::new().run(format!("docker pull {image}")))
        .baseline(BaselineSource::FirstVariant)
        .variant(
            NVIDIA_VISIBLE_DEVICES
                .variant(image)
                .check(Check::contains(marker)),
        );
    for mechanism in [CDI, RUNTIME_GPUS_FLAG, HOOK_GPUS_FLAG] {
        scenario = scenario.variant(mechanism.variant(image).check(Check::matches_baseline()));
    }
    scenario
}

fn forward_compatibility() -> Scenario {
    let ldconfig = format!("{COMPAT_IMAGE} bash -c \"ldconfig -p | grep libcuda.so.1\"");
    let compat_dir = Check::contains("/usr/local/cuda-12.9/compat/");
    Scenario::new("cuda-forward-compat")
        .ordered()
        .skip_when(SkipCondition {
            reason: "CUDA forward compatibility requires an older host driver".to_string(),
            prepare: vec![format!("docker pull {COMPAT_IMAGE}")],
            subject: VersionProbe::new(
                "nvidia-smi -q | grep \"Driver Version\"",
                VersionExtract::AfterSeparator {
                    separator: ":".to_string(),
                },
            ),
            reference: VersionProbe::new(
                format!(
                    "docker run --rm -i -e NVIDIA_VISIBLE_DEVICES=void {COMPAT_IMAGE} \
                     bash -c \"ls /usr/local/cuda/compat/libcuda.*.*\""
                ),
                VersionExtract::FileNameSuffix {
                    prefix: "libcuda.so.".to_string(),
                },
            ),
        })
        .variant(
            Variant::new(
                "runtime-legacy-mode",
                format!(
                    "docker run --rm -i -e NVIDIA_DISABLE_REQUIRE=true --runtime=nvidia --gpus all {ldconfig}"
                ),
            )
            .check(compat_dir.clone()),
        )
        .variant(
            Variant::new(
                "runtime-cdi-mode",
                format!(
                    "docker run --rm -i -e NVIDIA_DISABLE_REQUIRE=true --runtime=nvidia \
                     -e NVIDIA_VISIBLE_DEVICES=runtime.nvidia.com/gpu=all {ldconfig}"
                ),
            )
            .check(compat_dir.clone()),
        )
        .variant(
            Variant::new(
                "hook",
                format!(
                    "docker run --rm -i -e NVIDIA_DISABLE_REQUIRE=true --runtime=runc --gpus all {ldconfig}"
                ),
            )
            .label(LEGACY)
            .check(compat_dir),
        )
}

fn device_node_creation_disabled() -> Scenario {
    let probe = format!("{UBUNTU} bash -c \"grep ModifyDeviceFiles: /proc/driver/nvidia/params\"");
    Scenario::new("device-node-creation-disabled")
        .setup(Step::new().run(format!("docker pull {UBUNTU}")))
        .guard(GuardSpec::flag_value("ModifyDeviceFiles: 0\n"))
        .variant(
            Variant::new(
                "hook",
                format!("docker run --rm -i --runtime=runc --gpus=all {probe}"),
            )
            .label(LEGACY),
        )
        .variant(CDI.variant(&probe))
}

fn cdi_ldcache() -> Scenario {
    Scenario::new("cdi-ldcache")
        .setup(Step::new().run(format!("docker pull {UBUNTU}")))
        .variant(
            CDI.variant(&format!("{UBUNTU} bash -c \"ldconfig -p | grep 'libcuda.so'\""))
                .check(Check::not_empty())
                .check(Check::contains_entries(["libcuda.so", "libcuda.so.1"])),
        )
}

fn shared_mount_propagation() -> Scenario {
    let bind = "--mount type=bind,source=/tmp/dip-mounts-{{run_id}},target=/empty,bind-propagation=shared";
    let all_caps = "-e NVIDIA_VISIBLE_DEVICES=all -e NVIDIA_DRIVER_CAPABILITIES=all";
    Scenario::new("shared-mount-propagation")
        .setup(
            Step::new()
                .run(format!("docker pull {UBUNTU}"))
                .run("mkdir -p /tmp/dip-mounts-{{run_id}}"),
        )
        .guard(GuardSpec::mount_leak())
        .variant(
            Variant::new(
                "hook",
                format!("docker run --rm -i --runtime=runc {all_caps} {bind} {UBUNTU} true"),
            )
            .label(LEGACY),
        )
        .variant(Variant::new(
            "runtime",
            format!("docker run --rm -i --runtime=nvidia {all_caps} {bind} {UBUNTU} true"),
        ))
        .variant(Variant::new(
            "cdi",
            format!(
                "docker run --rm -i --runtime=nvidia -e NVIDIA_VISIBLE_DEVICES=all \
                 -e NVIDIA_DRIVER_CAPABILITIES=runtime.nvidia.com/gpu=all {bind} {UBUNTU} true"
            ),
        ))
        .teardown(Step::new().run_lenient("rm -rf /tmp/dip-mounts-{{run_id}}"))
}

const FIRMWARE_IMAGE_BUILD: &str = r#"docker build -t firmware-test \
            --build-arg RM_VERSION="$(basename $(ls -d /lib/firmware/nvidia/*.*))" \
            --build-arg CURRENT_DIR="{{output_dir}}" \
            - <<EOF
FROM ubuntu
RUN mkdir -p /lib/firmware/nvidia/
ARG RM_VERSION
ARG CURRENT_DIR
RUN ln -s /../../../../../../../../\$CURRENT_DIR /lib/firmware/nvidia/\$RM_VERSION
EOF"#;

fn firmware_containment() -> Scenario {
    Scenario::new("firmware-path-containment")
        .setup(
            Step::new()
                .capture("mktemp -d -p $(pwd)", "output_dir")
                .run(format!("docker pull {UBUNTU}"))
                .run(FIRMWARE_IMAGE_BUILD),
        )
        .guard(GuardSpec::path_containment(
            "{{output_dir}}",
            FIRMWARE_PATH_DIAGNOSTIC,
        ))
        .variant(
            Variant::new(
                "cdi",
                "docker run --rm --runtime=nvidia -e NVIDIA_VISIBLE_DEVICES=runtime.nvidia.com/gpu=all firmware-test",
            )
            .check(Check::empty()),
        )
        .variant(Variant::new(
            "runtime",
            "docker run --rm --runtime=nvidia -e NVIDIA_VISIBLE_DEVICES=all -e NVIDIA_DRIVER_CAPABILITIES=all firmware-test",
        ))
        .variant(
            Variant::new("hook", "docker run --rm --runtime=runc --gpus=all firmware-test")
                .label(LEGACY)
                .expect_failure()
                .known_vulnerable()
                .check(Check::stderr_contains(FIRMWARE_PATH_DIAGNOSTIC)),
        )
        .teardown(Step::new().run_lenient("rm -rf {{output_dir}}"))
}

/// Parse a TOML catalog. `source_name` only labels errors.
pub fn parse_catalog(text: &str, source_name: &str) -> Result<Vec<Scenario>> {
    let file: CatalogFile = toml::from_str(text).map_err(|err| DipError::CatalogParse {
        source_name: source_name.to_string(),
        details: err.to_string(),
    })?;
    validate_catalog(&file.scenario).map_err(|err| match err {
        DipError::CatalogParse { details, .. } => DipError::CatalogParse {
            source_name: source_name.to_string(),
            details,
        },
        other => other,
    })?;
    Ok(file.scenario)
}

/// Load and validate a TOML catalog from disk.
pub fn load_catalog(path: &Path) -> Result<Vec<Scenario>> {
    let text = std::fs::read_to_string(path).map_err(|err| DipError::io(path, err))?;
    parse_catalog(&text, &path.display().to_string())
}

/// Structural checks the serde model cannot express.
pub fn validate_catalog(scenarios: &[Scenario]) -> Result<()> {
    let invalid = |details: String| DipError::CatalogParse {
        source_name: "catalog".to_string(),
        details,
    };
    if scenarios.is_empty() {
        return Err(invalid("catalog defines no scenarios".to_string()));
    }
    let mut names = HashSet::new();
    for scenario in scenarios {
        if scenario.name.trim().is_empty() {
            return Err(invalid("scenario with an empty name".to_string()));
        }
        if !names.insert(scenario.name.as_str()) {
            return Err(invalid(format!("duplicate scenario name {:?}", scenario.name)));
        }
        if scenario.variants.is_empty() {
            return Err(invalid(format!("scenario {:?} has no variants", scenario.name)));
        }
        let mut variant_names = HashSet::new();
        for variant in &scenario.variants {
            if !variant_names.insert(variant.name.as_str()) {
                return Err(invalid(format!(
                    "scenario {:?} declares variant {:?} twice",
                    scenario.name, variant.name
                )));
            }
        }
    }
    Ok(())
}

/// SHA-256 over the catalog's canonical JSON form, hex encoded.
pub fn catalog_digest(scenarios: &[Scenario]) -> Result<String> {
    let canonical = serde_json::to_vec(scenarios)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::ExpectedStatus;

    #[test]
    fn builtin_catalog_is_valid() {
        let catalog = builtin_catalog();
        validate_catalog(&catalog).unwrap();
        assert_eq!(catalog.len(), 8);
    }

    #[test]
    fn device_listing_covers_five_mechanisms() {
        let listing = &builtin_catalog()[0];
        assert_eq!(listing.variants.len(), 5);
        assert!(
            listing
                .variants
                .iter()
                .all(|v| v.checks == [Check::matches_baseline()])
        );
        assert_eq!(
            listing.variants.iter().filter(|v| v.has_label(LEGACY)).count(),
            1
        );
    }

    #[test]
    fn forward_compat_is_ordered_and_conditional() {
        let compat = builtin_catalog()
            .into_iter()
            .find(|s| s.name == "cuda-forward-compat")
            .unwrap();
        assert!(compat.ordered);
        assert!(compat.skip_when.is_some());
        assert!(compat.setup.is_none());
    }

    #[test]
    fn firmware_hook_expects_loud_failure() {
        let firmware = builtin_catalog()
            .into_iter()
            .find(|s| s.name == "firmware-path-containment")
            .unwrap();
        let hook = firmware.variants.iter().find(|v| v.name == "hook").unwrap();
        assert_eq!(hook.expect, ExpectedStatus::Failure);
        assert!(hook.known_vulnerable);
        assert!(firmware.teardown.is_some());
    }

    #[test]
    fn toml_catalog_parses() {
        let text = r#"
[[scenario]]
name = "listing"
baseline = { kind = "command", run = "nvidia-smi -L" }

[scenario.setup]
commands = [{ run = "docker pull ubuntu" }]

[[scenario.variants]]
name = "cdi"
run = "docker run --rm cdi"
checks = [{ kind = "matches_baseline" }]

[[scenario.variants]]
name = "hook"
run = "docker run --rm hook"
labels = ["legacy"]
checks = [{ kind = "contains", literal = "GPU 0" }]

[[scenario.guards]]
kind = "mount_leak"
"#;
        let scenarios = parse_catalog(text, "inline").unwrap();
        assert_eq!(scenarios.len(), 1);
        let listing = &scenarios[0];
        assert_eq!(listing.variants.len(), 2);
        assert_eq!(listing.guards, [GuardSpec::mount_leak()]);
        assert_eq!(listing.variants[1].checks, [Check::contains("GPU 0")]);
    }

    #[test]
    fn duplicate_variants_are_rejected() {
        let text = r#"
[[scenario]]
name = "dup"
[[scenario.variants]]
name = "a"
run = "true"
[[scenario.variants]]
name = "a"
run = "false"
"#;
        let err = parse_catalog(text, "dup.toml").unwrap_err();
        assert_eq!(err.code(), "DIP-2001");
        assert!(err.to_string().contains("dup.toml"));
    }

    #[test]
    fn empty_catalog_is_rejected() {
        assert!(parse_catalog("", "empty.toml").is_err());
    }

    #[test]
    fn load_catalog_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_catalog(&dir.path().join("absent.toml")).unwrap_err();
        assert_eq!(err.code(), "DIP-3003");
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let a = catalog_digest(&builtin_catalog()).unwrap();
        let b = catalog_digest(&builtin_catalog()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let mut changed = builtin_catalog();
        changed[0].ordered = true;
        assert_ne!(a, catalog_digest(&changed).unwrap());
    }
}
