//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use device_injection_parity::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{DipError, Result};

// Remote
pub use crate::remote::scripted::{Reply, ScriptedExecutor};
pub use crate::remote::ssh::{SshExecutor, SshOptions};
pub use crate::remote::{CommandResult, RemoteExecutor, RemoteTarget, Stream};

// Scenarios
pub use crate::scenario::catalog::{builtin_catalog, load_catalog, parse_catalog};
pub use crate::scenario::fixtures::Fixtures;
pub use crate::scenario::{BaselineSource, ExpectedStatus, Scenario, Step, Variant};

// Verification
pub use crate::verify::equivalence::{Check, CompareMode, compare};
pub use crate::verify::guards::GuardSpec;
pub use crate::verify::skip::{SkipCondition, VersionProbe, should_skip};

// Runner
pub use crate::installer::{InstallerOptions, ToolkitInstaller};
pub use crate::runner::report::{RunReport, ScenarioReport, VariantReport};
pub use crate::runner::{RunnerOptions, ScenarioRunner};
