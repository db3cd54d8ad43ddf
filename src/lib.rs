#![forbid(unsafe_code)]

//! Device injection parity (dip): a remote harness that checks container
//! device-injection mechanisms expose equivalent devices and libraries.
//!
//! A [`scenario::Scenario`] groups several activation mechanisms (variants)
//! that must behave alike. The [`runner::ScenarioRunner`] executes each
//! scenario over a [`remote::RemoteExecutor`], compares variant output with
//! [`verify::equivalence`], enforces host invariants with
//! [`verify::guards`], and records everything in a
//! [`runner::report::RunReport`].
//!
//! # Library usage
//!
//! ```rust,no_run
//! use device_injection_parity::prelude::*;
//!
//! let exec = ScriptedExecutor::new().with_fallback(CommandResult::ok("GPU 0\n"));
//! let runner = ScenarioRunner::new(&exec, RunnerOptions::default());
//! let report = runner.run_all(&builtin_catalog(), "local").unwrap();
//! println!("{}", report.summary());
//! ```

pub mod prelude;

pub mod core;
pub mod installer;
pub mod logger;
pub mod remote;
pub mod runner;
pub mod scenario;
pub mod verify;
