//! Sequential scenario runner.
//!
//! Lifecycle per scenario: skip check → setup → baseline → arm guards →
//! variants in declared order (run, check, guards, variant teardown) →
//! teardown. Teardown is attempted whenever the skip check did not skip the
//! scenario, including after setup or variant failures.

pub mod report;

use std::collections::HashSet;
use std::time::Instant;

use parking_lot::Mutex;

use crate::core::errors::{DipError, Result};
use crate::logger::jsonl::{EventType, JsonlWriter, LogEntry, Severity, format_utc_now};
use crate::remote::{CommandResult, RemoteExecutor, RemoteTarget};
use crate::scenario::catalog::catalog_digest;
use crate::scenario::fixtures::Fixtures;
use crate::scenario::{BaselineSource, ExpectedStatus, Scenario, Step, Variant};
use crate::verify::equivalence::{self, CheckOutcome};
use crate::verify::guards::{ArmedGuard, GuardViolation};
use crate::verify::skip;

use self::report::{
    Failure, RunReport, ScenarioOutcome, ScenarioReport, VariantOutcome, VariantReport,
};

/// Filters applied to a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Variants carrying any of these labels are recorded as skipped.
    pub exclude_labels: Vec<String>,
    /// When non-empty, only these scenarios run.
    pub only_scenarios: Vec<String>,
}

/// Interprets scenarios against one executor.
pub struct ScenarioRunner<'a> {
    executor: &'a dyn RemoteExecutor,
    log: Mutex<JsonlWriter>,
    options: RunnerOptions,
}

/// Executor wrapper that logs every command of the current scenario.
struct Traced<'r, 'a> {
    runner: &'r ScenarioRunner<'a>,
    scenario: &'r str,
}

impl RemoteExecutor for Traced<'_, '_> {
    fn target(&self) -> &RemoteTarget {
        self.runner.executor.target()
    }

    fn run(&self, command: &str) -> Result<CommandResult> {
        let outcome = self.runner.executor.run(command);
        let entry = match &outcome {
            Ok(result) => LogEntry::command_ran(command, result),
            Err(err) => LogEntry::command_failed(command, err),
        };
        self.runner.log(entry.scenario(self.scenario));
        outcome
    }
}

impl<'a> ScenarioRunner<'a> {
    #[must_use]
    pub fn new(executor: &'a dyn RemoteExecutor, options: RunnerOptions) -> Self {
        Self {
            executor,
            log: Mutex::new(JsonlWriter::disabled()),
            options,
        }
    }

    #[must_use]
    pub fn with_log(mut self, log: JsonlWriter) -> Self {
        self.log = Mutex::new(log);
        self
    }

    pub fn log(&self, entry: LogEntry) {
        self.log.lock().write_entry(&entry);
    }

    /// Scenarios selected by `only_scenarios`, in catalog order.
    pub fn select<'s>(&self, scenarios: &'s [Scenario]) -> Result<Vec<&'s Scenario>> {
        if self.options.only_scenarios.is_empty() {
            return Ok(scenarios.iter().collect());
        }
        let known: HashSet<&str> = scenarios.iter().map(|s| s.name.as_str()).collect();
        if let Some(unknown) = self
            .options
            .only_scenarios
            .iter()
            .find(|name| !known.contains(name.as_str()))
        {
            return Err(DipError::InvalidConfig {
                details: format!("unknown scenario {unknown:?}"),
            });
        }
        Ok(scenarios
            .iter()
            .filter(|s| self.options.only_scenarios.contains(&s.name))
            .collect())
    }

    /// Run every selected scenario in order. A failed scenario never stops
    /// the ones after it.
    pub fn run_all(&self, scenarios: &[Scenario], config_hash: &str) -> Result<RunReport> {
        let selected = self.select(scenarios)?;
        let started_at = format_utc_now();
        let target = self.executor.target().to_string();
        let digest = catalog_digest(scenarios)?;
        self.log(
            LogEntry::new(EventType::RunStart, Severity::Info)
                .target(&target)
                .details(format!(
                    "scenarios={} config_hash={config_hash} catalog={digest}",
                    selected.len()
                )),
        );

        let reports: Vec<ScenarioReport> = selected
            .into_iter()
            .map(|scenario| self.run_scenario(scenario))
            .collect();

        let report = RunReport {
            started_at,
            finished_at: format_utc_now(),
            target,
            config_hash: config_hash.to_string(),
            catalog_digest: digest,
            scenarios: reports,
        };
        let counts = report.scenario_counts();
        let severity = if report.is_success() {
            Severity::Info
        } else {
            Severity::Warning
        };
        let mut done = LogEntry::new(EventType::RunComplete, severity).details(format!(
            "passed={} failed={} skipped={}",
            counts.passed, counts.failed, counts.skipped
        ));
        done.ok = Some(report.is_success());
        self.log(done);
        self.log.lock().flush();
        Ok(report)
    }

    /// Run one scenario through its full lifecycle.
    pub fn run_scenario(&self, scenario: &Scenario) -> ScenarioReport {
        let started = Instant::now();
        let exec = Traced {
            runner: self,
            scenario: &scenario.name,
        };
        self.log(LogEntry::new(EventType::ScenarioStart, Severity::Info).scenario(&scenario.name));

        let mut report = ScenarioReport::new(&scenario.name);
        let mut fixtures = Fixtures::with_random_run_id();

        if let Some(condition) = &scenario.skip_when {
            match skip::evaluate(condition, &exec, &fixtures) {
                Ok(decision) if decision.skip => {
                    self.log(
                        LogEntry::new(EventType::ScenarioSkipped, Severity::Info)
                            .scenario(&scenario.name)
                            .details(&decision.reason),
                    );
                    report.outcome = ScenarioOutcome::Skipped {
                        reason: decision.reason,
                    };
                    report.duration_ms = elapsed_ms(started);
                    return report;
                }
                Ok(_) => {}
                Err(err) => report.setup_failure = Some(failure_from(&err)),
            }
        }

        if report.setup_failure.is_none() {
            match self.prepare(scenario, &exec, &mut fixtures) {
                Ok((baseline, guards)) => {
                    self.run_variants(scenario, &exec, &fixtures, baseline, &guards, &mut report);
                }
                Err(err) => report.setup_failure = Some(failure_from(&err)),
            }
        }

        if let Some(failure) = &report.setup_failure {
            let reason = failure.describe();
            report.variants = scenario
                .variants
                .iter()
                .map(|variant| match self.excluded_label(variant) {
                    Some(label) => VariantReport::skipped(
                        &variant.name,
                        variant.labels.clone(),
                        format!("label {label} excluded"),
                    ),
                    None => VariantReport::aborted(&variant.name, variant.labels.clone(), &reason),
                })
                .collect();
        }

        if let Some(step) = &scenario.teardown {
            report.teardown_errors = self.run_best_effort(step, &exec, &fixtures);
            for err in &report.teardown_errors {
                self.log(
                    LogEntry::new(EventType::TeardownFailed, Severity::Warning)
                        .scenario(&scenario.name)
                        .details(err),
                );
            }
        }

        report.settle();
        report.duration_ms = elapsed_ms(started);
        let severity = if report.failed() {
            Severity::Warning
        } else {
            Severity::Info
        };
        let mut done = LogEntry::new(EventType::ScenarioComplete, severity)
            .scenario(&scenario.name)
            .duration_ms(report.duration_ms);
        done.ok = Some(!report.failed());
        if let Some(failure) = &report.setup_failure {
            done = done.details(failure.describe());
        }
        self.log(done);
        report
    }

    /// Setup, baseline capture and guard arming.
    fn prepare(
        &self,
        scenario: &Scenario,
        exec: &dyn RemoteExecutor,
        fixtures: &mut Fixtures,
    ) -> Result<(Option<CommandResult>, Vec<ArmedGuard>)> {
        if let Some(step) = &scenario.setup {
            run_setup(step, exec, fixtures)?;
        }
        let baseline = match &scenario.baseline {
            Some(BaselineSource::Command { run }) => {
                let command = fixtures.render(run)?;
                let result = exec.run(&command)?;
                if !result.succeeded {
                    return Err(command_failed("baseline", &command, &result));
                }
                Some(result)
            }
            Some(BaselineSource::FirstVariant) | None => None,
        };
        let guards = scenario
            .guards
            .iter()
            .map(|guard| guard.arm(exec, fixtures))
            .collect::<Result<Vec<_>>>()?;
        Ok((baseline, guards))
    }

    fn run_variants(
        &self,
        scenario: &Scenario,
        exec: &dyn RemoteExecutor,
        fixtures: &Fixtures,
        mut baseline: Option<CommandResult>,
        guards: &[ArmedGuard],
        report: &mut ScenarioReport,
    ) {
        let mut abort_reason: Option<String> = None;

        for (index, variant) in scenario.variants.iter().enumerate() {
            let is_reference =
                index == 0 && scenario.baseline == Some(BaselineSource::FirstVariant);
            if let Some(label) = self.excluded_label(variant) {
                report.variants.push(VariantReport::skipped(
                    &variant.name,
                    variant.labels.clone(),
                    format!("label {label} excluded"),
                ));
                continue;
            }
            if let Some(reason) = &abort_reason {
                report.variants.push(VariantReport::aborted(
                    &variant.name,
                    variant.labels.clone(),
                    reason,
                ));
                continue;
            }

            let started = Instant::now();
            let mut vr = VariantReport::new(&variant.name, variant.labels.clone());
            let transport_lost = self.run_variant(
                scenario,
                variant,
                exec,
                fixtures,
                is_reference,
                &mut baseline,
                guards,
                &mut vr,
            );
            if is_reference && vr.failed() {
                baseline = None;
            }

            if let Some(step) = &scenario.variant_teardown {
                for err in self.run_best_effort(step, exec, fixtures) {
                    self.log(
                        LogEntry::new(EventType::TeardownFailed, Severity::Warning)
                            .scenario(&scenario.name)
                            .variant(&variant.name)
                            .details(&err),
                    );
                    vr.notes.push(format!("variant teardown: {err}"));
                }
            }
            vr.duration_ms = elapsed_ms(started);

            if vr.failed() {
                let details = vr
                    .failures
                    .iter()
                    .map(Failure::describe)
                    .collect::<Vec<_>>()
                    .join("; ");
                self.log(
                    LogEntry::new(EventType::VariantFailed, Severity::Warning)
                        .scenario(&scenario.name)
                        .variant(&variant.name)
                        .duration_ms(vr.duration_ms)
                        .details(details),
                );
                if transport_lost {
                    abort_reason = Some(format!("transport failure in variant {}", variant.name));
                } else if scenario.ordered {
                    abort_reason = Some(format!(
                        "variant {} failed in an ordered scenario",
                        variant.name
                    ));
                }
            } else {
                self.log(
                    LogEntry::new(EventType::VariantPassed, Severity::Info)
                        .scenario(&scenario.name)
                        .variant(&variant.name)
                        .duration_ms(vr.duration_ms),
                );
            }
            report.variants.push(vr);
        }
    }

    /// Run one variant and record failures into `vr`. Returns whether the
    /// transport was lost.
    ///
    /// Only the reference variant (the first declared one of a first-variant
    /// scenario) may fill `baseline`. The caller clears it again when the
    /// reference fails.
    #[allow(clippy::too_many_arguments)]
    fn run_variant(
        &self,
        scenario: &Scenario,
        variant: &Variant,
        exec: &dyn RemoteExecutor,
        fixtures: &Fixtures,
        is_reference: bool,
        baseline: &mut Option<CommandResult>,
        guards: &[ArmedGuard],
        vr: &mut VariantReport,
    ) -> bool {
        let command = match fixtures.render(&variant.run) {
            Ok(command) => command,
            Err(err) => {
                vr.fail(failure_from(&err));
                return false;
            }
        };
        let result = match exec.run(&command) {
            Ok(result) => result,
            Err(err) => {
                vr.fail(failure_from(&err));
                return err.is_transport();
            }
        };
        vr.exit_code = result.exit_code;

        let status_ok = match variant.expect {
            ExpectedStatus::Success => result.succeeded,
            ExpectedStatus::Failure => !result.succeeded,
        };
        if !status_ok {
            vr.fail(Failure::UnexpectedStatus {
                expected: match variant.expect {
                    ExpectedStatus::Success => "success".to_string(),
                    ExpectedStatus::Failure => "failure".to_string(),
                },
                exit_code: result.exit_code,
                stderr: result.stderr.clone(),
            });
        }

        if is_reference && status_ok {
            *baseline = Some(result.clone());
        }

        for check in &variant.checks {
            match equivalence::evaluate(check, baseline.as_ref(), &result) {
                CheckOutcome::Pass => {}
                CheckOutcome::Mismatch(mismatch) => vr.fail(Failure::Mismatch(mismatch)),
                CheckOutcome::NoBaseline => vr.fail(Failure::NoBaseline),
            }
        }

        for guard in guards {
            match guard.check(exec, variant, &result) {
                Ok(None) => {}
                Ok(Some(violation)) => {
                    self.log(
                        LogEntry::new(EventType::GuardViolation, Severity::Critical)
                            .scenario(&scenario.name)
                            .variant(&variant.name)
                            .details(format!("{}: {}", violation.guard, violation.message)),
                    );
                    vr.fail(Failure::GuardViolation(violation));
                }
                Err(err) if err.is_transport() => {
                    vr.fail(failure_from(&err));
                    return true;
                }
                Err(err) => vr.fail(Failure::GuardViolation(GuardViolation {
                    guard: guard.name().to_string(),
                    message: format!("guard could not be evaluated: {err}"),
                })),
            }
        }
        false
    }

    fn excluded_label<'v>(&self, variant: &'v Variant) -> Option<&'v str> {
        variant
            .labels
            .iter()
            .find(|label| self.options.exclude_labels.contains(*label))
            .map(String::as_str)
    }

    /// Run every command of `step`, collecting errors instead of stopping.
    fn run_best_effort(
        &self,
        step: &Step,
        exec: &dyn RemoteExecutor,
        fixtures: &Fixtures,
    ) -> Vec<String> {
        let mut errors = Vec::new();
        for cmd in &step.commands {
            let command = match fixtures.render(&cmd.run) {
                Ok(command) => command,
                Err(err) => {
                    errors.push(err.to_string());
                    continue;
                }
            };
            match exec.run(&command) {
                Ok(result) if cmd.require_success && !result.succeeded => {
                    errors.push(command_failed("teardown", &command, &result).to_string());
                }
                Ok(_) => {}
                Err(err) => errors.push(err.to_string()),
            }
        }
        errors
    }
}

/// Run setup commands in order, capturing fixtures. Stops at the first error.
fn run_setup(step: &Step, exec: &dyn RemoteExecutor, fixtures: &mut Fixtures) -> Result<()> {
    for cmd in &step.commands {
        let command = fixtures.render(&cmd.run)?;
        let result = exec.run(&command)?;
        if cmd.require_success && !result.succeeded {
            return Err(command_failed("setup", &command, &result));
        }
        let captured = result.stdout.trim();
        if cmd.require_output && captured.is_empty() {
            return Err(DipError::Runtime {
                details: format!("setup command `{command}` produced no output"),
            });
        }
        if let Some(name) = &cmd.capture {
            fixtures.insert(name, captured);
        }
    }
    Ok(())
}

fn command_failed(phase: &str, command: &str, result: &CommandResult) -> DipError {
    DipError::Runtime {
        details: format!(
            "{phase} command `{command}` failed (exit {}): {}",
            result
                .exit_code
                .map_or_else(|| "signal".to_string(), |c| c.to_string()),
            result.stderr.trim()
        ),
    }
}

fn failure_from(err: &DipError) -> Failure {
    if err.is_transport() {
        Failure::Transport {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    } else {
        Failure::Setup {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
