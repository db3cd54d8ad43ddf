//! Top-level CLI definition and dispatch.

use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use device_injection_parity::core::config::Config;
use device_injection_parity::core::errors::DipError;
use device_injection_parity::installer::ToolkitInstaller;
use device_injection_parity::logger::jsonl::{EventType, JsonlWriter, LogEntry, Severity};
use device_injection_parity::remote::RemoteExecutor;
use device_injection_parity::remote::ssh::SshExecutor;
use device_injection_parity::runner::report::{
    RunReport, ScenarioOutcome, ScenarioReport, VariantOutcome,
};
use device_injection_parity::runner::{RunnerOptions, ScenarioRunner};
use device_injection_parity::scenario::Scenario;
use device_injection_parity::scenario::catalog::{builtin_catalog, load_catalog};

/// Device injection parity: verify that GPU activation mechanisms agree.
#[derive(Debug, Parser)]
#[command(
    name = "dip",
    author,
    version,
    about = "Device injection parity harness",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the scenario matrix against the target host.
    Run(RunArgs),
    /// List scenarios, variants and labels.
    List(ListArgs),
    /// Inspect configuration state.
    Config(ConfigArgs),
    /// Show version and optional build metadata.
    Version(VersionArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct RunArgs {
    /// Only run the named scenario (repeatable).
    #[arg(long = "scenario", value_name = "NAME")]
    scenarios: Vec<String>,
    /// Skip variants carrying this label (repeatable).
    #[arg(long = "exclude-label", value_name = "LABEL")]
    exclude_labels: Vec<String>,
    /// Load scenarios from a TOML catalog instead of the built-in one.
    #[arg(long, value_name = "PATH")]
    catalog: Option<PathBuf>,
    /// Do not install the toolkit even when the config enables it.
    #[arg(long)]
    skip_install: bool,
    /// Also write the JSON report to this file.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
}

#[derive(Debug, Clone, Args, Default)]
struct ListArgs {
    /// List scenarios from a TOML catalog instead of the built-in one.
    #[arg(long, value_name = "PATH")]
    catalog: Option<PathBuf>,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args, Default)]
struct VersionArgs {
    /// Include additional build metadata fields.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// The matrix ran and at least one scenario failed.
    #[error("{0}")]
    Partial(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<DipError> for CliError {
    fn from(err: DipError) -> Self {
        match err {
            DipError::InvalidConfig { .. }
            | DipError::MissingConfig { .. }
            | DipError::ConfigParse { .. }
            | DipError::CatalogParse { .. }
            | DipError::UnknownTemplate { .. }
            | DipError::UnresolvedFixture { .. } => Self::User(err.to_string()),
            DipError::Serialization { .. } => Self::Internal(err.to_string()),
            DipError::VersionParse { .. }
            | DipError::Transport { .. }
            | DipError::Timeout { .. }
            | DipError::Io { .. }
            | DipError::Install { .. }
            | DipError::Runtime { .. } => Self::Runtime(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run(args) => run_matrix(cli, args),
        Command::List(args) => run_list(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Version(args) => emit_version(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

fn run_matrix(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let mode = output_mode(cli);
    let config = Config::load(cli.config.as_deref())?;
    let config_hash = config.stable_hash()?;

    let catalog_path = args.catalog.as_ref().or(config.run.catalog_file.as_ref());
    let catalog = resolve_catalog(catalog_path.map(PathBuf::as_path))?;
    let options = runner_options(&config, args);

    let executor = SshExecutor::new(config.remote_target(), config.ssh_options());
    let runner = ScenarioRunner::new(&executor, options)
        .with_log(JsonlWriter::open(&config.paths.jsonl_log));
    // Reject unknown --scenario names before touching the host.
    runner.select(&catalog)?;

    if cli.verbose && mode == OutputMode::Human {
        eprintln!("target: {}", executor.target());
        eprintln!("config: {} (hash {config_hash})", config.paths.config_file.display());
        eprintln!("log: {}", config.paths.jsonl_log.display());
    }

    if config.installer.enabled && !args.skip_install {
        install_toolkit(cli, &config, &executor, &runner)?;
    }

    let report = runner.run_all(&catalog, &config_hash)?;

    match mode {
        OutputMode::Human => print_report_human(&report, cli.verbose, cli.quiet),
        OutputMode::Json => {
            let payload = serde_json::to_value(&report)?;
            write_json_line(&payload)?;
        }
    }

    if let Some(path) = &args.report {
        write_report_file(path, &report)?;
    }
    if let Some(dir) = &config.paths.report_dir {
        let path = dir.join(report_file_name(&report.started_at));
        write_report_file(&path, &report)?;
    }

    if report.is_success() {
        Ok(())
    } else {
        let counts = report.scenario_counts();
        Err(CliError::Partial(format!(
            "{} of {} scenario(s) failed",
            counts.failed,
            report.scenarios.len()
        )))
    }
}

fn resolve_catalog(path: Option<&Path>) -> Result<Vec<Scenario>, CliError> {
    match path {
        Some(path) => load_catalog(path).map_err(|err| match err {
            DipError::Io { .. } => CliError::User(err.to_string()),
            other => other.into(),
        }),
        None => Ok(builtin_catalog()),
    }
}

/// Command-line filters extend the configured ones.
fn runner_options(config: &Config, args: &RunArgs) -> RunnerOptions {
    let only_scenarios = if args.scenarios.is_empty() {
        config.run.scenarios.clone()
    } else {
        args.scenarios.clone()
    };
    let mut exclude_labels = config.run.exclude_labels.clone();
    for label in &args.exclude_labels {
        if !exclude_labels.contains(label) {
            exclude_labels.push(label.clone());
        }
    }
    RunnerOptions {
        exclude_labels,
        only_scenarios,
    }
}

fn install_toolkit(
    cli: &Cli,
    config: &Config,
    executor: &SshExecutor,
    runner: &ScenarioRunner<'_>,
) -> Result<(), CliError> {
    let installer = ToolkitInstaller::new(config.installer_options())?;
    if !cli.quiet && output_mode(cli) == OutputMode::Human {
        eprintln!(
            "installing toolkit {} ({} template)",
            installer.image(),
            installer.template()
        );
    }
    let target = executor.target().to_string();
    match installer.install(executor) {
        Ok(()) => {
            runner.log(
                LogEntry::new(EventType::InstallComplete, Severity::Info)
                    .target(&target)
                    .details(format!(
                        "image={} template={}",
                        installer.image(),
                        installer.template()
                    )),
            );
            Ok(())
        }
        Err(err) => {
            runner.log(
                LogEntry::new(EventType::InstallFailed, Severity::Critical)
                    .target(&target)
                    .error(&err),
            );
            Err(err.into())
        }
    }
}

fn print_report_human(report: &RunReport, verbose: bool, quiet: bool) {
    if !quiet {
        println!("{} {}", "target".bold(), report.target);
        for scenario in &report.scenarios {
            print_scenario_human(scenario, verbose);
        }
        println!();
    }
    let s = report.scenario_counts();
    let v = report.variant_counts();
    let line = format!(
        "scenarios: {} passed, {} failed, {} skipped; variants: {} passed, {} failed, {} skipped, {} aborted",
        s.passed, s.failed, s.skipped, v.passed, v.failed, v.skipped, v.aborted
    );
    if report.is_success() {
        println!("{}", line.green());
    } else {
        println!("{}", line.red().bold());
    }
}

fn print_scenario_human(scenario: &ScenarioReport, verbose: bool) {
    let status = match &scenario.outcome {
        ScenarioOutcome::Passed => "PASS".green().bold(),
        ScenarioOutcome::Failed => "FAIL".red().bold(),
        ScenarioOutcome::Skipped { .. } => "SKIP".yellow().bold(),
    };
    let timing = format!("[{} ms]", scenario.duration_ms);
    println!("{status} {} {}", scenario.name.bold(), timing.dimmed());
    if let ScenarioOutcome::Skipped { reason } = &scenario.outcome {
        println!("     {}", reason.yellow());
    }
    if let Some(failure) = &scenario.setup_failure {
        println!("     {}", failure.describe().red());
    }

    // Passing scenarios are collapsed unless verbose.
    let expand = verbose || scenario.failed();
    for variant in &scenario.variants {
        if !expand && matches!(variant.outcome, VariantOutcome::Passed) {
            continue;
        }
        let status = match &variant.outcome {
            VariantOutcome::Passed => "pass".green(),
            VariantOutcome::Failed => "fail".red(),
            VariantOutcome::Skipped { .. } => "skip".yellow(),
            VariantOutcome::Aborted { .. } => "abort".red(),
        };
        let labels = if variant.labels.is_empty() {
            String::new()
        } else {
            format!(" [{}]", variant.labels.join(","))
        };
        println!("    {status:<5} {}{}", variant.name, labels.dimmed());
        match &variant.outcome {
            VariantOutcome::Skipped { reason } | VariantOutcome::Aborted { reason } => {
                println!("          {reason}");
            }
            VariantOutcome::Passed | VariantOutcome::Failed => {}
        }
        for failure in &variant.failures {
            println!("          {}", failure.describe());
        }
        for note in &variant.notes {
            println!("          {} {note}", "note:".cyan());
        }
    }
    for err in &scenario.teardown_errors {
        println!("    {} {err}", "teardown:".yellow());
    }
}

fn report_file_name(started_at: &str) -> String {
    let stamp: String = started_at
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("dip-report-{stamp}.json")
}

fn write_report_file(path: &Path, report: &RunReport) -> Result<(), CliError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|e| CliError::Runtime(format!("create report dir {}: {e}", parent.display())))?;
    }
    let body = serde_json::to_string_pretty(report)?;
    fs::write(path, format!("{body}\n"))
        .map_err(|e| CliError::Runtime(format!("write report {}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn run_list(cli: &Cli, args: &ListArgs) -> Result<(), CliError> {
    let configured = if args.catalog.is_some() {
        None
    } else {
        Config::load(cli.config.as_deref())?.run.catalog_file
    };
    let path = args.catalog.as_deref().or(configured.as_deref());
    let catalog = resolve_catalog(path)?;

    match output_mode(cli) {
        OutputMode::Human => {
            for scenario in &catalog {
                let mut flags = Vec::new();
                if scenario.ordered {
                    flags.push("ordered");
                }
                if scenario.skip_when.is_some() {
                    flags.push("conditional");
                }
                if !scenario.guards.is_empty() {
                    flags.push("guarded");
                }
                let flags = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", flags.join(", "))
                };
                println!("{}{}", scenario.name.bold(), flags.dimmed());
                for variant in &scenario.variants {
                    let labels = if variant.labels.is_empty() {
                        String::new()
                    } else {
                        format!(" [{}]", variant.labels.join(","))
                    };
                    println!("    {}{}", variant.name, labels.yellow());
                    if cli.verbose {
                        println!("        {}", variant.run.dimmed());
                    }
                }
            }
        }
        OutputMode::Json => {
            let scenarios: Vec<Value> = catalog
                .iter()
                .map(|scenario| {
                    json!({
                        "name": scenario.name,
                        "ordered": scenario.ordered,
                        "conditional": scenario.skip_when.is_some(),
                        "guards": scenario.guards.iter().map(|g| g.name()).collect::<Vec<_>>(),
                        "variants": scenario.variants.iter().map(|v| json!({
                            "name": v.name,
                            "labels": v.labels,
                        })).collect::<Vec<_>>(),
                    })
                })
                .collect();
            let payload = json!({
                "command": "list",
                "scenarios": scenarios,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let value = serde_json::to_value(&config)?;
                    let payload = json!({
                        "command": "config show",
                        "config": value,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Target: {}", config.remote_target());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "target": config.remote_target().to_string(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "code": e.code(),
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ---------------------------------------------------------------------------
// version / output helpers
// ---------------------------------------------------------------------------

fn emit_version(cli: &Cli, args: &VersionArgs) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    let package = env!("CARGO_PKG_NAME");
    let target = option_env!("TARGET").unwrap_or("unknown");
    let profile = option_env!("PROFILE").unwrap_or("unknown");
    let git_sha = option_env!("VERGEN_GIT_SHA")
        .or(option_env!("GIT_SHA"))
        .unwrap_or("unknown");

    match output_mode(cli) {
        OutputMode::Human => {
            println!("dip {version}");
            if args.verbose {
                println!("package: {package}");
                println!("target: {target}");
                println!("profile: {profile}");
                println!("git_sha: {git_sha}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "binary": "dip",
                "version": version,
                "package": package,
                "build": {
                    "target": target,
                    "profile": profile,
                    "git_sha": git_sha,
                }
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("DIP_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
