//! mendbuild - self-repairing build driver CLI
//!
//! ## Commands
//!
//! - `run`: Run the build with bounded retries and environment repairs
//! - `preflight`: Check that required tools and paths are present
//! - `scan`: List (or stop) conflicting build processes
//! - `rules`: Show the fix rules that would be active
//! - `report`: Show a stored run report

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mendbuild_core::{
    read_run_report, write_run_report, BuildDriver, DriverConfig, EnvironmentState, FileSink,
    PlanReport, RunReport, SystemProcessTable,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "mendbuild")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Self-repairing build driver", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON results
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the build, repairing the environment between failed attempts
    Run {
        /// Config file (default: ./mendbuild.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Maximum attempts per build step
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Append timestamped progress lines to this file
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Directory for run reports (default: .mendbuild/runs)
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// Build command; overrides [build] in the config
        #[arg(last = true)]
        argv: Vec<String>,
    },

    /// Check that required tools and paths exist
    Preflight {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Fail when anything is missing
        #[arg(long)]
        strict: bool,
    },

    /// Find build processes that would conflict with a new build
    Scan {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Command-line terms that must all match (overrides [conflict])
        #[arg(short, long, num_args = 1..)]
        signature: Vec<String>,

        /// Terminate matching processes
        #[arg(long)]
        kill: bool,
    },

    /// List active fix rules
    Rules {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show a stored run report
    Report {
        /// Run ID to show
        #[arg(long)]
        run: String,

        /// Directory containing run reports (default: .mendbuild/runs)
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    mendbuild_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            max_attempts,
            log_file,
            report_dir,
            argv,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(n) = max_attempts {
                config.retry.max_attempts = n;
            }
            if log_file.is_some() {
                config.log_file = log_file;
            }
            if report_dir.is_some() {
                config.report_dir = report_dir;
            }
            config.validate().context("Invalid run options")?;
            cmd_run(&config, &argv, cli.json).await
        }
        Commands::Preflight { config, strict } => {
            cmd_preflight(&load_config(config.as_deref())?, strict, cli.json)
        }
        Commands::Scan {
            config,
            signature,
            kill,
        } => {
            let mut config = load_config(config.as_deref())?;
            if !signature.is_empty() {
                config.conflict.signature = signature;
            }
            cmd_scan(&config, kill, cli.json).await
        }
        Commands::Rules { config } => cmd_rules(&load_config(config.as_deref())?, cli.json),
        Commands::Report { run, report_dir } => {
            let dir = match report_dir {
                Some(dir) => dir,
                None => load_config(None)?.report_dir(),
            };
            cmd_report(&run, &dir, cli.json)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<DriverConfig> {
    let mut config =
        DriverConfig::load_or_default(path).context("Failed to load mendbuild config")?;
    config
        .apply_env_overrides()
        .context("Invalid MENDBUILD_* environment override")?;
    Ok(config)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping build");
            cancel.cancel();
        }
    });
    token
}

/// Run the configured build plan
async fn cmd_run(config: &DriverConfig, argv: &[String], json: bool) -> Result<()> {
    let env = config.initial_env(EnvironmentState::from_process());
    let plan = config.plan(argv).context("No build command")?;

    let mut driver = BuildDriver::default()
        .with_rules(config.rule_set(&env))
        .with_budget(config.budget());
    if let Some(scanner) = config.scanner() {
        driver = driver.with_conflict_scanner(scanner);
    }
    if let Some(path) = &config.log_file {
        let sink = FileSink::open(path)
            .with_context(|| format!("Failed to open build log: {:?}", path))?;
        driver = driver.with_sink(Arc::new(sink));
    }

    info!(
        steps = plan.steps.len(),
        rules = driver.rules().len(),
        max_attempts = config.retry.max_attempts,
        "Starting build"
    );
    let report = driver
        .run_plan(&plan, env, &cancel_on_ctrl_c())
        .await
        .context("Build run aborted")?;

    let dir = config.report_dir();
    for step in &report.steps {
        let path = write_run_report(step, &dir)
            .with_context(|| format!("Failed to write run report to {:?}", dir))?;
        info!(run_id = %step.run_id, path = %path.display(), "Run report written");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_plan_report(&report);
    }

    if let Some(last) = report.last().filter(|l| !l.succeeded()) {
        last.clone()
            .into_result()
            .with_context(|| format!("Build failed; see run {}", last.run_id))?;
    }
    Ok(())
}

fn print_plan_report(report: &PlanReport) {
    for step in &report.steps {
        let mark = if step.succeeded() { "✓" } else { "✗" };
        println!(
            "{} {} ({} attempt(s), {} fix(es) applied) run {}",
            mark, step.command_line, step.attempts, step.fixes_applied, step.run_id
        );
        for record in &step.records {
            if record.matched_rules.is_empty() {
                continue;
            }
            println!(
                "    attempt {}: {}",
                record.index,
                record.matched_rules.join(", ")
            );
        }
    }
    println!();
    if report.succeeded() {
        println!(
            "✓ Build succeeded after {} attempt(s)",
            report.total_attempts()
        );
    } else {
        println!(
            "✗ Build failed after {} attempt(s), {} fix(es) applied",
            report.total_attempts(),
            report.total_fixes()
        );
        if let Some(last) = report.last() {
            println!("\nLast output:\n{}", tail(&last.last_output, 20));
        }
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Check prerequisites
fn cmd_preflight(config: &DriverConfig, strict: bool, json: bool) -> Result<()> {
    let env = config.initial_env(EnvironmentState::from_process());
    let report = config.preflight(&env);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for tool in &report.tools {
            match &tool.resolved {
                Some(path) => println!("✓ {} -> {}", tool.name, path.display()),
                None => println!("✗ {} not found on PATH", tool.name),
            }
        }
        for check in &report.paths {
            let mark = if check.exists { "✓" } else { "✗" };
            println!("{} {}", mark, check.path.display());
        }
        let layout = config.layout(&env);
        println!();
        println!("Qt:       {}", display_opt(&layout.qt_dir));
        println!("Shiboken: {}", display_opt(&layout.shiboken_dir));
        println!("Compiler: {}", display_opt(&layout.compiler_root));
        println!("Python.h: {}", display_opt(&layout.python_include));
    }

    if strict && !report.is_ready() {
        anyhow::bail!("Preflight failed, missing: {}", report.missing().join(", "));
    }
    Ok(())
}

fn display_opt(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(not found)".to_string())
}

/// List or stop conflicting processes
async fn cmd_scan(config: &DriverConfig, kill: bool, json: bool) -> Result<()> {
    let Some(scanner) = config.scanner() else {
        anyhow::bail!("No conflict signature configured; pass --signature");
    };
    let table = SystemProcessTable;

    if kill {
        let report = scanner.reap(&table).await;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        if report.matched.is_empty() {
            println!("No conflicting processes");
            return Ok(());
        }
        for pid in &report.terminated {
            println!("✓ {} terminated", pid);
        }
        for pid in &report.killed {
            println!("✓ {} killed", pid);
        }
        for pid in &report.survivors {
            println!("✗ {} still running", pid);
        }
        return Ok(());
    }

    let found = scanner.find(&table);
    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
    } else if found.is_empty() {
        println!("No conflicting processes");
    } else {
        for entry in &found {
            println!("{:>7}  {}", entry.pid, entry.cmdline);
        }
    }
    Ok(())
}

/// Show active fix rules
fn cmd_rules(config: &DriverConfig, json: bool) -> Result<()> {
    let env = config.initial_env(EnvironmentState::from_process());
    let rules = config.rule_set(&env);

    if json {
        println!("{}", serde_json::to_string_pretty(&rules)?);
        return Ok(());
    }
    for rule in rules.iter() {
        println!("{}", rule.name);
        println!("    on:  {}", rule.signatures.join(" | "));
        println!("    fix: {}", rule.action.describe());
    }
    Ok(())
}

/// Show a stored run report
fn cmd_report(run_id: &str, dir: &Path, json: bool) -> Result<()> {
    let report = read_run_report(run_id, dir)
        .with_context(|| format!("Failed to read run report {} from {:?}", run_id, dir))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_report(&report);
    }
    Ok(())
}

fn print_run_report(report: &RunReport) {
    println!("Run:      {}", report.run_id);
    println!("Command:  {}", report.command_line);
    println!("Outcome:  {:?}", report.outcome);
    println!("Started:  {}", report.started_at);
    println!("Finished: {}", report.finished_at);
    println!();
    for record in &report.records {
        let exit = record
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  #{} exit {} in {}ms, {} fix(es)",
            record.index, exit, record.duration_ms, record.fixes_applied
        );
        for rule in &record.matched_rules {
            println!("      matched {}", rule);
        }
        for error in &record.rule_errors {
            println!("      failed  {}", error);
        }
    }
    if let Some(conflicts) = &report.conflicts {
        println!(
            "\nConflicts: {} matched, {} survived",
            conflicts.matched.len(),
            conflicts.survivors.len()
        );
    }
}
