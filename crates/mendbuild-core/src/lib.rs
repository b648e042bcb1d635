//! mendbuild - self-repairing build driver
//!
//! Runs an external build command with a bounded number of attempts. After
//! each failure the captured output is matched against [`FixRule`]s whose
//! actions repair an owned [`EnvironmentState`] before the next attempt.
//! Conflicting build processes are terminated before the first attempt.
//!
//! ```no_run
//! # async fn demo() -> mendbuild_core::Result<()> {
//! use mendbuild_core::{BuildDriver, CommandSpec, EnvironmentState};
//! use tokio_util::sync::CancellationToken;
//!
//! let command = CommandSpec::new("make", vec!["make".into(), "all".into()]);
//! let report = BuildDriver::default()
//!     .run_with_retry(&command, EnvironmentState::from_process(), 3, &CancellationToken::new())
//!     .await?
//!     .into_result()?;
//! println!("built after {} attempt(s)", report.attempts);
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod command;
pub mod config;
pub mod conflict;
pub mod driver;
pub mod env;
pub mod error;
pub mod fakes;
pub mod preflight;
pub mod report;
pub mod rules;
pub mod runner;
pub mod sink;
pub mod telemetry;
pub mod toolchain;

pub use budget::RetryBudget;
pub use command::{BuildPlan, CommandSpec};
pub use config::DriverConfig;
pub use conflict::{
    ConflictScanner, ConflictSignature, ProcessEntry, ProcessTable, ReapReport, SystemProcessTable,
};
pub use driver::BuildDriver;
pub use env::{EnvProfile, EnvironmentState};
pub use error::{ConfigError, DriverError, FixError, Result};
pub use preflight::PreflightReport;
pub use report::{
    output_tail, read_run_report, write_run_report, AttemptRecord, PlanReport, RunOutcome, RunReport,
    OUTPUT_TAIL_LINES,
};
pub use rules::{FixAction, FixRule, RuleApplication, RuleSet};
pub use runner::{BuildAttempt, CapturedOutput, CommandExecutor, Execution, ProcessExecutor};
pub use sink::{FileSink, LogSink, MemorySink, NullSink};
pub use telemetry::init_tracing;
pub use toolchain::{builtin_rules, ToolchainLayout};
