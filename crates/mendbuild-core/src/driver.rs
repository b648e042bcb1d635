//! Build-attempt driver: run, classify, fix, retry.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::budget::RetryBudget;
use crate::command::{BuildPlan, CommandSpec};
use crate::conflict::{ConflictScanner, ProcessTable, ReapReport, SystemProcessTable};
use crate::env::EnvironmentState;
use crate::error::{DriverError, Result};
use crate::report::{output_tail, AttemptRecord, PlanReport, RunOutcome, RunReport};
use crate::rules::RuleSet;
use crate::runner::{run_attempt, CommandExecutor, ProcessExecutor};
use crate::sink::{LogSink, NullSink, SinkWriter};

/// Runs a build command with bounded, self-repairing retries.
///
/// The driver owns no environment of its own: each run takes an
/// [`EnvironmentState`] by value, mutates it through fix rules, and hands
/// the final state back in the [`RunReport`].
pub struct BuildDriver {
    executor: Arc<dyn CommandExecutor>,
    process_table: Arc<dyn ProcessTable>,
    scanner: Option<ConflictScanner>,
    rules: RuleSet,
    budget: RetryBudget,
    sink: SinkWriter,
}

impl Default for BuildDriver {
    fn default() -> Self {
        Self::new(Arc::new(ProcessExecutor))
    }
}

impl BuildDriver {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            process_table: Arc::new(SystemProcessTable),
            scanner: None,
            rules: RuleSet::default(),
            budget: RetryBudget::default(),
            sink: SinkWriter::new(Arc::new(NullSink)),
        }
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    /// Delay schedule; `max_attempts` here is the default for [`run_plan`].
    ///
    /// [`run_plan`]: BuildDriver::run_plan
    pub fn with_budget(mut self, budget: RetryBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_conflict_scanner(mut self, scanner: ConflictScanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_process_table(mut self, table: Arc<dyn ProcessTable>) -> Self {
        self.process_table = table;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = SinkWriter::new(sink);
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    /// Run `command` up to `max_attempts` times.
    ///
    /// Returns `Ok` for both success and exhaustion (see
    /// [`RunReport::into_result`]); `Err` only for invalid input or
    /// cancellation.
    pub async fn run_with_retry(
        &self,
        command: &CommandSpec,
        env: EnvironmentState,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        command.validate()?;
        let budget = RetryBudget {
            max_attempts,
            ..self.budget
        };
        budget.validate()?;

        let conflicts = self.clear_conflicts().await;
        self.attempt_loop(command, env, budget, conflicts, cancel).await
    }

    /// Run each step of `plan` until one succeeds.
    ///
    /// The environment carries over between steps and the conflict scan
    /// runs once, before the first step.
    pub async fn run_plan(
        &self,
        plan: &BuildPlan,
        env: EnvironmentState,
        cancel: &CancellationToken,
    ) -> Result<PlanReport> {
        plan.validate()?;
        self.budget.validate()?;

        let mut conflicts = self.clear_conflicts().await;
        let mut env = env;
        let mut steps = Vec::with_capacity(plan.steps.len());

        for (i, step) in plan.steps.iter().enumerate() {
            if i > 0 {
                self.sink.event(&format!(
                    "falling back to step {}/{}: {}",
                    i + 1,
                    plan.steps.len(),
                    step.name
                ));
                info!(step = %step.name, "Trying fallback build step");
            }
            let report = self
                .attempt_loop(step, env, self.budget, conflicts.take(), cancel)
                .await?;
            env = report.final_env.clone();
            let done = report.succeeded();
            steps.push(report);
            if done {
                break;
            }
        }

        Ok(PlanReport { steps })
    }

    async fn clear_conflicts(&self) -> Option<ReapReport> {
        let scanner = self.scanner.as_ref().filter(|s| !s.signature.is_empty())?;
        let report = scanner.reap(self.process_table.as_ref()).await;

        if !report.matched.is_empty() {
            self.sink.event(&format!(
                "conflict scan: {} matched, {} terminated, {} killed, {} survived",
                report.matched.len(),
                report.terminated.len(),
                report.killed.len(),
                report.survivors.len()
            ));
        }
        for pid in &report.survivors {
            warn!(pid, "Conflicting build process survived termination");
            self.sink
                .event(&format!("warning: conflicting process {} still running", pid));
        }
        Some(report)
    }

    async fn attempt_loop(
        &self,
        command: &CommandSpec,
        env: EnvironmentState,
        budget: RetryBudget,
        conflicts: Option<ReapReport>,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("mendbuild.run", run_id = %run_id, command = %command.name);
        self.attempt_loop_inner(run_id, command, env, budget, conflicts, cancel)
            .instrument(span)
            .await
    }

    async fn attempt_loop_inner(
        &self,
        run_id: String,
        command: &CommandSpec,
        mut env: EnvironmentState,
        budget: RetryBudget,
        conflicts: Option<ReapReport>,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let max = budget.max_attempts;
        let mut records: Vec<AttemptRecord> = Vec::new();
        let mut fixes_total = 0u32;
        let mut last_output = String::new();

        self.sink.event(&format!(
            "run {} started: {} (up to {} attempts)",
            run_id,
            command.display(),
            max
        ));

        for attempt in 1..=max {
            if cancel.is_cancelled() {
                return Err(self.cancelled(attempt - 1));
            }

            info!(attempt, max_attempts = max, "Starting build attempt");
            self.sink
                .event(&format!("attempt {}/{} started", attempt, max));

            let Some(result) =
                run_attempt(self.executor.as_ref(), attempt, command, &env, cancel).await
            else {
                return Err(self.cancelled(attempt));
            };

            if result.succeeded() {
                info!(attempt, duration_ms = result.duration_ms, "Build attempt succeeded");
                self.sink
                    .event(&format!("attempt {}/{} succeeded", attempt, max));
                records.push(AttemptRecord {
                    index: attempt,
                    exit_code: result.exit_code,
                    duration_ms: result.duration_ms,
                    matched_rules: Vec::new(),
                    fixes_applied: 0,
                    rule_errors: Vec::new(),
                    delay_ms: None,
                });
                last_output = output_tail(&result.output());
                return Ok(self.finish(
                    run_id,
                    command,
                    RunOutcome::Succeeded,
                    records,
                    fixes_total,
                    last_output,
                    conflicts,
                    env,
                    started_at,
                ));
            }

            // Full output goes to the sink; the report keeps only a tail.
            let output = result.output();
            for line in output.lines() {
                self.sink.event(&format!("attempt {} | {}", attempt, line));
            }
            let applications = self.rules.apply_matching(&output, &mut env);

            let mut matched_rules = Vec::with_capacity(applications.len());
            let mut rule_errors = Vec::new();
            let mut fixes = 0u32;
            for app in &applications {
                matched_rules.push(app.rule.clone());
                match &app.error {
                    None => {
                        fixes += 1;
                        self.sink.event(&format!(
                            "attempt {}: rule {} matched, fix applied{}",
                            attempt,
                            app.rule,
                            if app.changed { "" } else { " (already in effect)" }
                        ));
                    }
                    Some(e) => {
                        warn!(rule = %app.rule, error = %e, "Fix rule matched but could not be applied");
                        self.sink.event(&format!(
                            "attempt {}: rule {} matched but failed: {}",
                            attempt, app.rule, e
                        ));
                        rule_errors.push(format!("{}: {}", app.rule, e));
                    }
                }
            }
            fixes_total += fixes;

            info!(
                attempt,
                exit_code = ?result.exit_code,
                matched = applications.len(),
                fixes,
                "Build attempt failed"
            );
            if applications.is_empty() {
                self.sink.event(&format!(
                    "attempt {}/{} failed (exit {}): no rule matched",
                    attempt,
                    max,
                    exit_label(result.exit_code)
                ));
            } else {
                self.sink.event(&format!(
                    "attempt {}/{} failed (exit {}): {} fix(es) applied",
                    attempt,
                    max,
                    exit_label(result.exit_code),
                    fixes
                ));
            }

            let delay = (attempt < max).then(|| budget.delay_after(attempt, fixes));
            records.push(AttemptRecord {
                index: attempt,
                exit_code: result.exit_code,
                duration_ms: result.duration_ms,
                matched_rules,
                fixes_applied: fixes,
                rule_errors,
                delay_ms: delay.map(|d| d.as_millis() as u64),
            });
            last_output = output_tail(&output);

            if let Some(delay) = delay {
                self.sink.event(&format!(
                    "waiting {}ms before attempt {}",
                    delay.as_millis(),
                    attempt + 1
                ));
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(self.cancelled(attempt)),
                    _ = sleep(delay) => {}
                }
            }
        }

        warn!(attempts = max, fixes = fixes_total, "Build attempts exhausted");
        self.sink.event(&format!(
            "run {} exhausted after {} attempts ({} fixes applied)",
            run_id, max, fixes_total
        ));
        Ok(self.finish(
            run_id,
            command,
            RunOutcome::Exhausted,
            records,
            fixes_total,
            last_output,
            conflicts,
            env,
            started_at,
        ))
    }

    fn cancelled(&self, attempts: u32) -> DriverError {
        warn!(attempts, "Build run cancelled");
        self.sink
            .event(&format!("run cancelled after {} attempt(s)", attempts));
        DriverError::Cancelled { attempts }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        run_id: String,
        command: &CommandSpec,
        outcome: RunOutcome,
        records: Vec<AttemptRecord>,
        fixes_applied: u32,
        last_output: String,
        conflicts: Option<ReapReport>,
        final_env: EnvironmentState,
        started_at: chrono::DateTime<Utc>,
    ) -> RunReport {
        RunReport {
            run_id,
            command: command.name.clone(),
            command_line: command.display(),
            outcome,
            attempts: records.len() as u32,
            fixes_applied,
            last_output,
            records,
            conflicts,
            final_env,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

fn exit_label(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}
