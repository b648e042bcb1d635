//! Run reports and their on-disk artifacts.
//!
//! Persisted as `<dir>/<run_id>/report.json` plus
//! `<dir>/<run_id>/report.digest` (SHA-256 of the JSON bytes) so a stored
//! report can be checked for tampering before it is trusted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::conflict::ReapReport;
use crate::env::EnvironmentState;
use crate::error::{DriverError, Result};

/// Lines of the last attempt's output kept in a [`RunReport`].
pub const OUTPUT_TAIL_LINES: usize = 200;

/// Byte ceiling on that tail, for builds that print very long lines.
pub const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// The end of `text`: at most [`OUTPUT_TAIL_BYTES`] bytes and
/// [`OUTPUT_TAIL_LINES`] lines.
pub fn output_tail(text: &str) -> String {
    let mut start = text.len().saturating_sub(OUTPUT_TAIL_BYTES);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let text = &text[start..];

    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..].join("\n")
}

/// Final state of a driver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Exhausted,
}

/// Summary of one attempt kept after its output is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub index: u32,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,

    /// Rules whose signature matched the attempt's output.
    pub matched_rules: Vec<String>,

    /// Matched rules whose action applied successfully.
    pub fixes_applied: u32,

    /// `rule: error` for matched rules whose action failed.
    pub rule_errors: Vec<String>,

    /// Wait before the next attempt; `None` after the last one.
    pub delay_ms: Option<u64>,
}

/// Result of one `run_with_retry` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub command: String,
    pub command_line: String,
    pub outcome: RunOutcome,
    pub attempts: u32,
    pub fixes_applied: u32,

    /// Tail of the last attempt's combined output (see [`output_tail`]).
    /// The full text of every failed attempt goes to the log sink.
    pub last_output: String,

    pub records: Vec<AttemptRecord>,

    /// Conflicting processes handled before the first attempt.
    pub conflicts: Option<ReapReport>,

    /// Environment after all fixes, as seen by the last attempt's successor.
    pub final_env: EnvironmentState,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    /// Delays actually scheduled between attempts, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.records
            .iter()
            .filter_map(|r| r.delay_ms.map(Duration::from_millis))
            .collect()
    }

    /// Turn an exhausted run into [`DriverError::Exhausted`].
    pub fn into_result(self) -> Result<RunReport> {
        match self.outcome {
            RunOutcome::Succeeded => Ok(self),
            RunOutcome::Exhausted => Err(DriverError::Exhausted {
                attempts: self.attempts,
                fixes_applied: self.fixes_applied,
                last_output: self.last_output,
            }),
        }
    }
}

/// Reports of every step a build plan ran, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReport {
    pub steps: Vec<RunReport>,
}

impl PlanReport {
    pub fn succeeded(&self) -> bool {
        self.last().is_some_and(RunReport::succeeded)
    }

    pub fn last(&self) -> Option<&RunReport> {
        self.steps.last()
    }

    pub fn total_attempts(&self) -> u32 {
        self.steps.iter().map(|s| s.attempts).sum()
    }

    pub fn total_fixes(&self) -> u32 {
        self.steps.iter().map(|s| s.fixes_applied).sum()
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Persist `<dir>/<run_id>/report.json` and `<dir>/<run_id>/report.digest`.
pub fn write_run_report(report: &RunReport, dir: &Path) -> Result<PathBuf> {
    let run_dir = dir.join(&report.run_id);
    std::fs::create_dir_all(&run_dir)?;

    let report_path = run_dir.join("report.json");
    let digest_path = run_dir.join("report.digest");
    let json = serde_json::to_vec_pretty(report)?;

    std::fs::write(&report_path, &json)?;
    std::fs::write(&digest_path, digest_hex(&json).as_bytes())?;

    Ok(report_path)
}

/// Read `<dir>/<run_id>/report.json` and verify it against its digest.
pub fn read_run_report(run_id: &str, dir: &Path) -> Result<RunReport> {
    let run_dir = dir.join(run_id);
    let json = std::fs::read(run_dir.join("report.json"))?;
    let expected = std::fs::read_to_string(run_dir.join("report.digest"))?;
    let actual = digest_hex(&json);
    if expected.trim() != actual {
        return Err(DriverError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }

    Ok(serde_json::from_slice(&json)?)
}
