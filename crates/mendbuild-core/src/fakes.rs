//! In-memory collaborators for tests.
//!
//! [`ScriptedExecutor`] replays canned outputs instead of spawning
//! processes; [`FakeProcessTable`] simulates a process table and records the
//! signals it receives. Both can share a [`Journal`] so tests can assert the
//! relative order of signals and attempts.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::CommandSpec;
use crate::conflict::{ProcessEntry, ProcessTable};
use crate::env::EnvironmentState;
use crate::runner::{CapturedOutput, CommandExecutor, Execution};

/// Shared, ordered record of fake side effects.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.into());
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

/// One call observed by [`ScriptedExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorCall {
    pub command: String,
    pub env: EnvironmentState,
}

/// Executor that returns scripted outputs in order.
///
/// Once the script is exhausted the last output repeats.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<VecDeque<CapturedOutput>>>,
    last: Arc<Mutex<Option<CapturedOutput>>>,
    calls: Arc<Mutex<Vec<ExecutorCall>>>,
    journal: Option<Journal>,
    cancel_on_call: Option<usize>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<CapturedOutput>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Self::default()
        }
    }

    /// Always fail with `exit_code` and `stderr`.
    pub fn always_failing(exit_code: i32, stderr: &str) -> Self {
        Self::new(vec![CapturedOutput::exited(exit_code, "", stderr)])
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Report cancellation on the given 1-based call instead of running.
    pub fn cancelling_on_call(mut self, call: usize) -> Self {
        self.cancel_on_call = Some(call);
        self
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_output(&self) -> CapturedOutput {
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let mut last = match self.last.lock() {
            Ok(last) => last,
            Err(_) => return CapturedOutput::failed("scripted executor poisoned"),
        };
        match next {
            Some(output) => {
                *last = Some(output.clone());
                output
            }
            None => last
                .clone()
                .unwrap_or_else(|| CapturedOutput::failed("empty script")),
        }
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        spec: &CommandSpec,
        env: &EnvironmentState,
        cancel: &CancellationToken,
    ) -> Execution {
        let call_number = {
            let mut calls = match self.calls.lock() {
                Ok(calls) => calls,
                Err(_) => return Execution::Cancelled,
            };
            calls.push(ExecutorCall {
                command: spec.display(),
                env: env.clone(),
            });
            calls.len()
        };
        if let Some(journal) = &self.journal {
            journal.record(format!("exec {}", spec.name));
        }
        if cancel.is_cancelled() || self.cancel_on_call == Some(call_number) {
            cancel.cancel();
            return Execution::Cancelled;
        }
        Execution::Completed(self.next_output())
    }
}

/// Simulated process table.
///
/// Processes exit on the first signal unless configured to ignore it.
#[derive(Debug, Clone, Default)]
pub struct FakeProcessTable {
    entries: Vec<ProcessEntry>,
    alive: Arc<Mutex<HashSet<u32>>>,
    ignore_term: HashSet<u32>,
    ignore_kill: HashSet<u32>,
    signals: Arc<Mutex<Vec<(u32, &'static str)>>>,
    journal: Option<Journal>,
}

impl FakeProcessTable {
    pub fn new(entries: Vec<ProcessEntry>) -> Self {
        let alive = entries.iter().map(|e| e.pid).collect();
        Self {
            entries,
            alive: Arc::new(Mutex::new(alive)),
            ..Self::default()
        }
    }

    pub fn ignoring_term(mut self, pid: u32) -> Self {
        self.ignore_term.insert(pid);
        self
    }

    pub fn ignoring_kill(mut self, pid: u32) -> Self {
        self.ignore_kill.insert(pid);
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Signals received so far, as `(pid, "TERM" | "KILL")`.
    pub fn signals(&self) -> Vec<(u32, &'static str)> {
        self.signals.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn signal(&self, pid: u32, name: &'static str, ignored: bool) -> io::Result<()> {
        self.signals
            .lock()
            .map_err(|_| io::Error::other("signals lock poisoned"))?
            .push((pid, name));
        if let Some(journal) = &self.journal {
            journal.record(format!("signal {} {}", name, pid));
        }
        if !ignored {
            self.alive
                .lock()
                .map_err(|_| io::Error::other("alive lock poisoned"))?
                .remove(&pid);
        }
        Ok(())
    }
}

impl ProcessTable for FakeProcessTable {
    fn list(&self) -> Vec<ProcessEntry> {
        let alive = self.alive.lock().map(|a| a.clone()).unwrap_or_default();
        self.entries
            .iter()
            .filter(|e| alive.contains(&e.pid))
            .cloned()
            .collect()
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        self.signal(pid, "TERM", self.ignore_term.contains(&pid))
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        self.signal(pid, "KILL", self.ignore_kill.contains(&pid))
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive
            .lock()
            .map(|a| a.contains(&pid))
            .unwrap_or(false)
    }
}
