//! Pre-attempt cleanup of conflicting build processes.
//!
//! Before the first attempt the driver looks for a previous build of the
//! same target that is still running and stops it, so two builds never race
//! on one output directory.
//!
//! # Strategy
//! 1. List processes and match their command lines against the signature
//! 2. Send SIGTERM to each match (never to our own pid or its ancestors)
//! 3. Poll until exit, up to the grace timeout
//! 4. If still alive, send SIGKILL and poll again up to the same timeout
//! 5. Anything still alive is reported as a survivor (warning, not fatal)

use std::collections::{HashMap, HashSet};
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// One row of the host process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub cmdline: String,

    /// Parent pid, when the platform reports one.
    #[serde(default)]
    pub parent: Option<u32>,
}

/// Read and signal access to the host process table.
pub trait ProcessTable: Send + Sync {
    fn list(&self) -> Vec<ProcessEntry>;

    /// Request graceful termination. `Ok` if the process is already gone.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Force termination. `Ok` if the process is already gone.
    fn kill(&self, pid: u32) -> io::Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Command-line terms identifying a build of the same target.
///
/// A process conflicts when its command line contains every term,
/// ignoring case. An empty signature matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictSignature {
    terms: Vec<String>,
}

impl ConflictSignature {
    pub fn new<S: Into<String>>(terms: impl IntoIterator<Item = S>) -> Self {
        Self {
            terms: terms
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.trim().is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    pub fn matches(&self, cmdline: &str) -> bool {
        if self.terms.is_empty() {
            return false;
        }
        let cmdline = cmdline.to_lowercase();
        self.terms
            .iter()
            .all(|t| cmdline.contains(&t.to_lowercase()))
    }
}

/// What the scan found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    pub matched: Vec<ProcessEntry>,

    /// Exited after the graceful signal.
    pub terminated: Vec<u32>,

    /// Exited only after the forced signal.
    pub killed: Vec<u32>,

    /// Still alive after both signals and timeouts.
    pub survivors: Vec<u32>,
}

impl ReapReport {
    pub fn is_clean(&self) -> bool {
        self.survivors.is_empty()
    }
}

/// Finds and stops conflicting processes.
#[derive(Debug, Clone)]
pub struct ConflictScanner {
    pub signature: ConflictSignature,

    /// Wait after each signal before escalating or giving up.
    pub grace: Duration,

    pub poll_interval: Duration,

    /// Never signalled, nor are its ancestors; defaults to the current
    /// process.
    pub own_pid: u32,
}

impl ConflictScanner {
    pub fn new(signature: ConflictSignature) -> Self {
        Self {
            signature,
            grace: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            own_pid: std::process::id(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Processes whose command line matches the signature.
    ///
    /// The driver and every process above it are excluded: whatever
    /// launched the driver carries the build command line too.
    pub fn find(&self, table: &dyn ProcessTable) -> Vec<ProcessEntry> {
        let entries = table.list();
        let lineage = lineage(&entries, self.own_pid);
        entries
            .into_iter()
            .filter(|p| !lineage.contains(&p.pid) && self.signature.matches(&p.cmdline))
            .collect()
    }

    /// Stop every conflicting process. Always runs to completion.
    pub async fn reap(&self, table: &dyn ProcessTable) -> ReapReport {
        let mut report = ReapReport {
            matched: self.find(table),
            ..ReapReport::default()
        };

        if report.matched.is_empty() {
            debug!("No conflicting build processes found");
            return report;
        }

        info!(
            count = report.matched.len(),
            "Found conflicting build processes, terminating"
        );

        for entry in &report.matched {
            let pid = entry.pid;
            debug!(pid, cmdline = %entry.cmdline, "Sending graceful termination");

            match table.terminate(pid) {
                Ok(()) => {
                    if self.wait_for_exit(table, pid).await {
                        report.terminated.push(pid);
                        continue;
                    }
                }
                Err(e) => {
                    warn!(pid, error = %e, "Graceful termination failed, escalating");
                }
            }

            if let Err(e) = table.kill(pid) {
                warn!(pid, error = %e, "Forced termination failed");
            }
            if self.wait_for_exit(table, pid).await {
                report.killed.push(pid);
            } else {
                warn!(pid, "Conflicting process did not exit; proceeding anyway");
                report.survivors.push(pid);
            }
        }

        report
    }

    async fn wait_for_exit(&self, table: &dyn ProcessTable, pid: u32) -> bool {
        let deadline = Instant::now() + self.grace;
        loop {
            if !table.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.poll_interval).await;
        }
    }
}

/// `pid` and its ancestors as far as `entries` knows them.
fn lineage(entries: &[ProcessEntry], pid: u32) -> HashSet<u32> {
    let parents: HashMap<u32, u32> = entries
        .iter()
        .filter_map(|e| e.parent.map(|parent| (e.pid, parent)))
        .collect();

    let mut chain = HashSet::new();
    let mut current = Some(pid);
    while let Some(pid) = current {
        if !chain.insert(pid) {
            break;
        }
        current = parents.get(&pid).copied();
    }
    chain
}

/// Host process table backed by `sysinfo` and Unix signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn list(&self) -> Vec<ProcessEntry> {
        use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );

        // Entries with an empty command line (kernel threads, zombies) are
        // kept so the parent chain stays intact; they never match.
        let mut entries: Vec<ProcessEntry> = system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                cmdline: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" "),
                parent: process.parent().map(|p| p.as_u32()),
            })
            .collect();
        entries.sort_by_key(|e| e.pid);
        entries
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        #[cfg(unix)]
        {
            send_signal(pid, nix::sys::signal::Signal::SIGTERM)
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "process termination not implemented on this platform",
            ))
        }
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        #[cfg(unix)]
        {
            send_signal(pid, nix::sys::signal::Signal::SIGKILL)
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "process termination not implemented on this platform",
            ))
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal;
            use nix::unistd::Pid;

            // Null signal only checks whether the pid can be signalled.
            match signal::kill(Pid::from_raw(pid as i32), None) {
                Ok(_) => !is_zombie(pid),
                Err(Errno::ESRCH) => false,
                Err(_) => true,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            false
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: nix::sys::signal::Signal) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::other(e)),
    }
}

/// An exited child that has not been reaped yet still answers the null
/// signal; treat it as gone.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // Field 3 follows the parenthesised command name, which may contain spaces.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}
