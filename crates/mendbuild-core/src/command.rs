//! Build command and fallback plan definitions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// An external build command (argument vector) with execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Human-readable command name used in logs and reports.
    pub name: String,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    /// Working directory; inherits the driver's when unset.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Timeout in seconds (0 = no timeout).
    #[serde(default)]
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            cwd: None,
            timeout_secs: 0,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn validate(&self) -> Result<(), DriverError> {
        match self.command.first() {
            Some(program) if !program.trim().is_empty() => Ok(()),
            _ => Err(DriverError::EmptyCommand),
        }
    }

    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or(&[])
    }

    /// Same program, cwd and timeout with a different argument list.
    pub fn variant(&self, name: impl Into<String>, args: Vec<String>) -> Self {
        let mut command = Vec::with_capacity(args.len() + 1);
        command.extend(self.command.first().cloned());
        command.extend(args);
        Self {
            name: name.into(),
            command,
            cwd: self.cwd.clone(),
            timeout_secs: self.timeout_secs,
        }
    }

    /// Shell-like rendering for log lines.
    pub fn display(&self) -> String {
        self.command.join(" ")
    }
}

/// Ordered fallback steps tried until one succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub steps: Vec<CommandSpec>,
}

impl BuildPlan {
    pub fn single(command: CommandSpec) -> Self {
        Self {
            steps: vec![command],
        }
    }

    /// Primary command followed by argument variants of it.
    pub fn with_fallbacks(primary: CommandSpec, fallbacks: Vec<(String, Vec<String>)>) -> Self {
        let variants: Vec<CommandSpec> = fallbacks
            .into_iter()
            .map(|(name, args)| primary.variant(name, args))
            .collect();
        let mut steps = Vec::with_capacity(variants.len() + 1);
        steps.push(primary);
        steps.extend(variants);
        Self { steps }
    }

    pub fn validate(&self) -> Result<(), DriverError> {
        if self.steps.is_empty() {
            return Err(DriverError::EmptyPlan);
        }
        self.steps.iter().try_for_each(CommandSpec::validate)
    }
}
