//! Owned environment state for one driver run.
//!
//! The driver never touches the host process environment. A run starts from
//! a snapshot ([`EnvironmentState::from_process`]) or an explicit map, fix
//! rules mutate it additively, and the child process receives exactly these
//! variables.

use std::collections::BTreeMap;
use std::ffi::OsString;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Separator between entries of a search-path variable.
#[cfg(unix)]
pub const PATH_SEPARATOR: char = ':';
#[cfg(not(unix))]
pub const PATH_SEPARATOR: char = ';';

/// Mapping of variable name to value visible to the build command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentState {
    vars: BTreeMap<String, String>,
}

impl EnvironmentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current process environment.
    ///
    /// Variables that are not valid unicode are skipped with a warning.
    pub fn from_process() -> Self {
        Self::from_os_vars(std::env::vars_os())
    }

    /// Build a state from raw OS pairs, skipping (and logging) any name or
    /// value that is not valid unicode.
    pub fn from_os_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut state = Self::new();
        for (name, value) in vars {
            match (name.into_string(), value.into_string()) {
                (Ok(name), Ok(value)) => {
                    state.vars.insert(name, value);
                }
                (Ok(name), Err(_)) => {
                    warn!(var = %name, "skipping environment variable with non-unicode value");
                }
                (Err(name), _) => {
                    warn!(
                        var = %name.to_string_lossy(),
                        "skipping environment variable with non-unicode name"
                    );
                }
            }
        }
        state
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, var: &str) -> Option<&str> {
        self.vars.get(var).map(String::as_str)
    }

    pub fn contains(&self, var: &str) -> bool {
        self.vars.contains_key(var)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Set `var` to `value`. Returns whether the state changed.
    pub fn set(&mut self, var: impl Into<String>, value: impl Into<String>) -> bool {
        let value = value.into();
        match self.vars.insert(var.into(), value.clone()) {
            Some(previous) => previous != value,
            None => true,
        }
    }

    /// Set `var` only when it is not already present.
    pub fn set_if_absent(&mut self, var: &str, value: &str) -> bool {
        if self.vars.contains_key(var) {
            return false;
        }
        self.vars.insert(var.to_string(), value.to_string());
        true
    }

    /// Non-empty entries of a search-path variable, in order.
    pub fn path_entries(&self, var: &str) -> Vec<&str> {
        self.get(var)
            .map(|v| v.split(PATH_SEPARATOR).filter(|e| !e.is_empty()).collect())
            .unwrap_or_default()
    }

    /// Prepend `entries` to a search-path variable, preserving their order.
    ///
    /// Entries already present elsewhere in the variable move to the front,
    /// so the fix takes precedence. Returns whether the state changed.
    pub fn prepend_path<S: AsRef<str>>(&mut self, var: &str, entries: &[S]) -> bool {
        let mut front: Vec<&str> = Vec::new();
        for entry in entries {
            let entry = entry.as_ref();
            if !entry.is_empty() && !front.contains(&entry) {
                front.push(entry);
            }
        }
        if front.is_empty() {
            return false;
        }

        let current = self.path_entries(var);
        let updated: Vec<String> = front
            .iter()
            .copied()
            .chain(current.iter().copied().filter(|e| !front.contains(e)))
            .map(str::to_string)
            .collect();
        if self.contains(var) && updated.iter().map(String::as_str).eq(current.iter().copied()) {
            return false;
        }
        self.write_path(var, updated);
        true
    }

    /// Append `entries` to a search-path variable, skipping ones already present.
    pub fn append_path<S: AsRef<str>>(&mut self, var: &str, entries: &[S]) -> bool {
        let mut current: Vec<String> = self
            .path_entries(var)
            .into_iter()
            .map(str::to_string)
            .collect();
        let before = current.len();
        for entry in entries {
            let entry = entry.as_ref();
            if !entry.is_empty() && !current.iter().any(|e| e == entry) {
                current.push(entry.to_string());
            }
        }
        if current.len() == before {
            return false;
        }
        self.write_path(var, current);
        true
    }

    /// Remove a variable. Only used while preparing the initial environment.
    pub fn remove(&mut self, var: &str) -> Option<String> {
        self.vars.remove(var)
    }

    /// Drop search-path entries starting with any of `prefixes`.
    ///
    /// Returns the number of entries removed. Only used while preparing the
    /// initial environment.
    pub fn strip_path_entries<S: AsRef<str>>(&mut self, var: &str, prefixes: &[S]) -> usize {
        let entries: Vec<String> = self
            .path_entries(var)
            .into_iter()
            .map(str::to_string)
            .collect();
        let before = entries.len();
        let kept: Vec<String> = entries
            .into_iter()
            .filter(|e| !prefixes.iter().any(|p| e.starts_with(p.as_ref())))
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write_path(var, kept);
        }
        removed
    }

    fn write_path(&mut self, var: &str, entries: Vec<String>) {
        let sep = PATH_SEPARATOR.to_string();
        self.vars.insert(var.to_string(), entries.join(&sep));
    }
}

/// Initial environment preparation applied once before a run.
///
/// Unlike fix rules this may remove state: it strips host entries that
/// would shadow the managed toolchain (system Qt libraries, foreign compiler
/// toolsets) and unsets variables that confuse the upstream build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvProfile {
    /// Variables to remove.
    pub unset: Vec<String>,

    /// Search-path variable -> entry prefixes to strip.
    pub strip_prefixes: BTreeMap<String, Vec<String>>,

    /// Variables to set unconditionally.
    pub set: BTreeMap<String, String>,

    /// Search-path variable -> entries to prepend.
    pub prepend: BTreeMap<String, Vec<String>>,
}

impl EnvProfile {
    /// Apply the profile in a fixed order: unset, strip, set, prepend.
    pub fn apply(&self, env: &mut EnvironmentState) {
        for var in &self.unset {
            env.remove(var);
        }
        for (var, prefixes) in &self.strip_prefixes {
            env.strip_path_entries(var, prefixes);
        }
        for (var, value) in &self.set {
            env.set(var.as_str(), value.as_str());
        }
        for (var, entries) in &self.prepend {
            env.prepend_path(var, entries);
        }
    }
}
