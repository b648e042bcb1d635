//! Prerequisite checks run before a build.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::env::EnvironmentState;

/// Resolution of one required tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCheck {
    pub name: String,

    /// Where the tool resolved on the environment's PATH.
    pub resolved: Option<PathBuf>,
}

/// Presence of one required file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCheck {
    pub path: PathBuf,
    pub exists: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub tools: Vec<ToolCheck>,
    pub paths: Vec<PathCheck>,
}

impl PreflightReport {
    pub fn run(tools: &[String], paths: &[PathBuf], env: &EnvironmentState) -> Self {
        Self {
            tools: check_tools(tools, env),
            paths: check_paths(paths),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.tools.iter().all(|t| t.resolved.is_some()) && self.paths.iter().all(|p| p.exists)
    }

    /// Names of missing tools followed by missing paths.
    pub fn missing(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|t| t.resolved.is_none())
            .map(|t| t.name.clone())
            .chain(
                self.paths
                    .iter()
                    .filter(|p| !p.exists)
                    .map(|p| p.path.display().to_string()),
            )
            .collect()
    }
}

/// Resolve each tool on `env`'s PATH, not the host's.
pub fn check_tools(names: &[String], env: &EnvironmentState) -> Vec<ToolCheck> {
    let search = env.get("PATH").unwrap_or_default();
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

    names
        .iter()
        .map(|name| {
            let resolved = which::which_in(name, Some(search), &cwd).ok();
            match &resolved {
                Some(path) => debug!(tool = %name, path = %path.display(), "Tool found"),
                None => warn!(tool = %name, "Required tool not found on PATH"),
            }
            ToolCheck {
                name: name.clone(),
                resolved,
            }
        })
        .collect()
}

pub fn check_paths(paths: &[PathBuf]) -> Vec<PathCheck> {
    paths
        .iter()
        .map(|path| {
            let exists = path.exists();
            if !exists {
                warn!(path = %path.display(), "Required path missing");
            }
            PathCheck {
                path: path.clone(),
                exists,
            }
        })
        .collect()
}
