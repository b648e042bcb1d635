//! Toolchain discovery and the built-in repair rules derived from it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::env::EnvironmentState;
use crate::rules::{FixAction, FixRule, RuleSet};

/// Where the managed toolchain lives.
///
/// Explicit values come from the `[toolchain]` config section; anything left
/// unset is filled in by [`ToolchainLayout::discover`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainLayout {
    /// Qt install prefix (contains `bin/qmake`).
    pub qt_dir: Option<PathBuf>,

    /// Shiboken install prefix (contains `bin/shiboken6`).
    pub shiboken_dir: Option<PathBuf>,

    /// Compiler install prefix (contains `bin/gcc` and `lib/gcc/<triple>/<version>`).
    pub compiler_root: Option<PathBuf>,

    /// Directory holding `Python.h`.
    pub python_include: Option<PathBuf>,

    pub extra_include_dirs: Vec<PathBuf>,
    pub extra_lib_dirs: Vec<PathBuf>,
    pub extra_prefix_dirs: Vec<PathBuf>,
}

impl ToolchainLayout {
    /// Discover the toolchain from `env` alone.
    pub fn discover(env: &EnvironmentState) -> Self {
        let layout = Self {
            qt_dir: var_dir(env, "QT_DIR").or_else(|| tool_prefix(env, "qmake")),
            shiboken_dir: var_dir(env, "SHIBOKEN_DIR").or_else(|| tool_prefix(env, "shiboken6")),
            compiler_root: env
                .get("CC")
                .filter(|cc| Path::new(cc).is_absolute())
                .and_then(|cc| prefix_of(Path::new(cc)))
                .or_else(|| tool_prefix(env, "gcc")),
            python_include: var_dir(env, "PYTHON_INCLUDE")
                .or_else(|| tool_prefix(env, "python3").and_then(|p| python_include_under(&p))),
            ..Self::default()
        };
        debug!(?layout, "Discovered toolchain layout");
        layout
    }

    /// Fill unset fields from discovery over `env`. Explicit values win.
    pub fn resolve(self, env: &EnvironmentState) -> Self {
        let found = Self::discover(env);
        Self {
            qt_dir: self.qt_dir.or(found.qt_dir),
            shiboken_dir: self.shiboken_dir.or(found.shiboken_dir),
            compiler_root: self.compiler_root.or(found.compiler_root),
            python_include: self.python_include.or(found.python_include),
            ..self
        }
    }

    /// C/C++ header directories: compiler built-ins first, then extras.
    pub fn header_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(root) = &self.compiler_root {
            dirs.extend(compiler_include_dirs(root));
        }
        dirs.extend(self.extra_include_dirs.iter().cloned());
        dirs
    }

    pub fn lib_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for prefix in [&self.qt_dir, &self.shiboken_dir].into_iter().flatten() {
            dirs.push(prefix.join("lib"));
        }
        if let Some(root) = &self.compiler_root {
            dirs.push(root.join("lib64"));
        }
        dirs.extend(self.extra_lib_dirs.iter().cloned());
        dirs
    }

    pub fn prefix_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = [&self.qt_dir, &self.shiboken_dir]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        dirs.extend(self.extra_prefix_dirs.iter().cloned());
        dirs
    }
}

fn var_dir(env: &EnvironmentState, var: &str) -> Option<PathBuf> {
    env.get(var).filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// `<prefix>` for a tool found at `<prefix>/bin/<tool>` on the env's PATH.
fn tool_prefix(env: &EnvironmentState, tool: &str) -> Option<PathBuf> {
    let path = env.get("PATH")?;
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let found = which::which_in(tool, Some(path), cwd).ok()?;
    prefix_of(&found)
}

fn prefix_of(binary: &Path) -> Option<PathBuf> {
    binary.parent()?.parent().map(Path::to_path_buf)
}

fn python_include_under(prefix: &Path) -> Option<PathBuf> {
    let include = prefix.join("include");
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(&include)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("python3"))
                && p.join("Python.h").is_file()
        })
        .collect();
    candidates.sort();
    candidates.pop()
}

/// Built-in header directories of a GCC-style install prefix.
///
/// Looks for `lib/gcc/<triple>/<version>/{include,include-fixed}` and
/// `include/c++/<version>` with its `<triple>` and `backward` subdirs.
/// Only existing directories are returned.
pub fn compiler_include_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut triples = Vec::new();

    for triple_dir in sorted_subdirs(&root.join("lib").join("gcc")) {
        for version_dir in sorted_subdirs(&triple_dir) {
            for leaf in ["include", "include-fixed"] {
                let dir = version_dir.join(leaf);
                if dir.is_dir() {
                    dirs.push(dir);
                }
            }
        }
        if let Some(name) = triple_dir.file_name() {
            triples.push(name.to_os_string());
        }
    }

    for cxx in sorted_subdirs(&root.join("include").join("c++")) {
        dirs.push(cxx.clone());
        for triple in &triples {
            let dir = cxx.join(triple);
            if dir.is_dir() {
                dirs.push(dir);
            }
        }
        let backward = cxx.join("backward");
        if backward.is_dir() {
            dirs.push(backward);
        }
    }
    dirs
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let mut subdirs: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => return Vec::new(),
    };
    subdirs.sort();
    subdirs
}

fn strings(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

const MISSING_STD_HEADER: &[&str] = &[
    "stdbool.h: No such file",
    "stdlib.h: No such file",
    "stddef.h: No such file",
    "stdarg.h: No such file",
];

/// Repair rules for the failures this toolchain is known to produce.
///
/// Rules whose fix would have nothing to add for `layout` are omitted.
/// The busy-file rule is always present.
pub fn builtin_rules(layout: &ToolchainLayout) -> RuleSet {
    let mut rules = Vec::new();

    let headers = strings(&layout.header_dirs());
    if !headers.is_empty() {
        for var in ["C_INCLUDE_PATH", "CPLUS_INCLUDE_PATH", "CPATH"] {
            rules.push(FixRule::new(
                format!("std-headers:{}", var),
                MISSING_STD_HEADER,
                FixAction::PrependPath {
                    var: var.to_string(),
                    entries: headers.clone(),
                    require_existing: false,
                },
            ));
        }
    }

    if let Some(include) = &layout.python_include {
        rules.push(FixRule::new(
            "python-headers",
            &["Python.h: No such file", "Python.h not found"],
            FixAction::PrependPath {
                var: "CPATH".to_string(),
                entries: vec![include.display().to_string()],
                require_existing: true,
            },
        ));
    }

    if let Some(qt) = &layout.qt_dir {
        let bin = qt.join("bin");
        rules.push(FixRule::new(
            "qmake-path",
            &["qmake: command not found", "qmake: not found", "could not find qmake"],
            FixAction::PrependPath {
                var: "PATH".to_string(),
                entries: vec![bin.display().to_string()],
                require_existing: true,
            },
        ));
        rules.push(FixRule::new(
            "qmake-var",
            &["qmake: command not found", "qmake: not found", "could not find qmake"],
            FixAction::SetIfAbsent {
                var: "QMAKE".to_string(),
                value: bin.join("qmake").display().to_string(),
            },
        ));
    }

    if let Some(shiboken) = &layout.shiboken_dir {
        rules.push(FixRule::new(
            "shiboken-path",
            &["shiboken6: command not found", "shiboken6: not found", "could not find shiboken6"],
            FixAction::PrependPath {
                var: "PATH".to_string(),
                entries: vec![shiboken.join("bin").display().to_string()],
                require_existing: true,
            },
        ));
    }

    let libs = strings(&layout.lib_dirs());
    if !libs.is_empty() {
        rules.push(FixRule::new(
            "shared-libraries",
            &[
                "cannot open shared object file",
                "error while loading shared libraries",
            ],
            FixAction::PrependPath {
                var: "LD_LIBRARY_PATH".to_string(),
                entries: libs,
                require_existing: false,
            },
        ));
    }

    let prefixes = strings(&layout.prefix_dirs());
    if !prefixes.is_empty() {
        rules.push(FixRule::new(
            "cmake-packages",
            &[
                "Could not find a package configuration file",
                "By not providing \"Find",
            ],
            FixAction::PrependPath {
                var: "CMAKE_PREFIX_PATH".to_string(),
                entries: prefixes,
                require_existing: false,
            },
        ));
    }

    rules.push(FixRule::new(
        "busy-file",
        &["Text file busy", "Resource temporarily unavailable"],
        FixAction::Settle,
    ));

    RuleSet::new(rules)
}
