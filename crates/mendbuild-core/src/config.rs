//! `mendbuild.toml` loading, environment overrides and validation.
//!
//! ```toml
//! log_file = "build/mendbuild.log"
//! report_dir = "build/reports"
//!
//! [build]
//! program = "python3"
//! args = ["setup.py", "build"]
//!
//! [retry]
//! max_attempts = 5
//!
//! [conflict]
//! signature = ["python", "setup.py", "build"]
//!
//! [[fallbacks]]
//! name = "no-limited-api"
//! args = ["setup.py", "build", "--limited-api=no"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::budget::RetryBudget;
use crate::command::{BuildPlan, CommandSpec};
use crate::conflict::{ConflictScanner, ConflictSignature};
use crate::env::{EnvProfile, EnvironmentState};
use crate::error::ConfigError;
use crate::preflight::PreflightReport;
use crate::rules::{FixRule, RuleSet};
use crate::toolchain::{builtin_rules, ToolchainLayout};

pub const DEFAULT_CONFIG_FILE: &str = "mendbuild.toml";
pub const DEFAULT_REPORT_DIR: &str = ".mendbuild/runs";

pub const ENV_MAX_ATTEMPTS: &str = "MENDBUILD_MAX_ATTEMPTS";
pub const ENV_LOG_FILE: &str = "MENDBUILD_LOG_FILE";
pub const ENV_REPORT_DIR: &str = "MENDBUILD_REPORT_DIR";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    /// Display name; defaults to the program name.
    pub name: Option<String>,
    pub program: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,

    /// Per-attempt timeout; 0 disables it.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub settle_delay_ms: u64,
    pub backoff_step_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let budget = RetryBudget::default();
        Self {
            max_attempts: budget.max_attempts,
            settle_delay_ms: budget.settle_delay.as_millis() as u64,
            backoff_step_ms: budget.backoff_step.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictSection {
    /// Terms that must all appear in a process command line. Empty disables
    /// the scan.
    pub signature: Vec<String>,
    pub grace_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ConflictSection {
    fn default() -> Self {
        Self {
            signature: Vec::new(),
            grace_secs: 2,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightSection {
    pub tools: Vec<String>,
    pub paths: Vec<PathBuf>,
}

/// Alternate argument list for the build program, tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackSection {
    pub name: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub build: BuildSection,
    pub retry: RetrySection,
    pub conflict: ConflictSection,
    pub environment: EnvProfile,
    pub toolchain: ToolchainLayout,
    pub preflight: PreflightSection,

    /// Include the toolchain's built-in rules ahead of `rules`.
    pub builtin_rules: bool,
    pub rules: Vec<FixRule>,
    pub fallbacks: Vec<FallbackSection>,

    pub log_file: Option<PathBuf>,
    pub report_dir: Option<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            build: BuildSection::default(),
            retry: RetrySection::default(),
            conflict: ConflictSection::default(),
            environment: EnvProfile::default(),
            toolchain: ToolchainLayout::default(),
            preflight: PreflightSection::default(),
            builtin_rules: true,
            rules: Vec::new(),
            fallbacks: Vec::new(),
            log_file: None,
            report_dir: None,
        }
    }
}

impl DriverConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), rules = config.rules.len(), "Loaded build config");
        Ok(config)
    }

    /// Load `path` if given, else `mendbuild.toml` in the working directory
    /// if present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::load(default)
                } else {
                    debug!("No config file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MENDBUILD_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup`, then re-validate.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_ATTEMPTS) {
            self.retry.max_attempts =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        var: ENV_MAX_ATTEMPTS.to_string(),
                        value: value.clone(),
                    })?;
        }
        if let Some(value) = lookup(ENV_LOG_FILE).filter(|v| !v.is_empty()) {
            self.log_file = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_REPORT_DIR).filter(|v| !v.is_empty()) {
            self.report_dir = Some(PathBuf::from(value));
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_step_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_step_ms must be greater than zero".to_string(),
            ));
        }
        if self.conflict.poll_interval_ms == 0 && !self.conflict.signature.is_empty() {
            return Err(ConfigError::Invalid(
                "conflict.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if matches!(&self.build.program, Some(p) if p.trim().is_empty()) {
            return Err(ConfigError::Invalid("build.program is empty".to_string()));
        }
        if !self.fallbacks.is_empty() && self.build.program.is_none() {
            return Err(ConfigError::Invalid(
                "fallbacks require build.program".to_string(),
            ));
        }
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(ConfigError::Invalid("rule with empty name".to_string()));
            }
            if rule.signatures.iter().all(|s| s.is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "rule {} has no signatures",
                    rule.name
                )));
            }
        }
        Ok(())
    }

    pub fn report_dir(&self) -> PathBuf {
        self.report_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_DIR))
    }

    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            max_attempts: self.retry.max_attempts,
            settle_delay: Duration::from_millis(self.retry.settle_delay_ms),
            backoff_step: Duration::from_millis(self.retry.backoff_step_ms),
        }
    }

    /// The primary build command. `argv` replaces `[build]` when non-empty.
    pub fn command(&self, argv: &[String]) -> Result<CommandSpec, ConfigError> {
        let command: Vec<String> = if argv.is_empty() {
            let program = self.build.program.clone().ok_or_else(|| {
                ConfigError::Invalid("no build command given and build.program unset".to_string())
            })?;
            std::iter::once(program)
                .chain(self.build.args.iter().cloned())
                .collect()
        } else {
            argv.to_vec()
        };

        let name = match (&self.build.name, argv.is_empty()) {
            (Some(name), true) => name.clone(),
            _ => program_name(&command[0]),
        };
        let mut spec = CommandSpec::new(name, command).with_timeout(self.build.timeout_secs);
        if let Some(cwd) = &self.build.cwd {
            spec = spec.with_cwd(cwd);
        }
        Ok(spec)
    }

    /// Primary command followed by the configured fallbacks.
    ///
    /// Fallbacks are skipped when `argv` overrides the build command.
    pub fn plan(&self, argv: &[String]) -> Result<BuildPlan, ConfigError> {
        let primary = self.command(argv)?;
        if !argv.is_empty() {
            return Ok(BuildPlan::single(primary));
        }
        let fallbacks = self
            .fallbacks
            .iter()
            .map(|f| (f.name.clone(), f.args.clone()))
            .collect();
        Ok(BuildPlan::with_fallbacks(primary, fallbacks))
    }

    pub fn scanner(&self) -> Option<ConflictScanner> {
        if self.conflict.signature.is_empty() {
            return None;
        }
        Some(
            ConflictScanner::new(ConflictSignature::new(self.conflict.signature.iter().cloned()))
                .with_grace(Duration::from_secs(self.conflict.grace_secs))
                .with_poll_interval(Duration::from_millis(self.conflict.poll_interval_ms)),
        )
    }

    /// `base` with the `[environment]` profile applied.
    pub fn initial_env(&self, base: EnvironmentState) -> EnvironmentState {
        let mut env = base;
        self.environment.apply(&mut env);
        env
    }

    /// Toolchain layout with unset fields discovered from `env`.
    pub fn layout(&self, env: &EnvironmentState) -> ToolchainLayout {
        self.toolchain.clone().resolve(env)
    }

    /// Built-in rules (unless disabled) followed by configured rules.
    pub fn rule_set(&self, env: &EnvironmentState) -> RuleSet {
        let mut rules = if self.builtin_rules {
            builtin_rules(&self.layout(env))
        } else {
            RuleSet::default()
        };
        rules.extend(self.rules.iter().cloned());
        rules
    }

    /// Check configured tools (plus the build program) and paths.
    pub fn preflight(&self, env: &EnvironmentState) -> PreflightReport {
        let mut tools = self.preflight.tools.clone();
        if let Some(program) = &self.build.program {
            if !tools.contains(program) {
                tools.insert(0, program.clone());
            }
        }
        PreflightReport::run(&tools, &self.preflight.paths, env)
    }
}

fn program_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
        log_file = "build/mendbuild.log"

        [build]
        program = "python3"
        args = ["setup.py", "build"]
        timeout_secs = 3600

        [retry]
        max_attempts = 5
        settle_delay_ms = 250

        [conflict]
        signature = ["python", "setup.py"]

        [environment]
        unset = ["BUILD_DOCS"]

        [environment.strip_prefixes]
        LD_LIBRARY_PATH = ["/usr/lib"]

        [toolchain]
        qt_dir = "/opt/qt/6.9.1"

        [[rules]]
        name = "minizip"
        signatures = ["minizip"]
        [rules.action]
        kind = "prepend_path"
        var = "CMAKE_PREFIX_PATH"
        entries = ["/opt/minizip_ng/4.0.10"]

        [[fallbacks]]
        name = "no-limited-api"
        args = ["setup.py", "build", "--limited-api=no"]
    "#;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_parse_sample() {
        let config = DriverConfig::from_toml_str(SAMPLE).expect("parse");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_step_ms, 5000);
        assert_eq!(config.budget().settle_delay, Duration::from_millis(250));
        assert_eq!(config.rules.len(), 1);
        assert!(config.builtin_rules);
        assert_eq!(config.log_file, Some(PathBuf::from("build/mendbuild.log")));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DriverConfig::from_toml_str("").expect("parse");
        assert_eq!(config, DriverConfig::default());
        assert_eq!(config.budget(), RetryBudget::default());
        assert_eq!(config.report_dir(), PathBuf::from(DEFAULT_REPORT_DIR));
        assert!(config.scanner().is_none());
    }

    #[test]
    fn test_load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(SAMPLE.as_bytes()).expect("write");
        let config = DriverConfig::load(file.path()).expect("load");
        assert_eq!(config.build.program.as_deref(), Some("python3"));
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = DriverConfig::load(Path::new("/no/such/mendbuild.toml")).expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = DriverConfig::from_toml_str("[retry]\nmax_attempts = 0\n").expect_err("zero");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = DriverConfig::from_toml_str("[retry]\nmax_attempts = \"many\"\n")
            .expect_err("type");
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = DriverConfig::from_toml_str(
            "[[fallbacks]]\nname = \"alt\"\nargs = [\"build\"]\n",
        )
        .expect_err("fallback without program");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = DriverConfig::from_toml_str(SAMPLE).expect("parse");
        config
            .apply_overrides(lookup(&[
                (ENV_MAX_ATTEMPTS, "7"),
                (ENV_REPORT_DIR, "/tmp/reports"),
            ]))
            .expect("overrides");
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.report_dir, Some(PathBuf::from("/tmp/reports")));
        assert_eq!(config.log_file, Some(PathBuf::from("build/mendbuild.log")));

        let err = config
            .apply_overrides(lookup(&[(ENV_MAX_ATTEMPTS, "lots")]))
            .expect_err("bad number");
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));

        let err = config
            .apply_overrides(lookup(&[(ENV_MAX_ATTEMPTS, "0")]))
            .expect_err("zero");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_plan_with_fallbacks() {
        let config = DriverConfig::from_toml_str(SAMPLE).expect("parse");
        let plan = config.plan(&[]).expect("plan");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].name, "python3");
        assert_eq!(plan.steps[0].timeout_secs, 3600);
        assert_eq!(
            plan.steps[1].command,
            vec!["python3", "setup.py", "build", "--limited-api=no"]
        );
    }

    #[test]
    fn test_argv_overrides_build_section() {
        let config = DriverConfig::from_toml_str(SAMPLE).expect("parse");
        let argv = vec!["/usr/bin/make".to_string(), "-j8".to_string()];
        let plan = config.plan(&argv).expect("plan");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].name, "make");
        assert_eq!(plan.steps[0].command, argv);
    }

    #[test]
    fn test_command_requires_program() {
        let config = DriverConfig::default();
        assert!(matches!(config.command(&[]), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rule_set_orders_builtin_before_configured() {
        let config = DriverConfig::from_toml_str(SAMPLE).expect("parse");
        let rules = config.rule_set(&EnvironmentState::new());
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names.first(), Some(&"qmake-path"));
        assert_eq!(names.last(), Some(&"minizip"));
        assert!(names.contains(&"busy-file"));
    }

    #[test]
    fn test_initial_env_applies_profile() {
        let config = DriverConfig::from_toml_str(SAMPLE).expect("parse");
        let base = EnvironmentState::from_pairs([
            ("BUILD_DOCS", "1"),
            ("LD_LIBRARY_PATH", "/usr/lib64"),
            ("HOME", "/home/build"),
        ]);
        let env = config.initial_env(base);
        assert!(!env.contains("BUILD_DOCS"));
        assert!(env.path_entries("LD_LIBRARY_PATH").is_empty());
        assert_eq!(env.get("HOME"), Some("/home/build"));
    }

    #[test]
    fn test_scanner_from_config() {
        let config = DriverConfig::from_toml_str(SAMPLE).expect("parse");
        let scanner = config.scanner().expect("scanner");
        assert!(scanner.signature.matches("/usr/bin/python3 setup.py build"));
        assert!(!scanner.signature.matches("/usr/bin/python3 -m http.server"));
        assert_eq!(scanner.grace, Duration::from_secs(2));
    }
}
