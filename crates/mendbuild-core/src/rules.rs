//! Failure classification and additive environment fixes.
//!
//! A [`FixRule`] pairs failure signatures (substrings searched
//! case-insensitively in captured build output) with a [`FixAction`] over
//! [`EnvironmentState`]. Every action is additive and idempotent: applying a
//! rule twice leaves the same state as applying it once.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::env::EnvironmentState;
use crate::error::FixError;

/// Corrective action applied when a rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixAction {
    /// Prepend entries to a search-path variable.
    PrependPath {
        var: String,
        entries: Vec<String>,
        #[serde(default)]
        require_existing: bool,
    },

    /// Append entries to a search-path variable.
    AppendPath {
        var: String,
        entries: Vec<String>,
        #[serde(default)]
        require_existing: bool,
    },

    /// Set a variable to a fixed value.
    SetVar { var: String, value: String },

    /// Set a variable only when it is unset.
    SetIfAbsent { var: String, value: String },

    /// Known transient failure; no environment change.
    Settle,
}

impl FixAction {
    /// Apply the action. Returns whether the environment changed.
    pub fn apply(&self, env: &mut EnvironmentState) -> Result<bool, FixError> {
        match self {
            FixAction::PrependPath {
                var,
                entries,
                require_existing,
            } => {
                check_entries(var, entries, *require_existing)?;
                Ok(env.prepend_path(var, entries))
            }
            FixAction::AppendPath {
                var,
                entries,
                require_existing,
            } => {
                check_entries(var, entries, *require_existing)?;
                Ok(env.append_path(var, entries))
            }
            FixAction::SetVar { var, value } => Ok(env.set(var.as_str(), value.as_str())),
            FixAction::SetIfAbsent { var, value } => Ok(env.set_if_absent(var, value)),
            FixAction::Settle => Ok(false),
        }
    }

    /// Short human-readable description for log lines.
    pub fn describe(&self) -> String {
        match self {
            FixAction::PrependPath { var, entries, .. } => {
                format!("prepend {} to {}", entries.join(","), var)
            }
            FixAction::AppendPath { var, entries, .. } => {
                format!("append {} to {}", entries.join(","), var)
            }
            FixAction::SetVar { var, value } => format!("set {}={}", var, value),
            FixAction::SetIfAbsent { var, value } => format!("default {}={}", var, value),
            FixAction::Settle => "settle".to_string(),
        }
    }
}

fn check_entries(var: &str, entries: &[String], require_existing: bool) -> Result<(), FixError> {
    if entries.is_empty() {
        return Err(FixError::EmptyEntries {
            var: var.to_string(),
        });
    }
    if require_existing {
        if let Some(missing) = entries.iter().find(|e| !Path::new(e.as_str()).exists()) {
            return Err(FixError::MissingPath(missing.into()));
        }
    }
    Ok(())
}

/// Trigger/action pair for one known failure signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRule {
    pub name: String,

    /// Substrings that trigger the rule; any one is enough.
    pub signatures: Vec<String>,

    pub action: FixAction,
}

impl FixRule {
    pub fn new(name: impl Into<String>, signatures: &[&str], action: FixAction) -> Self {
        Self {
            name: name.into(),
            signatures: signatures.iter().map(|s| s.to_string()).collect(),
            action,
        }
    }

    /// Whether any signature occurs in `output`, ignoring case.
    pub fn matches(&self, output: &str) -> bool {
        let haystack = output.to_lowercase();
        self.matches_lowered(&haystack)
    }

    fn matches_lowered(&self, haystack: &str) -> bool {
        self.signatures
            .iter()
            .filter(|s| !s.is_empty())
            .any(|s| haystack.contains(&s.to_lowercase()))
    }
}

/// Result of applying one matched rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleApplication {
    pub rule: String,
    pub changed: bool,
    pub error: Option<FixError>,
}

impl RuleApplication {
    /// A rule counts as applied unless its action failed.
    pub fn applied(&self) -> bool {
        self.error.is_none()
    }
}

/// Ordered, static set of fix rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: Vec<FixRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<FixRule>) -> Self {
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FixRule> {
        self.rules.iter()
    }

    /// Append rules after the existing ones. Earlier rules keep priority in
    /// log order; all matching rules are applied regardless.
    pub fn extend(&mut self, rules: impl IntoIterator<Item = FixRule>) {
        self.rules.extend(rules);
    }

    /// Rules whose signatures occur in `output`, in rule order.
    pub fn classify(&self, output: &str) -> Vec<&FixRule> {
        let haystack = output.to_lowercase();
        self.rules
            .iter()
            .filter(|r| r.matches_lowered(&haystack))
            .collect()
    }

    /// Classify `output` and apply every matching rule to `env`.
    pub fn apply_matching(&self, output: &str, env: &mut EnvironmentState) -> Vec<RuleApplication> {
        self.classify(output)
            .into_iter()
            .map(|rule| match rule.action.apply(env) {
                Ok(changed) => RuleApplication {
                    rule: rule.name.clone(),
                    changed,
                    error: None,
                },
                Err(e) => RuleApplication {
                    rule: rule.name.clone(),
                    changed: false,
                    error: Some(e),
                },
            })
            .collect()
    }
}

impl FromIterator<FixRule> for RuleSet {
    fn from_iter<T: IntoIterator<Item = FixRule>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn include_rule() -> FixRule {
        FixRule::new(
            "c-headers",
            &["stdbool.h: No such file"],
            FixAction::PrependPath {
                var: "C_INCLUDE_PATH".to_string(),
                entries: vec!["/usr/include".to_string()],
                require_existing: false,
            },
        )
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let rule = include_rule();
        assert!(rule.matches("FATAL ERROR: STDBOOL.H: NO SUCH FILE or directory"));
        assert!(!rule.matches("undefined reference to `qt_version_tag'"));
    }

    #[test]
    fn test_empty_signature_never_matches() {
        let rule = FixRule::new("blank", &[""], FixAction::Settle);
        assert!(!rule.matches("anything"));
    }

    #[test]
    fn test_classify_preserves_rule_order() {
        let rules = RuleSet::new(vec![
            FixRule::new("busy", &["text file busy"], FixAction::Settle),
            include_rule(),
        ]);
        let matched = rules.classify("stdbool.h: No such file\nText file busy");
        let names: Vec<&str> = matched.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["busy", "c-headers"]);
    }

    #[test]
    fn test_apply_twice_equals_apply_once() {
        let rules = RuleSet::new(vec![
            include_rule(),
            FixRule::new(
                "qmake",
                &["qmake: command not found"],
                FixAction::SetVar {
                    var: "QMAKE".to_string(),
                    value: "/opt/qt/bin/qmake".to_string(),
                },
            ),
            FixRule::new(
                "libs",
                &["cannot open shared object file"],
                FixAction::AppendPath {
                    var: "LD_LIBRARY_PATH".to_string(),
                    entries: vec!["/opt/qt/lib".to_string()],
                    require_existing: false,
                },
            ),
            FixRule::new(
                "python",
                &["python.h"],
                FixAction::SetIfAbsent {
                    var: "PYTHON".to_string(),
                    value: "/opt/python/bin/python3".to_string(),
                },
            ),
        ]);
        let output = "stdbool.h: No such file\nqmake: command not found\n\
                      libQt6Core.so.6: cannot open shared object file\nPython.h missing";

        let mut once = EnvironmentState::from_pairs([("C_INCLUDE_PATH", "/opt/include")]);
        rules.apply_matching(output, &mut once);

        let mut twice = once.clone();
        let second = rules.apply_matching(output, &mut twice);

        assert_eq!(once, twice);
        assert!(second.iter().all(|a| a.applied() && !a.changed));
    }

    #[test]
    fn test_missing_required_path_is_reported_not_applied() {
        let rule = FixRule::new(
            "qt-bin",
            &["qmake"],
            FixAction::PrependPath {
                var: "PATH".to_string(),
                entries: vec!["/definitely/not/a/real/qt/bin".to_string()],
                require_existing: true,
            },
        );
        let rules = RuleSet::new(vec![rule]);
        let mut env = EnvironmentState::from_pairs([("PATH", "/usr/bin")]);

        let results = rules.apply_matching("qmake: not found", &mut env);

        assert_eq!(results.len(), 1);
        assert!(!results[0].applied());
        assert!(matches!(results[0].error, Some(FixError::MissingPath(_))));
        assert_eq!(env.get("PATH"), Some("/usr/bin"));
    }

    #[test]
    fn test_settle_applies_without_change() {
        let mut env = EnvironmentState::new();
        let changed = FixAction::Settle.apply(&mut env).expect("settle never fails");
        assert!(!changed);
        assert!(env.is_empty());
    }

    #[test]
    fn test_rule_roundtrips_through_toml() {
        let src = r#"
            name = "qt-bin"
            signatures = ["qmake: command not found"]
            [action]
            kind = "prepend_path"
            var = "PATH"
            entries = ["/opt/qt/bin"]
        "#;
        let rule: FixRule = toml::from_str(src).expect("parse rule");
        assert_eq!(rule.name, "qt-bin");
        assert!(matches!(
            rule.action,
            FixAction::PrependPath { require_existing: false, .. }
        ));
    }
}
