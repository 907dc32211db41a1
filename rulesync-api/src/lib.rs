//! rulesync-api: Shared types for per-scope permission rules
//!
//! This crate defines the rule model exchanged between the sync engine,
//! its local mirror, and the remote permission service.
//!
//! A rule binds a `(scope, pattern)` key to a [`Setting`]. Scopes and
//! patterns are opaque strings: they are never normalized, case-folded,
//! or trimmed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version of the persisted mirror format
pub const MIRROR_FORMAT_VERSION: u32 = 1;

/// What a rule does when its pattern matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Setting {
    /// Allow the resource to run
    Allow,
    /// Block the resource
    Block,
    /// Ask the user each time
    Ask,
}

impl Setting {
    /// All settings, in display order
    pub const ALL: [Setting; 3] = [Setting::Allow, Setting::Block, Setting::Ask];

    /// Wire name of the setting
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Ask => "ask",
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown setting name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown setting '{0}' (expected allow, block or ask)")]
pub struct ParseSettingError(pub String);

impl FromStr for Setting {
    type Err = ParseSettingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "block" => Ok(Self::Block),
            "ask" => Ok(Self::Ask),
            other => Err(ParseSettingError(other.to_string())),
        }
    }
}

/// Unique identity of a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    /// Namespace the rule belongs to (e.g., a plugin id)
    pub scope: String,
    /// Pattern the rule matches (e.g., "*.example.com/*")
    pub pattern: String,
}

impl RuleKey {
    pub fn new(scope: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            pattern: pattern.into(),
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?}]", self.scope, self.pattern)
    }
}

/// A permission rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    /// Namespace the rule belongs to
    pub scope: String,
    /// Pattern the rule matches
    pub pattern: String,
    /// What happens when the pattern matches
    pub setting: Setting,
}

impl Rule {
    /// Create a new rule
    pub fn new(scope: impl Into<String>, pattern: impl Into<String>, setting: Setting) -> Self {
        Self {
            scope: scope.into(),
            pattern: pattern.into(),
            setting,
        }
    }

    /// Create an allow rule
    pub fn allow(scope: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(scope, pattern, Setting::Allow)
    }

    /// Create a block rule
    pub fn block(scope: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(scope, pattern, Setting::Block)
    }

    /// Create an ask rule
    pub fn ask(scope: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(scope, pattern, Setting::Ask)
    }

    /// The rule's unique key
    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.scope.clone(), self.pattern.clone())
    }

    /// Check whether this rule has the given key
    pub fn has_key(&self, scope: &str, pattern: &str) -> bool {
        self.scope == scope && self.pattern == pattern
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?}] => {}", self.scope, self.pattern, self.setting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_parse() {
        for setting in Setting::ALL {
            assert_eq!(setting.as_str().parse::<Setting>().unwrap(), setting);
        }
        assert_eq!(
            "Allow".parse::<Setting>(),
            Err(ParseSettingError("Allow".to_string()))
        );
    }

    #[test]
    fn test_setting_serde_names() {
        let json = serde_json::to_string(&Setting::Block).unwrap();
        assert_eq!(json, "\"block\"");
    }

    #[test]
    fn test_rule_key() {
        let rule = Rule::allow("flash", "*.example.com/*");
        assert_eq!(rule.key(), RuleKey::new("flash", "*.example.com/*"));
        assert!(rule.has_key("flash", "*.example.com/*"));
        assert!(!rule.has_key("flash", "*.EXAMPLE.com/*"));
    }

    #[test]
    fn test_pattern_is_opaque() {
        let rule = Rule::ask("java", "  HTTP://Example.com/Ü  ");
        let json = serde_json::to_string(&rule).unwrap();
        let back: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pattern, "  HTTP://Example.com/Ü  ");
        assert_eq!(back, rule);
    }
}
