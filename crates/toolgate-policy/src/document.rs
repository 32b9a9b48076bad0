//! Policy document model and loader.
//!
//! A document is YAML or JSON:
//!
//! ```yaml
//! version: "1"
//! defaultReadBehavior: allow
//! defaultWriteBehavior: deny
//! rules:
//!   - id: allow-jira-writes
//!     effect: allow
//!     priority: 10
//!     conditions:
//!       toolNames: ["jira.*"]
//!       policyClasses: [WRITE_NON_DESTRUCTIVE]
//! requiredScopes:
//!   jira.delete_issue: commit
//! ```
//!
//! Destructive tools always default to `deny`; there is no field for it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::approval::ApprovalScope;
use crate::engine::PolicyRequest;
use crate::error::PolicyError;

// ─── Classes and effects ──────────────────────────────────────────────────────

/// Blast-radius tier of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyClass {
    Read,
    WriteNonDestructive,
    Destructive,
}

impl PolicyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::WriteNonDestructive => "WRITE_NON_DESTRUCTIVE",
            Self::Destructive => "DESTRUCTIVE",
        }
    }
}

impl fmt::Display for PolicyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyClass {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "READ" => Ok(Self::Read),
            "WRITE_NON_DESTRUCTIVE" => Ok(Self::WriteNonDestructive),
            "DESTRUCTIVE" => Ok(Self::Destructive),
            _ => Err(PolicyError::UnknownPolicyClass(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        })
    }
}

// ─── Name patterns ────────────────────────────────────────────────────────────

/// Tool-name or resource matcher, parsed once at load time.
///
/// `"*"` matches anything, `"github.*"` and `"repos/acme/*"` match by prefix,
/// anything else matches exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NamePattern {
    Any,
    /// Prefix including its trailing separator.
    Prefix(String),
    Exact(String),
}

impl NamePattern {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => value.starts_with(prefix.as_str()),
            Self::Exact(exact) => value == exact,
        }
    }
}

impl FromStr for NamePattern {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| PolicyError::InvalidPattern {
            pattern: s.to_string(),
            reason: reason.to_string(),
        };
        if s.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if s == "*" {
            return Ok(Self::Any);
        }
        let prefix = s.strip_suffix(".*").map(|p| (p, '.'));
        let prefix = prefix.or_else(|| s.strip_suffix("/*").map(|p| (p, '/')));
        match prefix {
            Some((p, _)) if p.is_empty() || p.contains('*') => {
                Err(invalid("wildcard must follow a non-empty literal prefix"))
            }
            Some((p, sep)) => Ok(Self::Prefix(format!("{p}{sep}"))),
            None if s.contains('*') => Err(invalid("only a trailing '.*' or '/*' wildcard is supported")),
            None => Ok(Self::Exact(s.to_string())),
        }
    }
}

impl TryFrom<String> for NamePattern {
    type Error = PolicyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NamePattern> for String {
    fn from(p: NamePattern) -> Self {
        p.to_string()
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Prefix(p) => write!(f, "{p}*"),
            Self::Exact(e) => f.write_str(e),
        }
    }
}

// ─── Rules ────────────────────────────────────────────────────────────────────

/// Conditions of a rule. Every configured field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenants: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_names: Option<Vec<NamePattern>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_classes: Option<Vec<PolicyClass>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<NamePattern>>,
}

fn contains(list: &Option<Vec<String>>, value: Option<&str>) -> bool {
    match list {
        None => true,
        Some(list) => value.is_some_and(|v| list.iter().any(|item| item == v)),
    }
}

fn any_pattern(list: &Option<Vec<NamePattern>>, value: Option<&str>) -> bool {
    match list {
        None => true,
        Some(list) => value.is_some_and(|v| list.iter().any(|p| p.matches(v))),
    }
}

impl RuleConditions {
    /// `true` if every configured condition holds for `req`. A condition on
    /// an attribute the request does not carry never holds.
    pub fn matches(&self, req: &PolicyRequest) -> bool {
        contains(&self.tenants, Some(&req.tenant_id))
            && contains(&self.actors, req.actor.as_deref())
            && contains(&self.sources, req.source.as_deref())
            && contains(&self.connectors, Some(req.connector_id()))
            && any_pattern(&self.tool_names, Some(&req.tool_name))
            && self
                .policy_classes
                .as_ref()
                .map_or(true, |classes| classes.contains(&req.policy_class))
            && any_pattern(&self.resources, req.resource.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyRule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub effect: Effect,
    /// Higher values are evaluated first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: RuleConditions,
}

// ─── Document ─────────────────────────────────────────────────────────────────

fn default_version() -> String {
    "1".to_string()
}

fn default_read_behavior() -> Effect {
    Effect::Allow
}

fn default_write_behavior() -> Effect {
    Effect::Deny
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyDocument {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_read_behavior")]
    pub default_read_behavior: Effect,
    #[serde(default = "default_write_behavior")]
    pub default_write_behavior: Effect,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Merged over the built-in scope table.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub required_scopes: BTreeMap<String, ApprovalScope>,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            version: default_version(),
            default_read_behavior: default_read_behavior(),
            default_write_behavior: default_write_behavior(),
            rules: Vec::new(),
            required_scopes: BTreeMap::new(),
        }
    }
}

/// Summary returned by [`PolicyDocument::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySummary {
    pub version: String,
    pub rule_count: usize,
    pub allow_rules: usize,
    pub deny_rules: usize,
    pub default_read_behavior: Effect,
    pub default_write_behavior: Effect,
    pub scope_overrides: usize,
}

impl PolicyDocument {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyError> {
        let doc: Self = serde_yaml::from_str(yaml)?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn from_json_str(json: &str) -> Result<Self, PolicyError> {
        let doc: Self = serde_json::from_str(json)?;
        doc.validate()?;
        Ok(doc)
    }

    /// Load from a file; `.json` is parsed as JSON, anything else as YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    /// Reject empty or duplicate rule ids and summarise the document.
    pub fn validate(&self) -> Result<PolicySummary, PolicyError> {
        let mut seen = HashSet::new();
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.id.trim().is_empty() {
                return Err(PolicyError::EmptyRuleId { index });
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(PolicyError::DuplicateRuleId {
                    id: rule.id.clone(),
                });
            }
        }
        let allow_rules = self.rules.iter().filter(|r| r.effect.is_allow()).count();
        Ok(PolicySummary {
            version: self.version.clone(),
            rule_count: self.rules.len(),
            allow_rules,
            deny_rules: self.rules.len() - allow_rules,
            default_read_behavior: self.default_read_behavior,
            default_write_behavior: self.default_write_behavior,
            scope_overrides: self.required_scopes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_patterns_parse() {
        assert_eq!("*".parse::<NamePattern>().unwrap(), NamePattern::Any);
        assert_eq!(
            "github.*".parse::<NamePattern>().unwrap(),
            NamePattern::Prefix("github.".into())
        );
        assert_eq!(
            "repos/acme/*".parse::<NamePattern>().unwrap(),
            NamePattern::Prefix("repos/acme/".into())
        );
        assert_eq!(
            "jira.search".parse::<NamePattern>().unwrap(),
            NamePattern::Exact("jira.search".into())
        );
        assert!("".parse::<NamePattern>().is_err());
        assert!(".*".parse::<NamePattern>().is_err());
        assert!("git*hub".parse::<NamePattern>().is_err());
    }

    #[test]
    fn prefix_pattern_respects_separator() {
        let p: NamePattern = "github.*".parse().unwrap();
        assert!(p.matches("github.commit"));
        assert!(!p.matches("githubx.commit"));
        assert!(!p.matches("github"));
        assert_eq!(p.to_string(), "github.*");
    }

    #[test]
    fn defaults_apply_when_fields_omitted() {
        let doc = PolicyDocument::from_yaml_str("rules: []").unwrap();
        assert_eq!(doc.version, "1");
        assert_eq!(doc.default_read_behavior, Effect::Allow);
        assert_eq!(doc.default_write_behavior, Effect::Deny);
    }

    #[test]
    fn duplicate_rule_ids_are_rejected() {
        let yaml = r#"
rules:
  - { id: a, effect: allow }
  - { id: a, effect: deny }
"#;
        let err = PolicyDocument::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, PolicyError::DuplicateRuleId { ref id } if id == "a"));
    }

    #[test]
    fn destructive_default_is_not_expressible() {
        let err = PolicyDocument::from_yaml_str("defaultDestructiveBehavior: allow").unwrap_err();
        assert!(matches!(err, PolicyError::Parse(_)));
    }

    #[test]
    fn bad_pattern_fails_at_load() {
        let yaml = r#"
rules:
  - id: r1
    effect: allow
    conditions:
      toolNames: ["*.commit"]
"#;
        assert!(PolicyDocument::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn json_documents_load() {
        let json = r#"{"defaultWriteBehavior":"allow","rules":[{"id":"r","effect":"deny","priority":5}]}"#;
        let doc = PolicyDocument::from_json_str(json).unwrap();
        let summary = doc.validate().unwrap();
        assert_eq!(summary.rule_count, 1);
        assert_eq!(summary.deny_rules, 1);
        assert_eq!(summary.default_write_behavior, Effect::Allow);
    }
}
