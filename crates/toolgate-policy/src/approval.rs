//! Human approvals for destructive tools and the scope each tool requires.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// What an approval authorises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalScope {
    Commit,
    Push,
    OpenPr,
    Merge,
}

impl ApprovalScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Push => "push",
            Self::OpenPr => "open_pr",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for ApprovalScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalScope {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Self::Commit),
            "push" => Ok(Self::Push),
            "open_pr" => Ok(Self::OpenPr),
            "merge" => Ok(Self::Merge),
            other => Err(PolicyError::UnknownScope(other.to_string())),
        }
    }
}

/// Approval supplied by the caller of a destructive tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    /// Run the approval was issued for.
    pub run_id: String,
    #[serde(default)]
    pub scope: Vec<ApprovalScope>,
}

impl Approval {
    pub fn new(run_id: impl Into<String>, scope: impl IntoIterator<Item = ApprovalScope>) -> Self {
        Self {
            run_id: run_id.into(),
            scope: scope.into_iter().collect(),
        }
    }

    pub fn grants(&self, scope: ApprovalScope) -> bool {
        self.scope.contains(&scope)
    }
}

/// Tool name → scope an approval must grant before the tool may run.
///
/// Only consulted for destructive tools. A destructive tool missing from the
/// table needs an approval for the current run with any scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeTable {
    entries: BTreeMap<String, ApprovalScope>,
}

impl ScopeTable {
    /// Empty table.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Built-in mappings for the source-control connector.
    pub fn builtin() -> Self {
        let entries = [
            ("github.commit", ApprovalScope::Commit),
            ("github.create_commit", ApprovalScope::Commit),
            ("github.push", ApprovalScope::Push),
            ("github.create_pull_request", ApprovalScope::OpenPr),
            ("github.merge_pull_request", ApprovalScope::Merge),
        ]
        .into_iter()
        .map(|(tool, scope)| (tool.to_string(), scope))
        .collect();
        Self { entries }
    }

    /// Add or replace entries, later ones winning.
    pub fn merge(&mut self, overrides: &BTreeMap<String, ApprovalScope>) {
        for (tool, scope) in overrides {
            self.entries.insert(tool.clone(), *scope);
        }
    }

    pub fn insert(&mut self, tool: impl Into<String>, scope: ApprovalScope) {
        self.entries.insert(tool.into(), scope);
    }

    pub fn required(&self, tool_name: &str) -> Option<ApprovalScope> {
        self.entries.get(tool_name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ApprovalScope)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl Default for ScopeTable {
    fn default() -> Self {
        Self::builtin()
    }
}
