//! Policy evaluation.
//!
//! Order of checks:
//! 1. destructive tools need an approval for this run granting the tool's
//!    required scope, checked before any rule
//! 2. rules by descending priority (ties in document order); first match wins
//! 3. the policy class default

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::approval::{Approval, ScopeTable};
use crate::document::{Effect, PolicyClass, PolicyDocument, PolicyRule};
use crate::error::PolicyError;

/// Attributes of one tool invocation, as seen by the policy engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRequest {
    pub run_id: String,
    pub tenant_id: String,
    /// Fully qualified `connector.tool` name.
    pub tool_name: String,
    pub policy_class: PolicyClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Approval>,
}

impl PolicyRequest {
    pub fn new(
        run_id: impl Into<String>,
        tenant_id: impl Into<String>,
        tool_name: impl Into<String>,
        policy_class: PolicyClass,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            tenant_id: tenant_id.into(),
            tool_name: tool_name.into(),
            policy_class,
            actor: None,
            source: None,
            resource: None,
            approval: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_approval(mut self, approval: Approval) -> Self {
        self.approval = Some(approval);
        self
    }

    /// Part of the tool name before the first `.`.
    pub fn connector_id(&self) -> &str {
        self.tool_name
            .split_once('.')
            .map_or(self.tool_name.as_str(), |(connector, _)| connector)
    }
}

/// Fixed vocabulary explaining every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    AllowReadDefault,
    DenyReadDefault,
    AllowWriteDefault,
    DenyWriteDefault,
    DenyDestructiveDefault,
    AllowRule,
    DenyRule,
    DenyDestructiveNoApproval,
    DenyApprovalMismatch,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllowReadDefault => "ALLOW_READ_DEFAULT",
            Self::DenyReadDefault => "DENY_READ_DEFAULT",
            Self::AllowWriteDefault => "ALLOW_WRITE_DEFAULT",
            Self::DenyWriteDefault => "DENY_WRITE_DEFAULT",
            Self::DenyDestructiveDefault => "DENY_DESTRUCTIVE_DEFAULT",
            Self::AllowRule => "ALLOW_RULE",
            Self::DenyRule => "DENY_RULE",
            Self::DenyDestructiveNoApproval => "DENY_DESTRUCTIVE_NO_APPROVAL",
            Self::DenyApprovalMismatch => "DENY_APPROVAL_MISMATCH",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub allowed: bool,
    pub effect: Effect,
    pub reason_code: ReasonCode,
    /// Rule that decided, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub message: String,
}

impl PolicyDecision {
    fn new(effect: Effect, reason_code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            allowed: effect.is_allow(),
            effect,
            reason_code,
            rule_id: None,
            message: message.into(),
        }
    }

    fn from_rule(rule: &PolicyRule) -> Self {
        let (reason_code, verb) = match rule.effect {
            Effect::Allow => (ReasonCode::AllowRule, "allowed"),
            Effect::Deny => (ReasonCode::DenyRule, "denied"),
        };
        Self {
            rule_id: Some(rule.id.clone()),
            ..Self::new(rule.effect, reason_code, format!("{verb} by rule '{}'", rule.id))
        }
    }
}

/// Evaluates [`PolicyRequest`]s against a loaded [`PolicyDocument`].
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    document: PolicyDocument,
    /// Rules in evaluation order.
    ordered: Vec<PolicyRule>,
    scopes: ScopeTable,
}

impl PolicyEngine {
    /// Validate `document` and merge its scope overrides over the built-in table.
    pub fn new(document: PolicyDocument) -> Result<Self, PolicyError> {
        Self::with_scope_table(document, ScopeTable::builtin())
    }

    pub fn with_scope_table(
        document: PolicyDocument,
        mut scopes: ScopeTable,
    ) -> Result<Self, PolicyError> {
        let summary = document.validate()?;
        scopes.merge(&document.required_scopes);

        let mut ordered = document.rules.clone();
        // stable: equal priorities keep document order
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        tracing::debug!(
            version = %summary.version,
            rules = summary.rule_count,
            scopes = scopes.len(),
            "policy engine loaded"
        );
        Ok(Self {
            document,
            ordered,
            scopes,
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyError> {
        Self::new(PolicyDocument::from_yaml_str(yaml)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self, PolicyError> {
        Self::new(PolicyDocument::from_json_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        Self::new(PolicyDocument::load(path)?)
    }

    pub fn document(&self) -> &PolicyDocument {
        &self.document
    }

    pub fn scopes(&self) -> &ScopeTable {
        &self.scopes
    }

    /// Rules in the order they are evaluated.
    pub fn rules(&self) -> &[PolicyRule] {
        &self.ordered
    }

    pub fn evaluate(&self, req: &PolicyRequest) -> PolicyDecision {
        let decision = self.decide(req);
        tracing::debug!(
            tool = %req.tool_name,
            class = %req.policy_class,
            allowed = decision.allowed,
            reason = %decision.reason_code,
            rule = decision.rule_id.as_deref().unwrap_or("-"),
            "policy decision"
        );
        decision
    }

    fn decide(&self, req: &PolicyRequest) -> PolicyDecision {
        if req.policy_class == PolicyClass::Destructive {
            if let Some(denied) = self.check_approval(req) {
                return denied;
            }
        }

        if let Some(rule) = self.ordered.iter().find(|r| r.conditions.matches(req)) {
            return PolicyDecision::from_rule(rule);
        }

        let doc = &self.document;
        match req.policy_class {
            PolicyClass::Read => match doc.default_read_behavior {
                Effect::Allow => PolicyDecision::new(
                    Effect::Allow,
                    ReasonCode::AllowReadDefault,
                    "read allowed by default",
                ),
                Effect::Deny => PolicyDecision::new(
                    Effect::Deny,
                    ReasonCode::DenyReadDefault,
                    "read denied by default",
                ),
            },
            PolicyClass::WriteNonDestructive => match doc.default_write_behavior {
                Effect::Allow => PolicyDecision::new(
                    Effect::Allow,
                    ReasonCode::AllowWriteDefault,
                    "write allowed by default",
                ),
                Effect::Deny => PolicyDecision::new(
                    Effect::Deny,
                    ReasonCode::DenyWriteDefault,
                    "write denied by default",
                ),
            },
            PolicyClass::Destructive => PolicyDecision::new(
                Effect::Deny,
                ReasonCode::DenyDestructiveDefault,
                "destructive action not allowed by any rule",
            ),
        }
    }

    fn check_approval(&self, req: &PolicyRequest) -> Option<PolicyDecision> {
        let Some(approval) = &req.approval else {
            return Some(PolicyDecision::new(
                Effect::Deny,
                ReasonCode::DenyDestructiveNoApproval,
                format!("destructive tool '{}' requires an approval", req.tool_name),
            ));
        };
        if approval.run_id != req.run_id {
            return Some(PolicyDecision::new(
                Effect::Deny,
                ReasonCode::DenyApprovalMismatch,
                format!(
                    "approval was issued for run '{}', not '{}'",
                    approval.run_id, req.run_id
                ),
            ));
        }
        match self.scopes.required(&req.tool_name) {
            Some(scope) if !approval.grants(scope) => Some(PolicyDecision::new(
                Effect::Deny,
                ReasonCode::DenyApprovalMismatch,
                format!("approval lacks required scope '{scope}'"),
            )),
            _ => None,
        }
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self {
            document: PolicyDocument::default(),
            ordered: Vec::new(),
            scopes: ScopeTable::builtin(),
        }
    }
}
