//! `toolgate policy`: validate documents and dry-run decisions.

use std::path::Path;

use anyhow::{Context, Result};
use toolgate_policy::{Approval, ApprovalScope, PolicyClass, PolicyDocument, PolicyEngine, PolicyRequest};

pub fn validate(path: &Path, as_json: bool) -> Result<()> {
    let doc = PolicyDocument::load(path)
        .with_context(|| format!("failed to load policy '{}'", path.display()))?;
    let summary = doc.validate()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("✓ Policy '{}' is valid", path.display());
    println!("  Version:        {}", summary.version);
    println!(
        "  Rules:          {} ({} allow, {} deny)",
        summary.rule_count, summary.allow_rules, summary.deny_rules
    );
    println!("  Default read:   {}", summary.default_read_behavior);
    println!("  Default write:  {}", summary.default_write_behavior);
    println!("  Scope overrides: {}", summary.scope_overrides);

    let engine = PolicyEngine::new(doc)?;
    for rule in engine.rules() {
        let description = rule.description.as_deref().unwrap_or("");
        println!(
            "    [{:>4}] {:<5} {}  {}",
            rule.priority, rule.effect, rule.id, description
        );
    }
    Ok(())
}

/// Request attributes given on the command line.
pub struct CheckArgs {
    pub tool: String,
    pub class: String,
    pub tenant: String,
    pub run: String,
    pub actor: Option<String>,
    pub source: Option<String>,
    pub resource: Option<String>,
    pub approval_run: Option<String>,
    pub scopes: Vec<String>,
}

impl CheckArgs {
    fn into_request(self) -> Result<PolicyRequest> {
        let class: PolicyClass = self.class.parse()?;
        let mut req = PolicyRequest::new(self.run.as_str(), self.tenant, self.tool, class);
        req.actor = self.actor;
        req.source = self.source;
        req.resource = self.resource;

        if self.approval_run.is_some() || !self.scopes.is_empty() {
            let scope = self
                .scopes
                .iter()
                .map(|s| s.parse::<ApprovalScope>())
                .collect::<Result<Vec<_>, _>>()?;
            req.approval = Some(Approval {
                run_id: self.approval_run.unwrap_or(self.run),
                scope,
            });
        }
        Ok(req)
    }
}

/// Evaluate one request. Returns whether it was allowed.
pub fn check(path: &Path, args: CheckArgs, as_json: bool) -> Result<bool> {
    let engine = PolicyEngine::load(path)
        .with_context(|| format!("failed to load policy '{}'", path.display()))?;
    let req = args.into_request()?;
    let decision = engine.evaluate(&req);
    tracing::debug!(tool = %req.tool_name, reason = %decision.reason_code, "evaluated");

    if as_json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else {
        let mark = if decision.allowed { "✓ ALLOW" } else { "✗ DENY" };
        println!("{mark}  {} ({})", req.tool_name, req.policy_class);
        println!("  Reason:  {}", decision.reason_code);
        if let Some(rule) = &decision.rule_id {
            println!("  Rule:    {rule}");
        }
        println!("  Message: {}", decision.message);
    }
    Ok(decision.allowed)
}
