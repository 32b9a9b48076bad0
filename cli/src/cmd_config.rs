//! `toolgate config show`: print the effective gateway configuration.

use std::path::Path;

use anyhow::{Context, Result};
use toolgate_gateway::GatewayConfig;
use toolgate_policy::PolicyEngine;

pub fn show(path: &Path, as_json: bool) -> Result<()> {
    let config = GatewayConfig::load(path)
        .with_context(|| format!("failed to load config '{}'", path.display()))?;

    // fail early on a config that points at a broken policy
    if let Some(policy_path) = &config.policy_path {
        PolicyEngine::load(policy_path)
            .with_context(|| format!("policyPath '{}' is invalid", policy_path.display()))?;
        tracing::debug!(policy = %policy_path.display(), "policy document loads");
    }

    if as_json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
    }
    Ok(())
}
