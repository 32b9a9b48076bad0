//! Toolgate CLI: operator tooling for the tool-invocation gateway.
//!
//! # Commands
//! ```text
//! toolgate policy validate --policy <file>
//! toolgate policy check    --policy <file> --tool <connector.tool> --class <CLASS> [...]
//! toolgate config show     --config <file>
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use toolgate_gateway::LogSection;

mod cmd_config;
mod cmd_policy;
mod logging;

#[derive(Parser)]
#[command(
    name = "toolgate",
    about = "Resilient tool-invocation gateway: operator CLI",
    long_about = "
Toolgate CLI: validate policy documents, dry-run policy decisions and
inspect the effective gateway configuration.

ENVIRONMENT VARIABLES:
  RUST_LOG    Log filter directives, e.g. toolgate_policy=debug
",
    version
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Policy document tooling
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Gateway configuration tooling
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Load a policy document and summarise it
    Validate {
        /// Path to the policy file (.yaml, .yml or .json)
        #[arg(long)]
        policy: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate one request against a policy document
    ///
    /// Exits with status 2 when the request is denied.
    Check {
        /// Path to the policy file
        #[arg(long)]
        policy: PathBuf,
        /// Fully qualified tool name, e.g. github.merge_pull_request
        #[arg(long)]
        tool: String,
        /// READ, WRITE_NON_DESTRUCTIVE or DESTRUCTIVE
        #[arg(long)]
        class: String,
        #[arg(long, default_value = "default")]
        tenant: String,
        #[arg(long, default_value = "cli")]
        run: String,
        #[arg(long)]
        actor: Option<String>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        resource: Option<String>,
        /// Run the approval was issued for (default: --run)
        #[arg(long)]
        approval_run: Option<String>,
        /// Approved scope: commit, push, open_pr or merge (repeatable)
        #[arg(long = "scope")]
        scopes: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration with defaults filled in
    Show {
        #[arg(long)]
        config: PathBuf,
        /// Output as JSON instead of YAML
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    logging::init_tracing(&LogSection {
        level: if cli.verbose { "debug" } else { "warn" }.to_string(),
        components: Vec::new(),
        json: cli.log_json,
    });

    match cli.command {
        Commands::Policy { action } => match action {
            PolicyAction::Validate { policy, json } => {
                cmd_policy::validate(&policy, json)?;
                Ok(ExitCode::SUCCESS)
            }
            PolicyAction::Check {
                policy,
                tool,
                class,
                tenant,
                run,
                actor,
                source,
                resource,
                approval_run,
                scopes,
                json,
            } => {
                let args = cmd_policy::CheckArgs {
                    tool,
                    class,
                    tenant,
                    run,
                    actor,
                    source,
                    resource,
                    approval_run,
                    scopes,
                };
                let allowed = cmd_policy::check(&policy, args, json)?;
                Ok(if allowed { ExitCode::SUCCESS } else { ExitCode::from(2) })
            }
        },

        Commands::Config { action } => match action {
            ConfigAction::Show { config, json } => {
                cmd_config::show(&config, json)?;
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}
