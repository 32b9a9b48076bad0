//! Tracing subscriber setup for the CLI.

use toolgate_gateway::LogSection;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter directive string, e.g. `warn,toolgate_policy=debug`.
pub fn directives(config: &LogSection) -> String {
    let mut directives = config.level.clone();
    for component in &config.components {
        directives.push(',');
        directives.push_str(&component.replace('-', "_"));
    }
    directives
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `config`.
pub fn init_tracing(config: &LogSection) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(config)))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // logs go to stderr so command output stays pipeable
    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
