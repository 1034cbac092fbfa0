//! sandbox-broker daemon
//!
//! MCP server that dispatches code execution to a remote sandbox instance
//! over a cloud management channel. Environment profiles are loaded from a
//! JSON configuration file (see `sandbox-config --template`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sandbox_broker::config::{ConfigManager, EnvironmentRegistry};
use sandbox_broker::mcp;
use sandbox_broker::session::{SessionRegistry, SessionRegistryConfig};

#[derive(Parser, Debug)]
#[command(name = "sandbox-broker")]
#[command(about = "MCP server for remote sandboxed code execution")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let manager = ConfigManager::load(&args.config).context("Failed to load configuration")?;
    let names = manager.list_environments();
    if names.is_empty() {
        anyhow::bail!("Configuration file {:?} defines no environments", args.config);
    }

    let mut environments = std::collections::HashMap::new();
    for name in &names {
        let config = manager
            .get_config(name)
            .with_context(|| format!("Invalid configuration for environment '{name}'"))?;
        environments.insert(name.clone(), config);
    }

    info!(environments = ?names, "Loaded configuration");

    let session_registry = Arc::new(SessionRegistry::new(SessionRegistryConfig::default()));
    let _reaper = session_registry.start_reaper(std::time::Duration::from_secs(300));

    if args.stdio {
        mcp::serve_stdio(EnvironmentRegistry { environments }, session_registry).await?;
    } else {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    Ok(())
}
