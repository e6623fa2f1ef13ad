//! GridMesh Manager daemon
//!
//! Standalone control-plane process: loads configuration, initializes
//! tracing, and runs the dispatcher loop. Without a real agent fleet the
//! daemon wires in the loopback agent, which is enough to operate the
//! scheduler against simulated workers.

use anyhow::{Context, Result};
use clap::Parser;
use gridmesh_manager::config::ManagerConfig;
use gridmesh_manager::dispatcher::ManagerContext;
use gridmesh_manager::rpc::{LoopbackAgent, NullStorageProxy};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gridmesh-manager", version, about = "GridMesh session scheduler daemon")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "GRIDMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info,gridmesh_manager=debug"
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ManagerConfig::load(args.config.as_deref())
        .context("failed to load manager configuration")?;
    info!(?config, "configuration loaded");

    let (agent_client, notices) = LoopbackAgent::new();
    let storage = NullStorageProxy::new();
    let context = ManagerContext::start(config, agent_client, storage, notices)
        .context("failed to start manager context")?;

    let dispatcher = tokio::spawn(context.clone().run());

    tokio::signal::ctrl_c().await.context("failed to wait for shutdown signal")?;
    info!("shutting down");
    context.stop();
    dispatcher.await.context("dispatcher task panicked")?;
    Ok(())
}
