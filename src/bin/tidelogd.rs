//! tidelogd - a replicated commit-log node.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tidelog::{Agent, AgentConfig, Config};

#[derive(Parser, Debug)]
#[command(name = "tidelogd")]
#[command(about = "Replicated append-only commit log node")]
struct Args {
    /// Unique node identifier within the cluster
    #[arg(long, default_value = "node1")]
    node_id: String,

    /// Address the shared listener binds to
    #[arg(long, default_value = "127.0.0.1:8400")]
    bind_addr: String,

    /// Directory for log segments and consensus state
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Start a fresh single-node cluster
    #[arg(long)]
    bootstrap: bool,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating data dir {:?}", args.data_dir))?;

    let agent = Agent::new(AgentConfig {
        data_dir: args.data_dir,
        bind_addr: args.bind_addr,
        node_name: args.node_id,
        bootstrap: args.bootstrap,
        config: Config::default(),
    })
    .await
    .context("starting agent")?;

    info!("listening on {}", agent.rpc_addr());
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    agent.shutdown().await?;
    Ok(())
}
