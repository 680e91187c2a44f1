//! Roundhouse server binary

use clap::Parser;
use roundhouse::api::ApiServer;
use roundhouse::{ConfigLoader, EngineBuilder, EngineConfig, Scheduler};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "roundhouse")]
#[command(about = "Real-time round-based betting engine", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,

    /// Write the default configuration to this path and exit
    #[arg(long)]
    write_default_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(path) = args.write_default_config {
        ConfigLoader::save(&EngineConfig::default(), &path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.monitoring.log_filter.clone().into()),
        )
        .init();

    info!(
        modes = config.modes.len(),
        storage = ?config.storage.backend,
        data_dir = %config.storage.data_dir.display(),
        "Starting roundhouse"
    );

    let server_config = config.server.clone();
    let engine = EngineBuilder::new(config).build().await?;
    engine.recover().await;

    let scheduler = Scheduler::start(engine.clone());
    let result = ApiServer::new(server_config, engine).run().await;
    scheduler.shutdown();
    result
}
