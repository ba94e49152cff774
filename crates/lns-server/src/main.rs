use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use lns_config::init_tracing;
use lns_server::{load_config, Instance};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "lns-server", version, about = "LoRaWAN network server router instance")]
struct Args {
    /// Path to the TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override `stations.listen`
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Override `bus.broker`
    #[arg(long)]
    broker: Option<SocketAddr>,
    /// Override `node.gateway_id`
    #[arg(long)]
    gateway_id: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    // Tracing has to be up before config diagnostics are reported.
    let logging = match &args.config {
        Some(path) => lns_config::LnsConfig::load_from_path(path)
            .map(|config| config.logging)
            .unwrap_or_default(),
        None => Default::default(),
    };
    init_tracing(&logging);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.stations.listen = listen;
    }
    if let Some(broker) = args.broker {
        config.bus.broker = Some(broker);
    }
    if let Some(gateway_id) = args.gateway_id {
        config.node.gateway_id = gateway_id;
    }

    let token = CancellationToken::new();
    let instance = Instance::start(&config, token.clone()).await?;

    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "lns.server", "shutdown requested");
        }
        shutdown.cancel();
    });

    instance.serve().await
}
