use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use lns_broker::Broker;
use lns_config::{init_tracing, LoggingConfig};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "lns-broker", version, about = "Remote call broker for LNS router instances")]
struct Args {
    /// Address to accept router connections on
    #[arg(long, default_value = "127.0.0.1:5100")]
    listen: SocketAddr,
    /// Log filter directives, e.g. `info` or `lns.broker=debug`
    #[arg(long, default_value = "info")]
    log: String,
    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
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
    init_tracing(&LoggingConfig {
        level: args.log,
        json: args.json,
        ..LoggingConfig::default()
    });

    let broker = Broker::bind(args.listen)
        .await
        .with_context(|| format!("bind broker listener {}", args.listen))?;
    let token = CancellationToken::new();

    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "lns.broker", "shutdown requested");
        }
        shutdown.cancel();
    });

    broker.serve(token).await.context("broker failed")?;
    Ok(())
}
