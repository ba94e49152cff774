//! Process wiring for an LNS router instance.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lns_broker::BrokerClient;
use lns_config::{ConfigDiagnostics, LnsConfig};
use lns_router::{BroadcastTransport, InMemoryBroadcast, InMemoryDeviceStore, LnsRouter};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long startup waits for the broker before serving stations anyway.
const BROKER_CONNECT_GRACE: Duration = Duration::from_secs(2);

/// Load `path` (or defaults), log every diagnostic and refuse configs with errors.
pub fn load_config(path: Option<&Path>) -> Result<LnsConfig> {
    let Some(path) = path else {
        return Ok(LnsConfig::default());
    };
    let (config, diagnostics) = LnsConfig::load_from_path_with_diagnostics(path)
        .with_context(|| format!("load config {}", path.display()))?;
    report_diagnostics(path, &diagnostics)?;
    Ok(config)
}

fn report_diagnostics(path: &Path, diagnostics: &ConfigDiagnostics) -> Result<()> {
    for key in &diagnostics.unknown_keys {
        tracing::warn!(target: "lns.config", path = %path.display(), key = %key, "unknown config key");
    }
    for warning in &diagnostics.warnings {
        tracing::warn!(target: "lns.config", path = %path.display(), ?warning, "config warning");
    }
    if diagnostics.errors.is_empty() {
        return Ok(());
    }
    for error in &diagnostics.errors {
        tracing::error!(target: "lns.config", path = %path.display(), ?error, "invalid config");
    }
    Err(anyhow!(
        "config {} has {} error(s): {:?}",
        path.display(),
        diagnostics.errors.len(),
        diagnostics.errors
    ))
}

/// A running instance: router, its background tasks and the station listener.
pub struct Instance {
    pub router: Arc<LnsRouter>,
    pub listener: TcpListener,
    tasks: Vec<JoinHandle<()>>,
}

impl Instance {
    pub async fn start(config: &LnsConfig, token: CancellationToken) -> Result<Self> {
        let store = Arc::new(
            InMemoryDeviceStore::from_seeds(&config.devices).context("seed device store")?,
        );
        let transport: Arc<dyn BroadcastTransport> = match config.bus.broker {
            Some(addr) => {
                let client =
                    BrokerClient::connect(addr, config.bus.channel_capacity, token.child_token());
                if !client.wait_connected(BROKER_CONNECT_GRACE).await {
                    tracing::warn!(target: "lns.server", broker = %addr, "broker not reachable yet; remote calls fail until it is");
                }
                Arc::new(client)
            }
            None => Arc::new(InMemoryBroadcast::new(config.bus.channel_capacity)),
        };

        let router = LnsRouter::new(config, store.clone(), store, transport, token)
            .context("build router")?;
        let tasks = router.start().await.context("start router")?;
        let listener = TcpListener::bind(config.stations.listen)
            .await
            .with_context(|| format!("bind station listener {}", config.stations.listen))?;
        tracing::info!(
            target: "lns.server",
            gateway = %router.gateway(),
            listen = ?listener.local_addr().ok(),
            devices = config.devices.len(),
            "instance started"
        );
        Ok(Self {
            router,
            listener,
            tasks,
        })
    }

    /// Accept station connections until the router is shut down.
    pub async fn serve(self) -> Result<()> {
        let token = self.router.cancellation().clone();
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                res = self.listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(target: "lns.server", error = %err, "station accept failed");
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);
            let router = self.router.clone();
            tokio::spawn(async move {
                if let Err(err) = lns_router::serve_station(router, stream).await {
                    tracing::debug!(target: "lns.server", peer = %peer, error = %err, "station session ended with error");
                }
            });
        }

        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!(target: "lns.server", "instance stopped");
        Ok(())
    }
}
