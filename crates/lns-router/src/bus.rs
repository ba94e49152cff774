//! Cross-instance remote call bus.
//!
//! Every instance subscribes to the same channel and sees every envelope. The bus does not
//! filter or acknowledge anything: a handler decides whether this instance owns the target,
//! and envelopes published while an instance is disconnected are simply lost.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use lns_proto::{ProtoError, RemoteCall};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to encode remote call: {0}")]
    Proto(#[from] ProtoError),
    #[error("broadcast transport error: {0}")]
    Transport(String),
}

/// Topic-based publish/subscribe carrier.
#[async_trait]
pub trait BroadcastTransport: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError>;

    /// Start receiving messages published on `channel` from now on.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;
}

/// Stream of raw messages for one channel.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Bytes>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: broadcast::Receiver<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the transport is gone.
    ///
    /// A subscriber that falls behind loses the overwritten messages.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target: "lns.bus",
                        channel = %self.channel,
                        skipped,
                        "subscriber lagged; remote calls lost"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process transport for single-instance deployments and tests.
///
/// Cloning shares the underlying channels, so several routers in one process can talk through
/// clones of one `InMemoryBroadcast`.
#[derive(Debug, Clone)]
pub struct InMemoryBroadcast {
    channels: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl InMemoryBroadcast {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryBroadcast {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl BroadcastTransport for InMemoryBroadcast {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        // No receivers is not an error: nobody owns the target.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        Ok(Subscription::new(channel, self.sender(channel).subscribe()))
    }
}

/// Applies remote calls addressed to this instance.
#[async_trait]
pub trait RemoteCallHandler: Send + Sync + 'static {
    async fn handle(&self, call: RemoteCall);
}

pub struct RemoteCallBus {
    transport: Arc<dyn BroadcastTransport>,
    channel: String,
}

impl RemoteCallBus {
    pub fn new(transport: Arc<dyn BroadcastTransport>, channel: impl Into<String>) -> Self {
        Self {
            transport,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Broadcast `call` to every instance, this one included.
    pub async fn publish(&self, call: &RemoteCall) -> Result<(), BusError> {
        let payload = Bytes::from(call.encode()?);
        tracing::debug!(target: "lns.bus", kind = ?call.kind, target_key = %call.target, "publishing remote call");
        self.transport.publish(&self.channel, payload).await
    }

    /// Subscribe to `channel` and feed every decoded envelope to `handler` until `token` is
    /// cancelled.
    ///
    /// The subscription is live when this returns. Envelopes are handled one at a time, in the
    /// transport's delivery order.
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn RemoteCallHandler>,
        token: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let mut subscription = self.transport.subscribe(channel).await?;
        Ok(tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = token.cancelled() => return,
                    payload = subscription.recv() => payload,
                };
                let Some(payload) = payload else {
                    tracing::warn!(
                        target: "lns.bus",
                        channel = %subscription.channel(),
                        "broadcast transport closed; subscription ended"
                    );
                    return;
                };
                match RemoteCall::decode(&payload) {
                    Ok(call) => handler.handle(call).await,
                    Err(err) => {
                        tracing::warn!(target: "lns.bus", error = %err, "dropping undecodable remote call");
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lns_core::{DevEui, StationEui};
    use tokio::sync::mpsc;

    use super::*;

    struct Forward(mpsc::UnboundedSender<RemoteCall>);

    #[async_trait]
    impl RemoteCallHandler for Forward {
        async fn handle(&self, call: RemoteCall) {
            let _ = self.0.send(call);
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_call_in_order() -> Result<(), BusError> {
        let transport = InMemoryBroadcast::default();
        let bus_a = RemoteCallBus::new(Arc::new(transport.clone()), "calls");
        let bus_b = RemoteCallBus::new(Arc::new(transport), "calls");
        let token = CancellationToken::new();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        bus_a
            .subscribe("calls", Arc::new(Forward(tx_a)), token.clone())
            .await?;
        bus_b
            .subscribe("calls", Arc::new(Forward(tx_b)), token.clone())
            .await?;

        let first = RemoteCall::clear_cache(DevEui::new(1));
        let second = RemoteCall::close_connection(StationEui::new(2));
        bus_a.publish(&first).await?;
        bus_a.publish(&second).await?;

        for rx in [&mut rx_a, &mut rx_b] {
            let got = tokio::time::timeout(Duration::from_secs(5), async {
                (rx.recv().await, rx.recv().await)
            })
            .await
            .expect("calls should arrive");
            assert_eq!(got, (Some(first.clone()), Some(second.clone())));
        }
        token.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_payloads_are_skipped() -> Result<(), BusError> {
        let transport = InMemoryBroadcast::default();
        let bus = RemoteCallBus::new(Arc::new(transport.clone()), "calls");
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("calls", Arc::new(Forward(tx)), token.clone())
            .await?;

        transport
            .publish("calls", Bytes::from_static(b"\xFF\xFF"))
            .await?;
        let call = RemoteCall::clear_cache(DevEui::new(9));
        bus.publish(&call).await?;

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("valid call should still arrive");
        assert_eq!(got, Some(call));
        token.cancel();
        Ok(())
    }
}
