//! Broker-backed [`BroadcastTransport`].
//!
//! A background task owns the TCP connection. It reconnects with exponential backoff and
//! re-subscribes every known topic after each reconnect. Publishing while disconnected fails
//! immediately; the bus does not buffer envelopes for later.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use lns_proto::transport::{read_frame, write_frame};
use lns_proto::{BusFrame, ProtoError};
use lns_router::{BroadcastTransport, BusError, Subscription};
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const OUTBOUND_CAPACITY: usize = 1024;

struct Shared {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl Shared {
    fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[derive(Clone)]
pub struct BrokerClient {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<BusFrame>,
    connected: watch::Receiver<bool>,
}

impl BrokerClient {
    /// Start the connection task. It runs until `token` is cancelled.
    pub fn connect(addr: SocketAddr, capacity: usize, token: CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        });
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (connected_tx, connected) = watch::channel(false);
        tokio::spawn(manage_connection(
            addr,
            shared.clone(),
            outbound_rx,
            connected_tx,
            token,
        ));
        Self {
            shared,
            outbound,
            connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the broker connection is up.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.connected.clone();
        tokio::time::timeout(timeout, connected.wait_for(|up| *up))
            .await
            .is_ok_and(|res| res.is_ok())
    }

    async fn send(&self, frame: BusFrame) -> Result<(), BusError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| BusError::Transport("broker client stopped".into()))
    }
}

#[async_trait]
impl BroadcastTransport for BrokerClient {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Transport("not connected to broker".into()));
        }
        self.send(BusFrame::Publish {
            topic: channel.to_owned(),
            payload: payload.to_vec(),
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let fresh = !self.shared.topics.contains_key(channel);
        let rx = self.shared.sender(channel).subscribe();
        // Disconnected subscriptions are sent by the connection task once it is up.
        if fresh && self.is_connected() {
            self.send(BusFrame::Subscribe {
                topic: channel.to_owned(),
            })
            .await?;
        }
        Ok(Subscription::new(channel, rx))
    }
}

async fn manage_connection(
    addr: SocketAddr,
    shared: Arc<Shared>,
    mut outbound: mpsc::Receiver<BusFrame>,
    connected: watch::Sender<bool>,
    token: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => return,
            res = TcpStream::connect(addr) => res,
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(target: "lns.bus", broker = %addr, error = %err, ?backoff, "broker connect failed");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        backoff = INITIAL_BACKOFF;

        match run_connection(stream, &shared, &mut outbound, &connected, &token).await {
            Ok(()) => return,
            Err(err) => {
                connected.send_replace(false);
                tracing::warn!(target: "lns.bus", broker = %addr, error = %err, "broker connection lost; reconnecting");
            }
        }
    }
}

/// Drive one connection. `Ok` means shutdown was requested, `Err` that the connection broke.
async fn run_connection(
    stream: TcpStream,
    shared: &Arc<Shared>,
    outbound: &mut mpsc::Receiver<BusFrame>,
    connected: &watch::Sender<bool>,
    token: &CancellationToken,
) -> Result<(), ProtoError> {
    let (reader, mut writer) = stream.into_split();

    // Marked connected before the snapshot: a topic added after this point is subscribed by
    // `subscribe` itself, one added before is in the snapshot. The broker ignores repeats.
    connected.send_replace(true);
    let topics: Vec<String> = shared.topics.iter().map(|entry| entry.key().clone()).collect();
    for topic in topics {
        write_frame(&mut writer, &BusFrame::Subscribe { topic }.encode()?).await?;
    }
    let mut deliveries = tokio::spawn(read_deliveries(reader, shared.clone()));
    tracing::info!(target: "lns.bus", "connected to broker");

    let result = loop {
        tokio::select! {
            _ = token.cancelled() => break Ok(()),
            res = &mut deliveries => {
                break Err(match res {
                    Ok(Err(err)) => err,
                    _ => ProtoError::ConnectionClosed,
                });
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break Ok(());
                };
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::warn!(target: "lns.bus", topic = frame.topic(), error = %err, "dropping unencodable bus frame");
                        continue;
                    }
                };
                if let Err(err) = write_frame(&mut writer, &bytes).await {
                    break Err(err);
                }
            }
        }
    };
    deliveries.abort();
    result
}

async fn read_deliveries<R>(mut reader: R, shared: Arc<Shared>) -> Result<(), ProtoError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let bytes = read_frame(&mut reader).await?;
        match BusFrame::decode(&bytes)? {
            BusFrame::Deliver { topic, payload } => {
                if let Some(sender) = shared.topics.get(&topic) {
                    // No live subscription receivers is fine.
                    let _ = sender.send(Bytes::from(payload));
                }
            }
            other => {
                tracing::debug!(target: "lns.bus", topic = other.topic(), "unexpected frame from broker");
            }
        }
    }
}
