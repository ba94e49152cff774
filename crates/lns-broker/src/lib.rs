//! Topic fan-out broker that carries remote calls between router instances.
//!
//! The broker keeps no state beyond live subscriptions. Every `Publish` is delivered to every
//! connection subscribed to its topic at that moment, the publisher included, and to nobody
//! else. A slow subscriber loses deliveries instead of stalling the others.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use lns_proto::transport::{read_frame, write_frame};
use lns_proto::{BusFrame, ProtoError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod client;

pub use client::BrokerClient;

/// Deliveries buffered per connection before further ones are dropped.
pub const CONNECTION_BUFFER: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

type ConnectionId = u64;

/// Subscribers per topic.
#[derive(Default)]
struct Topics {
    subscribers: DashMap<String, Vec<(ConnectionId, mpsc::Sender<Bytes>)>>,
}

impl Topics {
    fn subscribe(&self, topic: String, id: ConnectionId, tx: &mpsc::Sender<Bytes>) {
        let mut subscribers = self.subscribers.entry(topic).or_default();
        if !subscribers.iter().any(|(existing, _)| *existing == id) {
            subscribers.push((id, tx.clone()));
        }
    }

    /// Fan `frame` out to the topic's subscribers. Returns how many accepted it.
    fn deliver(&self, topic: &str, frame: Bytes) -> usize {
        let Some(subscribers) = self.subscribers.get(topic) else {
            return 0;
        };
        let mut delivered = 0;
        for (id, tx) in subscribers.iter() {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(target: "lns.broker", topic, connection = id, "subscriber full; dropping delivery");
                }
                // Removed by the connection's own cleanup.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    fn remove_connection(&self, id: ConnectionId) {
        self.subscribers
            .iter_mut()
            .for_each(|mut entry| entry.value_mut().retain(|(existing, _)| *existing != id));
        self.subscribers.retain(|_, subscribers| !subscribers.is_empty());
    }
}

pub struct Broker {
    listener: TcpListener,
    topics: Arc<Topics>,
    next_connection: AtomicU64,
}

impl Broker {
    pub async fn bind(addr: SocketAddr) -> Result<Self, BrokerError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            topics: Arc::new(Topics::default()),
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BrokerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `token` is cancelled.
    pub async fn serve(self, token: CancellationToken) -> Result<(), BrokerError> {
        tracing::info!(target: "lns.broker", addr = ?self.listener.local_addr().ok(), "broker listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                res = self.listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(target: "lns.broker", error = %err, "accept failed");
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);
            let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(target: "lns.broker", connection = id, peer = %peer, "connection accepted");
            tokio::spawn(serve_connection(
                self.topics.clone(),
                id,
                stream,
                token.child_token(),
            ));
        }
    }
}

async fn serve_connection(
    topics: Arc<Topics>,
    id: ConnectionId,
    stream: TcpStream,
    token: CancellationToken,
) {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
    let writer_task = tokio::spawn(write_deliveries(writer, rx, token.clone()));

    let result = tokio::select! {
        _ = token.cancelled() => Ok(()),
        res = read_requests(&topics, id, &mut reader, &tx) => res,
    };

    topics.remove_connection(id);
    token.cancel();
    drop(tx);
    let _ = writer_task.await;

    match result {
        Ok(()) => tracing::debug!(target: "lns.broker", connection = id, "connection closed"),
        Err(err) => tracing::warn!(target: "lns.broker", connection = id, error = %err, "connection failed"),
    }
}

async fn read_requests<R>(
    topics: &Topics,
    id: ConnectionId,
    reader: &mut R,
    tx: &mpsc::Sender<Bytes>,
) -> Result<(), BrokerError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let bytes = match read_frame(reader).await {
            Ok(bytes) => bytes,
            Err(ProtoError::ConnectionClosed) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        match BusFrame::decode(&bytes)? {
            BusFrame::Subscribe { topic } => {
                tracing::debug!(target: "lns.broker", connection = id, topic = %topic, "subscribed");
                topics.subscribe(topic, id, tx);
            }
            BusFrame::Publish { topic, payload } => {
                let frame = BusFrame::Deliver {
                    topic: topic.clone(),
                    payload,
                }
                .encode()?;
                let delivered = topics.deliver(&topic, Bytes::from(frame));
                tracing::trace!(target: "lns.broker", connection = id, topic = %topic, delivered, "published");
            }
            BusFrame::Deliver { topic, .. } => {
                tracing::debug!(target: "lns.broker", connection = id, topic = %topic, "ignoring deliver frame from client");
            }
        }
    }
}

async fn write_deliveries<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>, token: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
    token.cancel();
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_reaches_only_current_subscribers() {
        let topics = Topics::default();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        topics.subscribe("calls".into(), 1, &tx1);
        topics.subscribe("calls".into(), 1, &tx1);
        topics.subscribe("other".into(), 2, &tx2);

        assert_eq!(topics.deliver("calls", Bytes::from_static(b"x")), 1);
        assert_eq!(rx1.recv().await.unwrap(), Bytes::from_static(b"x"));
        assert!(rx1.try_recv().is_err(), "subscribing twice must not duplicate deliveries");
        assert!(rx2.try_recv().is_err());

        topics.remove_connection(1);
        assert_eq!(topics.deliver("calls", Bytes::from_static(b"y")), 0);
        assert!(!topics.subscribers.contains_key("calls"));
    }

    #[tokio::test]
    async fn full_subscriber_does_not_block_the_others() {
        let topics = Topics::default();
        let (slow, _slow_rx) = mpsc::channel(1);
        let (fast, mut fast_rx) = mpsc::channel(8);
        topics.subscribe("calls".into(), 1, &slow);
        topics.subscribe("calls".into(), 2, &fast);

        for _ in 0..3 {
            topics.deliver("calls", Bytes::from_static(b"z"));
        }
        for _ in 0..3 {
            assert_eq!(fast_rx.recv().await.unwrap(), Bytes::from_static(b"z"));
        }
    }
}
