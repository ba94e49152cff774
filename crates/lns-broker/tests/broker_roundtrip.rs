use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use lns_broker::{Broker, BrokerClient};
use lns_config::LnsConfig;
use lns_core::StationEui;
use lns_router::{
    BroadcastTransport, BusError, ConnectionWriter, InMemoryDeviceStore, LnsRouter, SendError,
    Subscription,
};
use tokio_util::sync::CancellationToken;

async fn start_broker(token: &CancellationToken) -> Result<SocketAddr> {
    let broker = Broker::bind("127.0.0.1:0".parse()?).await?;
    let addr = broker.local_addr()?;
    tokio::spawn(broker.serve(token.child_token()));
    Ok(addr)
}

async fn connected_client(addr: SocketAddr, token: &CancellationToken) -> Result<BrokerClient> {
    let client = BrokerClient::connect(addr, 64, token.child_token());
    if !client.wait_connected(Duration::from_secs(5)).await {
        return Err(anyhow!("client never connected to {addr}"));
    }
    Ok(client)
}

/// Subscriptions are registered asynchronously, so keep publishing until one arrives.
async fn publish_until_received(
    publisher: &BrokerClient,
    subscription: &mut Subscription,
    payload: &'static [u8],
) -> Result<Bytes> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            publisher.publish("calls", Bytes::from_static(payload)).await?;
            if let Ok(Some(received)) =
                tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await
            {
                return Ok::<_, BusError>(received);
            }
        }
    })
    .await
    .context("nothing delivered")?
    .context("publish failed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_is_fanned_out_to_every_subscriber() -> Result<()> {
    let token = CancellationToken::new();
    let addr = start_broker(&token).await?;
    let a = connected_client(addr, &token).await?;
    let b = connected_client(addr, &token).await?;

    let mut on_a = a.subscribe("calls").await?;
    let mut on_b = b.subscribe("calls").await?;

    let received = publish_until_received(&a, &mut on_b, b"hello").await?;
    assert_eq!(received, Bytes::from_static(b"hello"));
    // The publisher hears its own envelope too.
    let echoed = tokio::time::timeout(Duration::from_secs(5), on_a.recv())
        .await
        .context("publisher did not receive its own envelope")?;
    assert_eq!(echoed, Some(Bytes::from_static(b"hello")));

    token.cancel();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn topics_subscribed_while_connecting_are_delivered() -> Result<()> {
    let token = CancellationToken::new();
    let addr = start_broker(&token).await?;
    let publisher = connected_client(addr, &token).await?;

    // Subscribe while the first connection is being set up, without waiting for it.
    let client = BrokerClient::connect(addr, 64, token.child_token());
    let mut subscriptions = Vec::new();
    for n in 0..8 {
        subscriptions.push(client.subscribe(&format!("topic-{n}")).await?);
        tokio::task::yield_now().await;
    }
    if !client.wait_connected(Duration::from_secs(5)).await {
        return Err(anyhow!("client never connected to {addr}"));
    }

    for (n, subscription) in subscriptions.iter_mut().enumerate() {
        let topic = format!("topic-{n}");
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                publisher.publish(&topic, Bytes::from_static(b"ping")).await?;
                if let Ok(Some(received)) =
                    tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await
                {
                    return Ok::<_, BusError>(received);
                }
            }
        })
        .await
        .with_context(|| format!("{topic} never delivered"))??;
        assert_eq!(received, Bytes::from_static(b"ping"));
    }

    token.cancel();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publishing_without_a_broker_fails() -> Result<()> {
    let token = CancellationToken::new();
    // Reserve a port and release it so nothing listens there.
    let addr = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    let client = BrokerClient::connect(addr, 64, token.child_token());

    let err = client
        .publish("calls", Bytes::from_static(b"lost"))
        .await
        .expect_err("publish must fail while disconnected");
    assert!(matches!(err, BusError::Transport(_)), "{err:?}");

    token.cancel();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_resubscribes_after_the_broker_restarts() -> Result<()> {
    let outer = CancellationToken::new();
    let broker_token = outer.child_token();
    let addr = start_broker(&broker_token).await?;
    let a = connected_client(addr, &outer).await?;
    let mut on_a = a.subscribe("calls").await?;
    publish_until_received(&a, &mut on_a, b"before").await?;

    broker_token.cancel();
    tokio::time::timeout(Duration::from_secs(5), async {
        while a.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("client never noticed the broker going away")?;

    let restarted = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match Broker::bind(addr).await {
                Ok(broker) => return broker,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .context("rebind broker address")?;
    tokio::spawn(restarted.serve(outer.child_token()));
    if !a.wait_connected(Duration::from_secs(10)).await {
        return Err(anyhow!("client did not reconnect"));
    }

    // Drain anything left from before the restart.
    while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(20), on_a.recv()).await {}
    let received = publish_until_received(&a, &mut on_a, b"after").await?;
    assert_eq!(received, Bytes::from_static(b"after"));

    outer.cancel();
    Ok(())
}

struct ClosableWriter(std::sync::atomic::AtomicBool);

#[async_trait::async_trait]
impl ConnectionWriter for ClosableWriter {
    async fn send(&self, _message: Bytes) -> Result<(), SendError> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn close(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn routers_coordinate_through_the_broker() -> Result<()> {
    let token = CancellationToken::new();
    let addr = start_broker(&token).await?;
    let store = Arc::new(InMemoryDeviceStore::new());

    let mut routers = Vec::new();
    for gateway in ["gw-a", "gw-b"] {
        let mut config = LnsConfig::default();
        config.node.gateway_id = gateway.into();
        let transport = connected_client(addr, &token).await?;
        let router = LnsRouter::new(
            &config,
            store.clone(),
            store.clone(),
            Arc::new(transport),
            token.child_token(),
        )?;
        router.start().await?;
        routers.push(router);
    }
    let (a, b) = (&routers[0], &routers[1]);

    let station = StationEui::new(0xB827_EBFF_FE61_0042);
    let writer = Arc::new(ClosableWriter(Default::default()));
    a.registry().register(station, writer.clone());

    // The subscription may not be registered at the broker yet; repeat until applied.
    tokio::time::timeout(Duration::from_secs(5), async {
        while a.registry().contains(&station) {
            b.control().close_station(station).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .context("close_station never reached the owning router")??;
    assert!(writer.is_closed());

    token.cancel();
    Ok(())
}
