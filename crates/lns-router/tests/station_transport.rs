mod router_util;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lns_core::DeviceClass;
use lns_proto::transport::{read_frame, write_frame};
use lns_proto::{RejectReason, StationMessage};
use lns_router::station::StationError;
use lns_router::{serve_station, InMemoryBroadcast, InMemoryDeviceStore, LnsRouter};
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

use router_util::{config, eventually, start_router, twin, uplink, DEVICE_ADDR, S1};

async fn send(stream: &mut DuplexStream, message: &StationMessage) -> Result<()> {
    write_frame(stream, &message.encode()?)
        .await
        .context("write station frame")
}

async fn receive(stream: &mut DuplexStream) -> Result<StationMessage> {
    let bytes = tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
        .await
        .context("timed out waiting for the server")??;
    Ok(StationMessage::decode(&bytes)?)
}

async fn router(token: &CancellationToken) -> Result<Arc<LnsRouter>> {
    let store = Arc::new(InMemoryDeviceStore::new());
    store.insert(twin(DeviceClass::A, Some("gw-a")));
    start_router(&config("gw-a"), &store, &InMemoryBroadcast::default(), token).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn station_gets_downlinks_and_rejections_on_its_socket() -> Result<()> {
    let token = CancellationToken::new();
    let router = router(&token).await?;
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let serve = tokio::spawn(serve_station(router.clone(), server));

    send(&mut client, &StationMessage::Hello { station: S1 }).await?;
    eventually(|| router.registry().contains(&S1)).await?;

    send(&mut client, &StationMessage::Uplink(uplink(5, true))).await?;
    match receive(&mut client).await? {
        StationMessage::Downlink(downlink) => {
            assert!(downlink.ack);
            assert_eq!(downlink.dev_addr, DEVICE_ADDR);
        }
        other => return Err(anyhow!("expected a downlink, got {other:?}")),
    }

    // Not a station message at all; the connection must survive it.
    write_frame(&mut client, &[0xFF; 7]).await?;

    send(&mut client, &StationMessage::Uplink(uplink(3, false))).await?;
    let rejected = receive(&mut client).await?;
    assert_eq!(
        rejected,
        StationMessage::Rejected {
            dev_addr: DEVICE_ADDR,
            fcnt: 3,
            reason: RejectReason::InvalidFrameCounter,
        }
    );

    send(
        &mut client,
        &StationMessage::Close {
            reason: "maintenance".into(),
        },
    )
    .await?;
    serve
        .await
        .context("station task panicked")?
        .context("station task failed")?;
    assert!(!router.registry().contains(&S1));

    token.cancel();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn each_uplink_gets_one_answer_while_the_store_is_down() -> Result<()> {
    let token = CancellationToken::new();
    let store = Arc::new(InMemoryDeviceStore::new());
    store.insert(twin(DeviceClass::C, Some("gw-a")));
    let router = start_router(&config("gw-a"), &store, &InMemoryBroadcast::default(), &token).await?;
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let _serve = tokio::spawn(serve_station(router.clone(), server));

    send(&mut client, &StationMessage::Hello { station: S1 }).await?;
    eventually(|| router.registry().contains(&S1)).await?;
    send(&mut client, &StationMessage::Uplink(uplink(5, true))).await?;
    assert!(matches!(
        receive(&mut client).await?,
        StationMessage::Downlink(downlink) if downlink.fcnt_down == 11
    ));

    store.set_available(false);
    for fcnt in 6..=15 {
        send(&mut client, &StationMessage::Uplink(uplink(fcnt, true))).await?;
    }
    // Batched saves are not due until uplink 15; that one is rejected instead of answered.
    for fcnt in 6..=14u32 {
        match receive(&mut client).await? {
            StationMessage::Downlink(downlink) => assert_eq!(downlink.fcnt_down, fcnt + 6),
            other => return Err(anyhow!("expected a downlink for {fcnt}, got {other:?}")),
        }
    }
    assert_eq!(
        receive(&mut client).await?,
        StationMessage::Rejected {
            dev_addr: DEVICE_ADDR,
            fcnt: 15,
            reason: RejectReason::FrameCounterUpdateFailed,
        }
    );
    let extra = tokio::time::timeout(Duration::from_millis(200), read_frame(&mut client)).await;
    assert!(extra.is_err(), "uplink answered twice: {extra:?}");

    token.cancel();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_message_must_be_hello() -> Result<()> {
    let token = CancellationToken::new();
    let router = router(&token).await?;
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let serve = tokio::spawn(serve_station(router.clone(), server));

    send(&mut client, &StationMessage::Uplink(uplink(5, true))).await?;
    let result = serve.await.context("station task panicked")?;
    assert!(
        matches!(result, Err(StationError::UnexpectedFirstMessage("Uplink"))),
        "{result:?}"
    );
    assert!(router.registry().is_empty());

    token.cancel();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnecting_station_replaces_its_old_connection() -> Result<()> {
    let token = CancellationToken::new();
    let router = router(&token).await?;

    let (mut old_client, old_server) = tokio::io::duplex(64 * 1024);
    let old = tokio::spawn(serve_station(router.clone(), old_server));
    send(&mut old_client, &StationMessage::Hello { station: S1 }).await?;
    eventually(|| router.registry().contains(&S1)).await?;

    let (mut new_client, new_server) = tokio::io::duplex(64 * 1024);
    let new = tokio::spawn(serve_station(router.clone(), new_server));
    send(&mut new_client, &StationMessage::Hello { station: S1 }).await?;

    tokio::time::timeout(Duration::from_secs(5), old)
        .await
        .context("replaced connection kept running")?
        .context("station task panicked")?
        .context("replaced connection failed")?;
    assert!(router.registry().contains(&S1), "new connection must stay registered");

    send(&mut new_client, &StationMessage::Uplink(uplink(5, true))).await?;
    assert!(matches!(
        receive(&mut new_client).await?,
        StationMessage::Downlink(_)
    ));

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), new)
        .await
        .context("shutdown did not stop the station task")?
        .context("station task panicked")?
        .context("station task failed")?;
    Ok(())
}
