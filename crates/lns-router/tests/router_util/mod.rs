#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use lns_config::LnsConfig;
use lns_core::{DevAddr, DevEui, DeviceClass, GatewayId, StationEui};
use lns_proto::{RadioMetadata, StationMessage, UplinkFrame};
use lns_router::{
    ConnectionWriter, DeviceTwin, InMemoryBroadcast, InMemoryDeviceStore, LnsRouter, SendError,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEVICE: DevEui = DevEui::new(0x0004_A30B_001C_0530);
pub const DEVICE_ADDR: DevAddr = DevAddr::new(0x2601_1F2A);
pub const S1: StationEui = StationEui::new(0xB827_EBFF_FE61_0001);
pub const S2: StationEui = StationEui::new(0xB827_EBFF_FE61_0002);

/// Writer that records every message it is asked to send.
pub struct RecordingWriter {
    tx: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
}

impl RecordingWriter {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }
}

#[async_trait]
impl ConnectionWriter for RecordingWriter {
    async fn send(&self, message: Bytes) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.tx.send(message).map_err(|_| SendError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn config(gateway_id: &str) -> LnsConfig {
    let mut config = LnsConfig::default();
    config.node.gateway_id = gateway_id.to_owned();
    config.dedup.window_ms = 200;
    config
}

pub fn twin(class: DeviceClass, gateway_id: Option<&str>) -> DeviceTwin {
    DeviceTwin {
        dev_eui: DEVICE,
        dev_addr: DEVICE_ADDR,
        class,
        gateway_id: gateway_id.map(|id| GatewayId::new(id).expect("valid gateway id")),
        relaxed_counters: false,
        fcnt_up: 4,
        fcnt_down: 0,
        newly_joined: false,
        last_station: None,
    }
}

pub fn uplink(fcnt: u16, confirmed: bool) -> UplinkFrame {
    UplinkFrame {
        dev_addr: DEVICE_ADDR,
        fcnt,
        mic: 0x1234_5678 ^ u32::from(fcnt),
        confirmed,
        fport: Some(1),
        payload: vec![0x01, 0x02, 0x03],
        radio: RadioMetadata {
            rssi: -90.0,
            snr: 6.5,
            frequency_hz: 868_300_000,
            data_rate: 5,
        },
        received_at_ms: 1_700_000_000_000,
    }
}

/// One router instance sharing `store` and `transport` with its peers.
pub async fn start_router(
    config: &LnsConfig,
    store: &Arc<InMemoryDeviceStore>,
    transport: &InMemoryBroadcast,
    token: &CancellationToken,
) -> Result<Arc<LnsRouter>> {
    let router = LnsRouter::new(
        config,
        store.clone(),
        store.clone(),
        Arc::new(transport.clone()),
        token.child_token(),
    )
    .context("build router")?;
    router.start().await.context("start router")?;
    Ok(router)
}

pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Result<StationMessage> {
    let bytes = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .context("timed out waiting for a station message")?
        .ok_or_else(|| anyhow!("writer channel closed"))?;
    StationMessage::decode(&bytes).context("decode station message")
}

pub async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Bytes>) {
    let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(extra.is_err(), "unexpected station message: {extra:?}");
}

pub async fn eventually(mut condition: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .context("condition not reached in time")
}
