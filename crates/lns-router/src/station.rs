//! Station socket transport.
//!
//! One connection per station: a read loop, an intake task that hands uplinks to the router in
//! arrival order, and a writer task draining the outbound channel. The read loop never waits for
//! a frame to be processed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lns_core::{DevAddr, StationEui};
use lns_proto::transport::{read_frame, write_frame};
use lns_proto::{ProtoError, RejectReason, StationMessage, UplinkFrame};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RequestFailure;
use crate::queue::OutcomeReceiver;
use crate::registry::{ConnectionWriter, RegistryHandle, SendError};
use crate::LnsRouter;

/// Outbound messages buffered per station before senders wait.
pub const STATION_OUTBOUND_CAPACITY: usize = 64;

/// Uplinks buffered between the read loop and the router; beyond this they are dropped.
const STATION_INTAKE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StationError {
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("expected Hello as first station message, got {0}")]
    UnexpectedFirstMessage(&'static str),
    #[error("station did not say hello within {0:?}")]
    HelloTimeout(Duration),
}

fn message_kind(message: &StationMessage) -> &'static str {
    match message {
        StationMessage::Hello { .. } => "Hello",
        StationMessage::Uplink(_) => "Uplink",
        StationMessage::Downlink(_) => "Downlink",
        StationMessage::Rejected { .. } => "Rejected",
        StationMessage::Close { .. } => "Close",
    }
}

/// Registry writer backed by the connection's writer task.
pub struct StationWriter {
    tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl StationWriter {
    pub fn new(tx: mpsc::Sender<Bytes>, closed: CancellationToken) -> Self {
        Self { tx, closed }
    }
}

#[async_trait]
impl ConnectionWriter for StationWriter {
    async fn send(&self, message: Bytes) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.tx.send(message).await.map_err(|_| SendError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Serve one station connection until it closes, is replaced, or the router shuts down.
pub async fn serve_station<S>(router: Arc<LnsRouter>, stream: S) -> Result<(), StationError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);

    let hello_timeout = router.hello_timeout();
    let hello = tokio::time::timeout(hello_timeout, read_frame(&mut reader))
        .await
        .map_err(|_| StationError::HelloTimeout(hello_timeout))??;
    let station = match StationMessage::decode(&hello)? {
        StationMessage::Hello { station } => station,
        other => return Err(StationError::UnexpectedFirstMessage(message_kind(&other))),
    };

    let connection = router.cancellation().child_token();
    let (tx, rx) = mpsc::channel(STATION_OUTBOUND_CAPACITY);
    let guard = router.registry().register_guarded(
        station,
        Arc::new(StationWriter::new(tx, connection.clone())),
    );
    let handle = guard.handle().clone();
    tracing::info!(target: "lns.router", station = %station, generation = handle.generation, "station connected");

    let writer_task = tokio::spawn(write_loop(writer, rx, connection.clone(), station));
    let (intake_tx, intake_rx) = mpsc::channel(STATION_INTAKE_CAPACITY);
    let intake_task = tokio::spawn(intake_loop(router.clone(), handle, intake_rx));

    let result = read_loop(&router, station, &mut reader, &intake_tx, &connection).await;

    connection.cancel();
    drop(intake_tx);
    drop(guard);
    let _ = writer_task.await;
    let _ = intake_task.await;

    match &result {
        Ok(()) => tracing::info!(target: "lns.router", station = %station, "station disconnected"),
        Err(err) => {
            tracing::warn!(target: "lns.router", station = %station, error = %err, "station connection failed")
        }
    }
    result
}

async fn read_loop<R>(
    router: &LnsRouter,
    station: StationEui,
    reader: &mut R,
    intake: &mpsc::Sender<UplinkFrame>,
    connection: &CancellationToken,
) -> Result<(), StationError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = connection.cancelled() => return Ok(()),
            frame = read_frame(reader) => frame,
        };
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(ProtoError::ConnectionClosed) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        router.registry().touch(&station);

        // A bad message never tears down the socket; only framing errors do.
        match StationMessage::decode(&bytes) {
            Ok(StationMessage::Uplink(frame)) => match intake.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    tracing::warn!(
                        target: "lns.router",
                        station = %station,
                        dev_addr = %frame.dev_addr,
                        "station intake full; dropping uplink"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Ok(()),
            },
            Ok(StationMessage::Close { reason }) => {
                tracing::info!(target: "lns.router", station = %station, reason = %reason, "station closed connection");
                return Ok(());
            }
            Ok(other) => {
                tracing::debug!(
                    target: "lns.router",
                    station = %station,
                    kind = message_kind(&other),
                    "ignoring unexpected station message"
                );
            }
            Err(err) => {
                tracing::warn!(target: "lns.router", station = %station, error = %err, "dropping undecodable station message");
            }
        }
    }
}

async fn intake_loop(
    router: Arc<LnsRouter>,
    handle: RegistryHandle<StationEui>,
    mut rx: mpsc::Receiver<UplinkFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let (dev_addr, fcnt) = (frame.dev_addr, frame.fcnt);
        let outcome = router.submit_uplink_on(handle.clone(), frame).await;
        tokio::spawn(report_outcome(
            router.clone(),
            handle.clone(),
            dev_addr,
            fcnt,
            outcome,
        ));
    }
}

/// Wait for the terminal outcome and answer counter failures with an explicit rejection.
async fn report_outcome(
    router: Arc<LnsRouter>,
    handle: RegistryHandle<StationEui>,
    dev_addr: DevAddr,
    fcnt: u16,
    outcome: OutcomeReceiver,
) {
    let failure = match outcome.outcome().await {
        Ok(processed) => {
            tracing::trace!(target: "lns.router", dev_addr = %dev_addr, fcnt, ?processed, "uplink processed");
            return;
        }
        Err(failure) => failure,
    };

    let reason = match &failure {
        RequestFailure::InvalidFrameCounter { .. } => RejectReason::InvalidFrameCounter,
        RequestFailure::FrameCounterUpdateFailed(_) => RejectReason::FrameCounterUpdateFailed,
        other => {
            tracing::debug!(
                target: "lns.router",
                dev_addr = %dev_addr,
                fcnt,
                class = ?other.class(),
                error = %other,
                "uplink dropped"
            );
            return;
        }
    };

    let message = StationMessage::Rejected {
        dev_addr,
        fcnt,
        reason,
    };
    let bytes = match message.encode() {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            tracing::warn!(target: "lns.router", error = %err, "failed to encode rejection");
            return;
        }
    };
    match router.registry().send_with_handle(&handle, bytes).await {
        Ok(()) => {}
        Err(SendError::Stale) => {
            tracing::debug!(
                target: "lns.router",
                station = %handle.key,
                "station reconnected before rejection; dropping it"
            );
        }
        Err(err) => {
            tracing::debug!(target: "lns.router", station = %handle.key, error = %err, "rejection not delivered");
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    connection: CancellationToken,
    station: StationEui,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = connection.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else {
            break;
        };
        if let Err(err) = write_frame(&mut writer, &message).await {
            tracing::warn!(target: "lns.router", station = %station, error = %err, "station write failed");
            break;
        }
    }
    // Makes the registry entry prunable even if the read side is still open.
    connection.cancel();
    let _ = writer.shutdown().await;
}
