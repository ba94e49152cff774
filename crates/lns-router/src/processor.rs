//! Lane handler: counter validation, downlink decision and dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use lns_core::fcnt::{check_up, UpCounterCheck};
use lns_core::{DeviceClass, GatewayId, StationEui};
use lns_proto::{CloudToDeviceMessage, DownlinkFrame, StationMessage, UplinkFrame};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{DispatchError, DownlinkDispatcher};
use crate::error::RequestFailure;
use crate::frame_counter::{FrameCounterStrategies, FrameCounterStrategy};
use crate::queue::{
    DeviceRequest, DeviceRequestHandler, DownlinkOutcome, Processed, RequestKind, RequestOutcome,
};
use crate::registry::{RegistryHandle, SendError};
use crate::session::DeviceSession;
use crate::store::{DeviceStore, StoreError};

fn backend(err: StoreError) -> RequestFailure {
    RequestFailure::BackendUnavailable(err.to_string())
}

/// What a downlink answers. Decides how its down-counter is claimed.
#[derive(Debug, Clone, Copy)]
enum Answer<'a> {
    /// Claimed per uplink: several instances may have heard it.
    Uplink(u32),
    /// Claimed per message id, independent of the uplink claims.
    CloudMessage(&'a str),
}

/// Where the downlink goes.
#[derive(Debug, Clone, Copy)]
struct Destination<'a> {
    station: StationEui,
    /// The connection that carried the uplink being answered, if it is known.
    connection: Option<&'a RegistryHandle<StationEui>>,
}

pub struct UplinkProcessor {
    gateway: GatewayId,
    store: Arc<dyn DeviceStore>,
    strategies: Arc<FrameCounterStrategies>,
    dispatcher: Arc<DownlinkDispatcher>,
}

impl UplinkProcessor {
    pub fn new(
        gateway: GatewayId,
        store: Arc<dyn DeviceStore>,
        strategies: Arc<FrameCounterStrategies>,
        dispatcher: Arc<DownlinkDispatcher>,
    ) -> Self {
        Self {
            gateway,
            store,
            strategies,
            dispatcher,
        }
    }

    /// Reload an untrusted session and skip ahead past down-counters that may have been used.
    async fn reconcile(&self, session: &DeviceSession) -> Result<(), RequestFailure> {
        let failed = |err: StoreError| RequestFailure::FrameCounterUpdateFailed(err.to_string());

        let twin = self.store.load(session.dev_eui).await.map_err(failed)?;
        session.reconcile(&twin, self.strategies.reload_skip(session.is_single_gateway()));
        let strategy = self.strategies.for_session(session);
        if let Err(err) = strategy.save_changes(session, true).await {
            return Err(failed(err));
        }
        tracing::info!(
            target: "lns.router",
            dev_eui = %session.dev_eui,
            "session counters reconciled"
        );
        Ok(())
    }

    /// Accept or reject the uplink counter. Returns the 32-bit counter.
    async fn validate_counter(
        &self,
        session: &DeviceSession,
        strategy: &dyn FrameCounterStrategy,
        frame: &UplinkFrame,
        marked_duplicate: bool,
    ) -> Result<u32, RequestFailure> {
        let (last, has_history) = session.with_state(|state| (state.fcnt_up, !state.newly_joined));
        let observed = match check_up(last, frame.fcnt, has_history) {
            UpCounterCheck::Newer(value) => return Ok(value),
            // A confirmed uplink is retransmitted until acknowledged, and a marked duplicate is
            // the copy of a frame another station already delivered.
            UpCounterCheck::Repeated(value) if frame.confirmed || marked_duplicate => {
                return Ok(value)
            }
            UpCounterCheck::Repeated(value) => value,
            UpCounterCheck::Invalid { observed, .. } => observed,
        };

        // A device restart shows up as a small raw wire counter.
        let restarted = u32::from(frame.fcnt);
        if session.relaxed_counters
            && strategy
                .reset(session, restarted, &self.gateway)
                .await
                .map_err(backend)?
        {
            return Ok(restarted);
        }

        Err(RequestFailure::InvalidFrameCounter { last, observed })
    }

    async fn process_uplink(
        &self,
        session: &DeviceSession,
        frame: &UplinkFrame,
        destination: Destination<'_>,
        marked_duplicate: bool,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        let strategy = self.strategies.for_session(session);
        let fcnt_up = self
            .validate_counter(session, strategy, frame, marked_duplicate)
            .await?;
        session.with_state(|state| state.record_uplink(fcnt_up, destination.station));

        if marked_duplicate {
            self.save(session, strategy, false).await?;
            return Ok(Processed::default());
        }

        let pending = if session.class == DeviceClass::A {
            self.store
                .take_cloud_to_device(session.dev_eui)
                .await
                .map_err(backend)?
        } else {
            None
        };

        if !frame.confirmed && pending.is_none() {
            self.save(session, strategy, false).await?;
            return Ok(Processed::default());
        }

        let downlink = |fcnt_down: u32| DownlinkFrame {
            dev_eui: session.dev_eui,
            dev_addr: session.dev_addr,
            fcnt_down,
            ack: frame.confirmed,
            fport: pending.as_ref().and_then(|message| message.fport),
            payload: pending
                .as_ref()
                .map(|message| message.payload.clone())
                .unwrap_or_default(),
            class: session.class,
            message_id: pending.as_ref().map(|message| message.message_id.clone()),
        };
        self.send(
            session,
            strategy,
            destination,
            Answer::Uplink(fcnt_up),
            downlink,
            cancel,
        )
        .await
    }

    async fn process_cloud_to_device(
        &self,
        session: &DeviceSession,
        message: &CloudToDeviceMessage,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        if session.class == DeviceClass::A {
            // Delivered in the receive window after the next uplink.
            self.store
                .enqueue_cloud_to_device(session.dev_eui, message.clone())
                .await
                .map_err(backend)?;
            return Ok(Processed::default());
        }

        let Some(station) = session.last_station() else {
            return Err(RequestFailure::DownlinkFailed(
                "no station has heard the device yet".into(),
            ));
        };
        let strategy = self.strategies.for_session(session);
        let downlink = |fcnt_down: u32| DownlinkFrame {
            dev_eui: session.dev_eui,
            dev_addr: session.dev_addr,
            fcnt_down,
            ack: false,
            fport: message.fport,
            payload: message.payload.clone(),
            class: session.class,
            message_id: Some(message.message_id.clone()),
        };
        let destination = Destination {
            station,
            connection: None,
        };
        self.send(
            session,
            strategy,
            destination,
            Answer::CloudMessage(&message.message_id),
            downlink,
            cancel,
        )
        .await
    }

    /// Claim the next down-counter, persist if a save is due, then dispatch.
    ///
    /// A due save that fails suppresses the downlink, so a counter never goes on the air ahead
    /// of a failed write.
    async fn send(
        &self,
        session: &DeviceSession,
        strategy: &dyn FrameCounterStrategy,
        destination: Destination<'_>,
        answer: Answer<'_>,
        build: impl FnOnce(u32) -> DownlinkFrame + Send,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        let claimed = match answer {
            Answer::Uplink(fcnt_up) => strategy.next_down_counter(session, fcnt_up).await,
            Answer::CloudMessage(message_id) => {
                strategy.next_down_for_message(session, message_id).await
            }
        }
        .map_err(backend)?;

        let Some(fcnt_down) = claimed else {
            return match answer {
                Answer::Uplink(fcnt_up) => {
                    tracing::debug!(
                        target: "lns.router",
                        dev_eui = %session.dev_eui,
                        fcnt_up,
                        "another gateway answers this uplink"
                    );
                    self.save(session, strategy, false).await?;
                    Ok(Processed::default())
                }
                Answer::CloudMessage(message_id) => Err(RequestFailure::DownlinkFailed(format!(
                    "cloud message {message_id} already delivered by another gateway"
                ))),
            };
        };

        if cancel.is_cancelled() {
            strategy.release_down_counter(session, fcnt_down);
            return Err(RequestFailure::Cancelled);
        }

        if let Err(failure) = self.save(session, strategy, false).await {
            strategy.release_down_counter(session, fcnt_down);
            return Err(failure);
        }

        let message = StationMessage::Downlink(build(fcnt_down));
        let dispatched = match destination.connection {
            Some(handle) => self.dispatcher.dispatch_on(handle, &message).await,
            None => self.dispatcher.dispatch(destination.station, &message).await,
        };
        let route = match dispatched {
            Ok(route) => route,
            Err(err) => {
                strategy.release_down_counter(session, fcnt_down);
                return Err(match err {
                    DispatchError::Local(SendError::Stale) => RequestFailure::ConnectionStale,
                    err => RequestFailure::DownlinkFailed(err.to_string()),
                });
            }
        };

        Ok(Processed {
            downlink: Some(DownlinkOutcome { fcnt_down, route }),
        })
    }

    async fn save(
        &self,
        session: &DeviceSession,
        strategy: &dyn FrameCounterStrategy,
        force: bool,
    ) -> Result<(), RequestFailure> {
        strategy
            .save_changes(session, force)
            .await
            .map(|_| ())
            .map_err(|err| RequestFailure::FrameCounterUpdateFailed(err.to_string()))
    }
}

#[async_trait]
impl DeviceRequestHandler for UplinkProcessor {
    async fn handle(&self, request: &DeviceRequest, cancel: &CancellationToken) -> RequestOutcome {
        let session = request.session.as_ref();
        if session.is_untrusted() {
            self.reconcile(session).await?;
        }

        match &request.kind {
            RequestKind::Uplink {
                frame,
                station,
                connection,
                marked_duplicate,
            } => {
                let destination = Destination {
                    station: *station,
                    connection: connection.as_ref(),
                };
                self.process_uplink(session, frame, destination, *marked_duplicate, cancel)
                    .await
            }
            RequestKind::CloudToDevice(message) => {
                self.process_cloud_to_device(session, message, cancel).await
            }
        }
    }
}
