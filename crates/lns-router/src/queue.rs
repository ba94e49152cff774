//! Per-device request lanes.
//!
//! Every device with pending work gets one lane: an unbounded channel drained by a dedicated
//! task, so requests for one device run strictly one after another while different devices
//! proceed concurrently. Lanes are created on first use and remove themselves once idle.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use lns_config::QueueConfig;
use lns_core::{DevEui, GatewayId, StationEui};
use lns_proto::{CloudToDeviceMessage, UplinkFrame};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::DispatchRoute;
use crate::error::RequestFailure;
use crate::registry::RegistryHandle;
use crate::session::DeviceSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkOutcome {
    pub fcnt_down: u32,
    pub route: DispatchRoute,
}

/// Successful terminal outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Processed {
    /// Downlink sent in answer to the request, if any.
    pub downlink: Option<DownlinkOutcome>,
}

pub type RequestOutcome = Result<Processed, RequestFailure>;

#[derive(Debug, Clone)]
pub enum RequestKind {
    Uplink {
        frame: UplinkFrame,
        station: StationEui,
        /// The local connection that carried the frame. An answer goes only to this connection
        /// while the station is served here.
        connection: Option<RegistryHandle<StationEui>>,
        /// Seen before through another station; processed for bookkeeping only.
        marked_duplicate: bool,
    },
    CloudToDevice(CloudToDeviceMessage),
}

/// A unit of work for one device.
///
/// Exactly one outcome is reported per request: [`DeviceRequest::complete`] consumes it, and a
/// request dropped without completion reports [`RequestFailure::Cancelled`].
#[derive(Debug)]
pub struct DeviceRequest {
    pub session: Arc<DeviceSession>,
    pub kind: RequestKind,
    pub created_at: Instant,
    reply: Option<oneshot::Sender<RequestOutcome>>,
}

impl DeviceRequest {
    pub fn new(session: Arc<DeviceSession>, kind: RequestKind) -> (Self, OutcomeReceiver) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            session,
            kind,
            created_at: Instant::now(),
            reply: Some(tx),
        };
        (request, OutcomeReceiver::Pending(rx))
    }

    pub fn dev_eui(&self) -> DevEui {
        self.session.dev_eui
    }

    pub fn complete(mut self, outcome: RequestOutcome) {
        if let Some(reply) = self.reply.take() {
            // The originator may have stopped waiting.
            let _ = reply.send(outcome);
        }
    }
}

impl Drop for DeviceRequest {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(RequestFailure::Cancelled));
        }
    }
}

/// Receiving end of a request's outcome.
#[derive(Debug)]
pub enum OutcomeReceiver {
    Pending(oneshot::Receiver<RequestOutcome>),
    Ready(RequestOutcome),
}

impl OutcomeReceiver {
    /// An outcome decided before the request reached a lane.
    pub fn ready(outcome: RequestOutcome) -> Self {
        OutcomeReceiver::Ready(outcome)
    }

    pub async fn outcome(self) -> RequestOutcome {
        match self {
            OutcomeReceiver::Ready(outcome) => outcome,
            OutcomeReceiver::Pending(rx) => rx.await.unwrap_or(Err(RequestFailure::Cancelled)),
        }
    }
}

/// Processes requests taken off a lane.
#[async_trait]
pub trait DeviceRequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: &DeviceRequest, cancel: &CancellationToken) -> RequestOutcome;
}

struct Lane {
    id: u64,
    tx: mpsc::UnboundedSender<DeviceRequest>,
    /// Queued plus in-flight requests.
    depth: Arc<AtomicUsize>,
}

pub struct DeviceRequestQueue {
    gateway: GatewayId,
    max_depth: usize,
    idle_timeout: Duration,
    handler: Arc<dyn DeviceRequestHandler>,
    lanes: Arc<DashMap<DevEui, Lane>>,
    next_lane_id: AtomicU64,
    cancel: CancellationToken,
}

impl DeviceRequestQueue {
    pub fn new(
        gateway: GatewayId,
        config: &QueueConfig,
        handler: Arc<dyn DeviceRequestHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            max_depth: config.max_depth.max(1),
            idle_timeout: config.idle_timeout(),
            handler,
            lanes: Arc::new(DashMap::new()),
            next_lane_id: AtomicU64::new(1),
            cancel,
        }
    }

    /// Hand `request` to its device lane without waiting for it to run.
    ///
    /// Requests for a device bound to another gateway, requests over the depth bound and
    /// requests after shutdown are completed immediately and never enter a lane.
    pub fn queue(&self, request: DeviceRequest) {
        let dev_eui = request.dev_eui();

        if let Some(owner) = request.session.gateway_id.as_ref() {
            if owner != &self.gateway {
                let owner = owner.clone();
                tracing::debug!(
                    target: "lns.router",
                    dev_eui = %dev_eui,
                    owner = %owner,
                    "device belongs to another gateway"
                );
                request.complete(Err(RequestFailure::BelongsToAnotherGateway { dev_eui, owner }));
                return;
            }
        }

        if self.cancel.is_cancelled() {
            request.complete(Err(RequestFailure::Cancelled));
            return;
        }

        let mut spawn = None;
        let rejected = {
            let lane = self.lanes.entry(dev_eui).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let id = self.next_lane_id.fetch_add(1, Ordering::Relaxed);
                let depth = Arc::new(AtomicUsize::new(0));
                spawn = Some((id, rx, depth.clone()));
                Lane { id, tx, depth }
            });

            let depth = lane.depth.load(Ordering::SeqCst);
            if depth >= self.max_depth {
                Some((request, RequestFailure::QueueOverloaded { depth }))
            } else {
                // Depth is raised under the entry guard so an idle lane can never be removed
                // while a request is on its way in.
                lane.depth.fetch_add(1, Ordering::SeqCst);
                match lane.tx.send(request) {
                    Ok(()) => None,
                    Err(mpsc::error::SendError(request)) => {
                        lane.depth.fetch_sub(1, Ordering::SeqCst);
                        Some((request, RequestFailure::Cancelled))
                    }
                }
            }
        };

        if let Some((id, rx, depth)) = spawn {
            let lane = LaneTask {
                dev_eui,
                id,
                depth,
                lanes: self.lanes.clone(),
                handler: self.handler.clone(),
                idle_timeout: self.idle_timeout,
                cancel: self.cancel.clone(),
            };
            tokio::spawn(lane.run(rx));
        }

        if let Some((request, failure)) = rejected {
            if matches!(failure, RequestFailure::QueueOverloaded { .. }) {
                tracing::warn!(
                    target: "lns.router",
                    dev_eui = %dev_eui,
                    max_depth = self.max_depth,
                    "device queue overloaded; rejecting request"
                );
            }
            request.complete(Err(failure));
        }
    }

    /// Pending requests (queued plus in flight) for `dev_eui`.
    pub fn depth(&self, dev_eui: &DevEui) -> usize {
        self.lanes
            .get(dev_eui)
            .map_or(0, |lane| lane.depth.load(Ordering::SeqCst))
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

struct LaneTask {
    dev_eui: DevEui,
    id: u64,
    depth: Arc<AtomicUsize>,
    lanes: Arc<DashMap<DevEui, Lane>>,
    handler: Arc<dyn DeviceRequestHandler>,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl LaneTask {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<DeviceRequest>) {
        // Removes this lane on every exit path, including a panicking handler.
        let _guard = LaneGuard {
            dev_eui: self.dev_eui,
            id: self.id,
            lanes: self.lanes.clone(),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = tokio::time::timeout(self.idle_timeout, rx.recv()) => next,
            };

            match next {
                Ok(Some(request)) => {
                    let queued_ms = request.created_at.elapsed().as_millis() as u64;
                    // Cancellation abandons the pipeline at its next suspension point.
                    let outcome = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => Err(RequestFailure::Cancelled),
                        outcome = self.handler.handle(&request, &self.cancel) => outcome,
                    };
                    match &outcome {
                        Ok(_) => tracing::trace!(
                            target: "lns.router",
                            dev_eui = %self.dev_eui,
                            queued_ms,
                            "device request processed"
                        ),
                        Err(failure) => tracing::debug!(
                            target: "lns.router",
                            dev_eui = %self.dev_eui,
                            queued_ms,
                            class = ?failure.class(),
                            error = %failure,
                            "device request failed"
                        ),
                    }
                    request.complete(outcome);
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(None) => break,
                Err(_elapsed) => {
                    let removed = self.lanes.remove_if(&self.dev_eui, |_, lane| {
                        lane.id == self.id && lane.depth.load(Ordering::SeqCst) == 0
                    });
                    if removed.is_some() {
                        tracing::trace!(target: "lns.router", dev_eui = %self.dev_eui, "idle lane removed");
                        return;
                    }
                }
            }
        }

        rx.close();
        while let Ok(request) = rx.try_recv() {
            request.complete(Err(RequestFailure::Cancelled));
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct LaneGuard {
    dev_eui: DevEui,
    id: u64,
    lanes: Arc<DashMap<DevEui, Lane>>,
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        self.lanes.remove_if(&self.dev_eui, |_, lane| lane.id == self.id);
    }
}
