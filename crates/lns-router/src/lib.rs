//! Device-request processing and cross-instance coordination for LoRaWAN stations.
//!
//! [`LnsRouter`] wires the pieces together: uplinks arriving on a station socket pass
//! deduplication, are resolved to a device session and handed to that device's request lane;
//! the lane validates counters and dispatches any downlink either straight to a local station
//! socket or, through the remote call bus, to the instance that owns it.

use std::sync::Arc;
use std::time::Duration;

use lns_config::{DedupMode, LnsConfig};
use lns_core::{DevAddr, DevEui, GatewayId, StationEui};
use lns_proto::{CloudToDeviceMessage, UplinkFrame};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod bus;
pub mod control;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod frame_counter;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod session;
pub mod station;
pub mod store;

pub use bus::{BroadcastTransport, BusError, InMemoryBroadcast, RemoteCallBus, Subscription};
pub use control::{CloudToDeviceRoute, ControlError, ControlPlane, LocalRemoteCallHandler};
pub use dedup::{DedupResult, DeduplicationEngine};
pub use dispatcher::{DispatchRoute, DownlinkDispatcher};
pub use error::{FailureClass, RequestFailure, RouterError};
pub use queue::{DeviceRequest, OutcomeReceiver, Processed, RequestKind, RequestOutcome};
pub use registry::{ConnectionRegistry, ConnectionWriter, RegistryHandle, SendError};
pub use session::{DeviceSession, DeviceTwin, SessionCache};
pub use station::serve_station;
pub use store::{DeviceStore, FrameCounterCoordinator, InMemoryDeviceStore, StoreError};

use frame_counter::FrameCounterStrategies;
use processor::UplinkProcessor;
use queue::DeviceRequestQueue;

/// Live station connections owned by this instance.
pub type StationRegistry = ConnectionRegistry<StationEui, dyn ConnectionWriter>;

pub struct LnsRouter {
    gateway: GatewayId,
    dedup: Arc<DeduplicationEngine>,
    dedup_mode: DedupMode,
    dedup_sweep_interval: Duration,
    sessions: Arc<SessionCache>,
    store: Arc<dyn DeviceStore>,
    strategies: Arc<FrameCounterStrategies>,
    queue: Arc<DeviceRequestQueue>,
    registry: Arc<StationRegistry>,
    bus: Arc<RemoteCallBus>,
    prune_interval: Duration,
    station_idle_timeout: Option<Duration>,
    hello_timeout: Duration,
    cancel: CancellationToken,
}

impl LnsRouter {
    pub fn new(
        config: &LnsConfig,
        store: Arc<dyn DeviceStore>,
        coordinator: Arc<dyn FrameCounterCoordinator>,
        transport: Arc<dyn BroadcastTransport>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, RouterError> {
        let gateway = config.node.gateway_id()?;

        let registry = Arc::new(StationRegistry::new());
        let bus = Arc::new(RemoteCallBus::new(transport, config.bus.topic.clone()));
        let dispatcher = Arc::new(DownlinkDispatcher::new(registry.clone(), bus.clone()));
        let strategies = Arc::new(FrameCounterStrategies::new(
            store.clone(),
            coordinator,
            gateway.clone(),
            config.frame_counter.save_frequency,
        ));
        let processor = Arc::new(UplinkProcessor::new(
            gateway.clone(),
            store.clone(),
            strategies.clone(),
            dispatcher,
        ));
        let queue = Arc::new(DeviceRequestQueue::new(
            gateway.clone(),
            &config.queue,
            processor,
            cancel.clone(),
        ));

        Ok(Arc::new(Self {
            gateway,
            dedup: Arc::new(DeduplicationEngine::from_config(&config.dedup)),
            dedup_mode: config.dedup.mode,
            dedup_sweep_interval: config.dedup.sweep_interval(),
            sessions: Arc::new(SessionCache::new()),
            store,
            strategies,
            queue,
            registry,
            bus,
            prune_interval: config.stations.prune_interval(),
            station_idle_timeout: config.stations.idle_timeout(),
            hello_timeout: config.stations.hello_timeout(),
            cancel,
        }))
    }

    /// Start the background tasks: registry pruner, dedup sweeper and the remote call
    /// subscription. All of them stop when the router's token is cancelled.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, RouterError> {
        let mut tasks = Vec::new();

        let handler = Arc::new(LocalRemoteCallHandler::new(
            self.registry.clone(),
            self.sessions.clone(),
            self.queue.clone(),
        ));
        tasks.push(
            self.bus
                .subscribe(self.bus.channel(), handler, self.cancel.clone())
                .await?,
        );

        tasks.push(tokio::spawn(
            self.registry
                .clone()
                .run_pruner(
                    self.prune_interval,
                    self.station_idle_timeout,
                    self.cancel.clone(),
                ),
        ));

        if self.dedup_mode != DedupMode::None {
            tasks.push(tokio::spawn(
                self.dedup
                    .clone()
                    .run_sweeper(self.dedup_sweep_interval, self.cancel.clone()),
            ));
        }

        tracing::info!(
            target: "lns.router",
            gateway = %self.gateway,
            channel = %self.bus.channel(),
            dedup_mode = ?self.dedup_mode,
            "router started"
        );
        Ok(tasks)
    }

    /// Hand an uplink to its device lane.
    ///
    /// Returns as soon as the request is queued (or rejected); the receiver yields its single
    /// terminal outcome.
    pub async fn submit_uplink(&self, station: StationEui, frame: UplinkFrame) -> OutcomeReceiver {
        self.submit(station, None, frame).await
    }

    /// Hand over an uplink read from the local connection `connection`.
    ///
    /// A downlink answering it is written to that connection only; if the station reconnected
    /// meanwhile the request fails with [`RequestFailure::ConnectionStale`].
    pub async fn submit_uplink_on(
        &self,
        connection: RegistryHandle<StationEui>,
        frame: UplinkFrame,
    ) -> OutcomeReceiver {
        self.submit(connection.key, Some(connection), frame).await
    }

    async fn submit(
        &self,
        station: StationEui,
        connection: Option<RegistryHandle<StationEui>>,
        frame: UplinkFrame,
    ) -> OutcomeReceiver {
        let marked_duplicate = match self.dedup_mode {
            DedupMode::None => false,
            mode => {
                let duplicate = self.dedup.is_duplicate(&frame, station);
                if duplicate && mode == DedupMode::Drop {
                    return OutcomeReceiver::ready(Err(RequestFailure::DuplicateUplink));
                }
                duplicate
            }
        };

        let session = match self.resolve_session(frame.dev_addr).await {
            Ok(session) => session,
            Err(failure) => return OutcomeReceiver::ready(Err(failure)),
        };

        let (request, outcome) = DeviceRequest::new(
            session,
            RequestKind::Uplink {
                frame,
                station,
                connection,
                marked_duplicate,
            },
        );
        self.queue.queue(request);
        outcome
    }

    /// Queue a cloud message for a device whose session is cached here.
    pub fn submit_cloud_to_device(
        &self,
        dev_eui: DevEui,
        message: CloudToDeviceMessage,
    ) -> OutcomeReceiver {
        let Some(session) = self.sessions.get(&dev_eui) else {
            return OutcomeReceiver::ready(Err(RequestFailure::BackendUnavailable(format!(
                "no cached session for {dev_eui}"
            ))));
        };
        let (request, outcome) = DeviceRequest::new(session, RequestKind::CloudToDevice(message));
        self.queue.queue(request);
        outcome
    }

    /// Find the session for `dev_addr`, loading it from the store on a cache miss.
    pub async fn resolve_session(
        &self,
        dev_addr: DevAddr,
    ) -> Result<Arc<DeviceSession>, RequestFailure> {
        if let Some(session) = self.sessions.get_by_addr(&dev_addr) {
            return Ok(session);
        }
        let twin = self
            .store
            .resolve(dev_addr)
            .await
            .map_err(|err| RequestFailure::BackendUnavailable(err.to_string()))?
            .ok_or(RequestFailure::UnknownDevice(dev_addr))?;

        let skip = if twin.newly_joined {
            0
        } else {
            self.strategies.reload_skip(twin.gateway_id.is_some())
        };
        Ok(self
            .sessions
            .insert(DeviceSession::from_twin_skipping(&twin, skip)))
    }

    pub fn control(&self) -> ControlPlane {
        ControlPlane::new(self.bus.clone(), self.store.clone())
    }

    pub fn registry(&self) -> &Arc<StationRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    pub fn dedup(&self) -> &Arc<DeduplicationEngine> {
        &self.dedup
    }

    pub fn gateway(&self) -> &GatewayId {
        &self.gateway
    }

    pub fn hello_timeout(&self) -> Duration {
        self.hello_timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Pending requests for `dev_eui`.
    pub fn queue_depth(&self, dev_eui: &DevEui) -> usize {
        self.queue.depth(dev_eui)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
