use std::sync::Arc;

use bytes::Bytes;
use lns_core::StationEui;
use lns_proto::{ProtoError, RemoteCall, StationMessage};

use crate::bus::{BusError, RemoteCallBus};
use crate::registry::{RegistryHandle, SendError};
use crate::StationRegistry;

/// Which path a downlink took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchRoute {
    /// Written to a station socket owned by this instance.
    Local,
    /// Published for the owning instance. Whether anybody owns the station is not observable
    /// from here; an unowned station silently loses the message.
    Forwarded,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to encode downlink: {0}")]
    Encode(#[from] ProtoError),
    #[error("local send failed: {0}")]
    Local(#[from] SendError),
    #[error("forwarding failed: {0}")]
    Bus(#[from] BusError),
}

/// Sends a station message from wherever the station lives.
pub struct DownlinkDispatcher {
    registry: Arc<StationRegistry>,
    bus: Arc<RemoteCallBus>,
}

impl DownlinkDispatcher {
    pub fn new(registry: Arc<StationRegistry>, bus: Arc<RemoteCallBus>) -> Self {
        Self { registry, bus }
    }

    /// Exactly one path runs: a local send when the station is registered here, a bus publish
    /// otherwise. A failed local send is reported, never retried over the bus.
    pub async fn dispatch(
        &self,
        station: StationEui,
        message: &StationMessage,
    ) -> Result<DispatchRoute, DispatchError> {
        self.route(station, None, message).await
    }

    /// Like [`dispatch`](Self::dispatch), but a local send only goes to the connection `handle`
    /// names. Once that connection has been replaced the send fails with
    /// [`SendError::Stale`] instead of reaching its successor.
    pub async fn dispatch_on(
        &self,
        handle: &RegistryHandle<StationEui>,
        message: &StationMessage,
    ) -> Result<DispatchRoute, DispatchError> {
        self.route(handle.key, Some(handle), message).await
    }

    async fn route(
        &self,
        station: StationEui,
        handle: Option<&RegistryHandle<StationEui>>,
        message: &StationMessage,
    ) -> Result<DispatchRoute, DispatchError> {
        let encoded = message.encode()?;

        if self.registry.contains(&station) {
            let bytes = Bytes::from(encoded);
            match handle {
                Some(handle) => self.registry.send_with_handle(handle, bytes).await?,
                None => self.registry.send(&station, bytes).await?,
            }
            tracing::debug!(target: "lns.router", station = %station, "downlink sent locally");
            return Ok(DispatchRoute::Local);
        }

        self.bus
            .publish(&RemoteCall::forward_to_station(station, encoded))
            .await?;
        tracing::debug!(target: "lns.router", station = %station, "downlink forwarded");
        Ok(DispatchRoute::Forwarded)
    }
}
