//! Control actions: publishing them upward and applying them locally.
//!
//! Publishers never need to know which instance owns a device or station. Every instance,
//! the publisher included, receives the call and acts only if its registry (or cache) holds
//! the target.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use lns_core::{DevEui, DeviceClass, StationEui};
use lns_proto::{CloudToDeviceMessage, ProtoError, RemoteCall, RemoteCallKind, RemoteTarget};

use crate::bus::{BusError, RemoteCallBus, RemoteCallHandler};
use crate::queue::{DeviceRequest, DeviceRequestQueue, RequestKind};
use crate::session::SessionCache;
use crate::store::{DeviceStore, StoreError};
use crate::StationRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("invalid cloud message: {0}")]
    Encode(#[from] ProtoError),
}

/// How a cloud-to-device message was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudToDeviceRoute {
    /// Stored for the receive window after the next uplink (class A).
    Stored,
    /// Broadcast to the instance serving the device (class C).
    Published,
}

#[derive(Clone)]
pub struct ControlPlane {
    bus: Arc<RemoteCallBus>,
    store: Arc<dyn DeviceStore>,
}

impl ControlPlane {
    pub fn new(bus: Arc<RemoteCallBus>, store: Arc<dyn DeviceStore>) -> Self {
        Self { bus, store }
    }

    /// Deliver `message` to `dev_eui`.
    pub async fn send_cloud_to_device(
        &self,
        dev_eui: DevEui,
        message: CloudToDeviceMessage,
    ) -> Result<CloudToDeviceRoute, ControlError> {
        message.validate()?;
        let twin = self.store.load(dev_eui).await?;
        if twin.class == DeviceClass::A {
            self.store.enqueue_cloud_to_device(dev_eui, message).await?;
            return Ok(CloudToDeviceRoute::Stored);
        }
        let payload = message.encode()?;
        self.bus
            .publish(&RemoteCall::cloud_to_device(dev_eui, payload))
            .await?;
        Ok(CloudToDeviceRoute::Published)
    }

    /// Evict the cached session of `dev_eui` wherever it is cached.
    pub async fn clear_cache(&self, dev_eui: DevEui) -> Result<(), ControlError> {
        self.bus.publish(&RemoteCall::clear_cache(dev_eui)).await?;
        Ok(())
    }

    /// Force-close the connection to `station` wherever it lives.
    pub async fn close_station(&self, station: StationEui) -> Result<(), ControlError> {
        self.bus
            .publish(&RemoteCall::close_connection(station))
            .await?;
        Ok(())
    }
}

/// Applies remote calls whose target this instance owns and ignores the rest.
pub struct LocalRemoteCallHandler {
    registry: Arc<StationRegistry>,
    sessions: Arc<SessionCache>,
    queue: Arc<DeviceRequestQueue>,
}

impl LocalRemoteCallHandler {
    pub fn new(
        registry: Arc<StationRegistry>,
        sessions: Arc<SessionCache>,
        queue: Arc<DeviceRequestQueue>,
    ) -> Self {
        Self {
            registry,
            sessions,
            queue,
        }
    }

    async fn forward_to_station(&self, station: StationEui, payload: Vec<u8>) {
        if !self.registry.contains(&station) {
            return;
        }
        match self.registry.send(&station, Bytes::from(payload)).await {
            Ok(()) => {
                tracing::debug!(target: "lns.bus", station = %station, "forwarded downlink delivered");
            }
            Err(err) => {
                tracing::warn!(target: "lns.bus", station = %station, error = %err, "forwarded downlink not delivered");
            }
        }
    }

    fn deliver_to_device(&self, dev_eui: DevEui, payload: &[u8]) {
        let Some(session) = self.sessions.get(&dev_eui) else {
            return;
        };
        let owned = session
            .last_station()
            .is_some_and(|station| self.registry.contains(&station));
        if !owned {
            return;
        }
        let message = match CloudToDeviceMessage::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(target: "lns.bus", dev_eui = %dev_eui, error = %err, "dropping undecodable cloud message");
                return;
            }
        };
        let message_id = message.message_id.clone();
        let (request, outcome) = DeviceRequest::new(session, RequestKind::CloudToDevice(message));
        self.queue.queue(request);
        tokio::spawn(async move {
            if let Err(failure) = outcome.outcome().await {
                tracing::warn!(
                    target: "lns.bus",
                    dev_eui = %dev_eui,
                    message_id = %message_id,
                    class = ?failure.class(),
                    error = %failure,
                    "cloud message not delivered"
                );
            }
        });
    }
}

#[async_trait]
impl RemoteCallHandler for LocalRemoteCallHandler {
    async fn handle(&self, call: RemoteCall) {
        match (call.kind, call.target) {
            (RemoteCallKind::CloudToDeviceMessage, RemoteTarget::Station(station)) => {
                self.forward_to_station(station, call.payload).await;
            }
            (RemoteCallKind::CloudToDeviceMessage, RemoteTarget::Device(dev_eui)) => {
                self.deliver_to_device(dev_eui, &call.payload);
            }
            (RemoteCallKind::ClearCache, RemoteTarget::Device(dev_eui)) => {
                if self.sessions.evict(&dev_eui) {
                    tracing::info!(target: "lns.bus", dev_eui = %dev_eui, "session cache cleared");
                }
            }
            (RemoteCallKind::CloseConnection, RemoteTarget::Station(station)) => {
                if let Some(writer) = self.registry.deregister(&station) {
                    writer.close();
                    tracing::info!(target: "lns.bus", station = %station, "station connection force-closed");
                }
            }
            (kind @ (RemoteCallKind::ClearCache | RemoteCallKind::CloseConnection), target) => {
                tracing::debug!(target: "lns.bus", ?kind, target_key = %target, "ignoring remote call for mismatched target");
            }
        }
    }
}
