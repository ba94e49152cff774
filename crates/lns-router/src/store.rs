//! Backend collaborators: device records and cross-gateway counter coordination.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use lns_config::DeviceSeed;
use lns_core::fcnt::is_plausible_restart;
use lns_core::{DevAddr, DevEui, GatewayId, IdParseError};
use lns_proto::CloudToDeviceMessage;

use crate::session::{DeviceTwin, SessionChanges};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("device {0} not found")]
    NotFound(DevEui),
    #[error("device store unavailable: {0}")]
    Unavailable(String),
}

/// Device identity and session persistence.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Look up the device currently holding `dev_addr`.
    async fn resolve(&self, dev_addr: DevAddr) -> Result<Option<DeviceTwin>, StoreError>;

    async fn load(&self, dev_eui: DevEui) -> Result<DeviceTwin, StoreError>;

    /// Persist the dirty fields of a session.
    async fn save(&self, dev_eui: DevEui, changes: &SessionChanges) -> Result<(), StoreError>;

    /// Queue a cloud message for delivery after the device's next uplink.
    async fn enqueue_cloud_to_device(
        &self,
        dev_eui: DevEui,
        message: CloudToDeviceMessage,
    ) -> Result<(), StoreError>;

    /// Pop the oldest pending cloud message.
    async fn take_cloud_to_device(
        &self,
        dev_eui: DevEui,
    ) -> Result<Option<CloudToDeviceMessage>, StoreError>;
}

/// Shared arbiter for multi-gateway devices.
///
/// Several instances may receive the same uplink through different stations; the coordinator
/// makes sure only one of them answers it.
#[async_trait]
pub trait FrameCounterCoordinator: Send + Sync {
    /// Claim the answer to uplink `fcnt_up` and return the down-counter to use, or `None` when
    /// another gateway already claimed it.
    async fn next_down(
        &self,
        dev_eui: DevEui,
        fcnt_up: u32,
        gateway: &GatewayId,
    ) -> Result<Option<u32>, StoreError>;

    /// Claim delivery of cloud message `message_id` and return its down-counter, or `None` when
    /// another gateway already delivered it.
    ///
    /// Independent of uplink claims: a class C message may go out long after the last uplink
    /// was answered elsewhere.
    async fn next_down_for_message(
        &self,
        dev_eui: DevEui,
        message_id: &str,
        gateway: &GatewayId,
    ) -> Result<Option<u32>, StoreError>;

    async fn reset(
        &self,
        dev_eui: DevEui,
        fcnt_up: u32,
        gateway: &GatewayId,
    ) -> Result<bool, StoreError>;
}

/// Cloud message claims remembered per device.
const MESSAGE_CLAIMS_PER_DEVICE: usize = 64;

#[derive(Debug, Clone)]
struct Claim {
    fcnt_up: u32,
    gateway: GatewayId,
}

/// In-process implementation of both backend traits.
///
/// Backs single-process deployments and tests; `set_available(false)` simulates an outage.
#[derive(Debug)]
pub struct InMemoryDeviceStore {
    devices: DashMap<DevEui, DeviceTwin>,
    pending: DashMap<DevEui, VecDeque<CloudToDeviceMessage>>,
    claims: DashMap<DevEui, Claim>,
    message_claims: DashMap<DevEui, VecDeque<(String, GatewayId)>>,
    available: AtomicBool,
    saves: AtomicUsize,
}

impl Default for InMemoryDeviceStore {
    fn default() -> Self {
        Self {
            devices: DashMap::new(),
            pending: DashMap::new(),
            claims: DashMap::new(),
            message_claims: DashMap::new(),
            available: AtomicBool::new(true),
            saves: AtomicUsize::new(0),
        }
    }
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seeds(seeds: &[DeviceSeed]) -> Result<Self, IdParseError> {
        let store = Self::new();
        for seed in seeds {
            let gateway_id = seed.gateway_id.clone().map(GatewayId::new).transpose()?;
            store.insert(DeviceTwin {
                dev_eui: seed.dev_eui,
                dev_addr: seed.dev_addr,
                class: seed.class,
                gateway_id,
                relaxed_counters: seed.relaxed_counters,
                fcnt_up: seed.fcnt_up,
                fcnt_down: seed.fcnt_down,
                newly_joined: seed.fcnt_up == 0 && seed.fcnt_down == 0,
                last_station: None,
            });
        }
        Ok(store)
    }

    pub fn insert(&self, twin: DeviceTwin) {
        self.devices.insert(twin.dev_eui, twin);
    }

    pub fn get(&self, dev_eui: &DevEui) -> Option<DeviceTwin> {
        self.devices.get(dev_eui).map(|twin| twin.clone())
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful saves, for observing write batching.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self, dev_eui: &DevEui) -> usize {
        self.pending.get(dev_eui).map_or(0, |queue| queue.len())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store marked unavailable".into()))
        }
    }
}

#[async_trait]
impl DeviceStore for InMemoryDeviceStore {
    async fn resolve(&self, dev_addr: DevAddr) -> Result<Option<DeviceTwin>, StoreError> {
        self.check_available()?;
        Ok(self
            .devices
            .iter()
            .find(|entry| entry.dev_addr == dev_addr)
            .map(|entry| entry.value().clone()))
    }

    async fn load(&self, dev_eui: DevEui) -> Result<DeviceTwin, StoreError> {
        self.check_available()?;
        self.get(&dev_eui).ok_or(StoreError::NotFound(dev_eui))
    }

    async fn save(&self, dev_eui: DevEui, changes: &SessionChanges) -> Result<(), StoreError> {
        self.check_available()?;
        let mut twin = self
            .devices
            .get_mut(&dev_eui)
            .ok_or(StoreError::NotFound(dev_eui))?;
        if let Some(fcnt_up) = changes.fcnt_up {
            twin.fcnt_up = fcnt_up;
        }
        if let Some(fcnt_down) = changes.fcnt_down {
            twin.fcnt_down = fcnt_down;
        }
        if let Some(station) = changes.last_station {
            twin.last_station = Some(station);
        }
        if let Some(newly_joined) = changes.newly_joined {
            twin.newly_joined = newly_joined;
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn enqueue_cloud_to_device(
        &self,
        dev_eui: DevEui,
        message: CloudToDeviceMessage,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        if !self.devices.contains_key(&dev_eui) {
            return Err(StoreError::NotFound(dev_eui));
        }
        self.pending.entry(dev_eui).or_default().push_back(message);
        Ok(())
    }

    async fn take_cloud_to_device(
        &self,
        dev_eui: DevEui,
    ) -> Result<Option<CloudToDeviceMessage>, StoreError> {
        self.check_available()?;
        Ok(self
            .pending
            .get_mut(&dev_eui)
            .and_then(|mut queue| queue.pop_front()))
    }
}

#[async_trait]
impl FrameCounterCoordinator for InMemoryDeviceStore {
    async fn next_down(
        &self,
        dev_eui: DevEui,
        fcnt_up: u32,
        gateway: &GatewayId,
    ) -> Result<Option<u32>, StoreError> {
        self.check_available()?;
        // Claim and counter update happen under the claim entry's shard lock.
        let mut claim = self.claims.entry(dev_eui).or_insert_with(|| Claim {
            fcnt_up: fcnt_up.wrapping_sub(1),
            gateway: gateway.clone(),
        });
        if claim.fcnt_up == fcnt_up && &claim.gateway != gateway {
            return Ok(None);
        }
        let mut twin = self
            .devices
            .get_mut(&dev_eui)
            .ok_or(StoreError::NotFound(dev_eui))?;
        twin.fcnt_down = twin.fcnt_down.wrapping_add(1);
        claim.fcnt_up = fcnt_up;
        claim.gateway = gateway.clone();
        Ok(Some(twin.fcnt_down))
    }

    async fn next_down_for_message(
        &self,
        dev_eui: DevEui,
        message_id: &str,
        gateway: &GatewayId,
    ) -> Result<Option<u32>, StoreError> {
        self.check_available()?;
        let mut claims = self.message_claims.entry(dev_eui).or_default();
        let previous = claims
            .iter()
            .find(|(id, _)| id == message_id)
            .map(|(_, owner)| owner.clone());
        match previous {
            Some(owner) if &owner != gateway => return Ok(None),
            Some(_) => {}
            None => {
                if claims.len() >= MESSAGE_CLAIMS_PER_DEVICE {
                    claims.pop_front();
                }
                claims.push_back((message_id.to_owned(), gateway.clone()));
            }
        }
        let mut twin = self
            .devices
            .get_mut(&dev_eui)
            .ok_or(StoreError::NotFound(dev_eui))?;
        twin.fcnt_down = twin.fcnt_down.wrapping_add(1);
        Ok(Some(twin.fcnt_down))
    }

    async fn reset(
        &self,
        dev_eui: DevEui,
        fcnt_up: u32,
        _gateway: &GatewayId,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut twin = self
            .devices
            .get_mut(&dev_eui)
            .ok_or(StoreError::NotFound(dev_eui))?;
        if !is_plausible_restart(twin.fcnt_up, fcnt_up, twin.newly_joined) {
            return Ok(false);
        }
        twin.fcnt_up = fcnt_up;
        twin.fcnt_down = 0;
        drop(twin);
        self.claims.remove(&dev_eui);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use lns_core::DeviceClass;

    use super::*;

    fn twin(dev_eui: u64) -> DeviceTwin {
        DeviceTwin {
            dev_eui: DevEui::new(dev_eui),
            dev_addr: DevAddr::new(dev_eui as u32),
            class: DeviceClass::A,
            gateway_id: None,
            relaxed_counters: false,
            fcnt_up: 7,
            fcnt_down: 3,
            newly_joined: false,
            last_station: None,
        }
    }

    #[tokio::test]
    async fn coordinator_answers_each_uplink_once() {
        let store = InMemoryDeviceStore::new();
        store.insert(twin(1));
        let gw_a = GatewayId::new("gw-a").unwrap();
        let gw_b = GatewayId::new("gw-b").unwrap();

        assert_eq!(store.next_down(DevEui::new(1), 8, &gw_a).await, Ok(Some(4)));
        assert_eq!(store.next_down(DevEui::new(1), 8, &gw_b).await, Ok(None));
        assert_eq!(store.next_down(DevEui::new(1), 8, &gw_a).await, Ok(Some(5)));
        assert_eq!(store.next_down(DevEui::new(1), 9, &gw_b).await, Ok(Some(6)));
    }

    #[tokio::test]
    async fn cloud_message_claims_ignore_the_uplink_claim() {
        let store = InMemoryDeviceStore::new();
        store.insert(twin(1));
        let gw_a = GatewayId::new("gw-a").unwrap();
        let gw_b = GatewayId::new("gw-b").unwrap();

        assert_eq!(store.next_down(DevEui::new(1), 8, &gw_b).await, Ok(Some(4)));
        assert_eq!(
            store.next_down_for_message(DevEui::new(1), "m-1", &gw_a).await,
            Ok(Some(5))
        );
        assert_eq!(
            store.next_down_for_message(DevEui::new(1), "m-1", &gw_b).await,
            Ok(None)
        );
        assert_eq!(
            store.next_down_for_message(DevEui::new(1), "m-2", &gw_b).await,
            Ok(Some(6))
        );
        // The uplink claim is untouched.
        assert_eq!(store.next_down(DevEui::new(1), 8, &gw_a).await, Ok(None));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryDeviceStore::new();
        store.insert(twin(1));
        store.set_available(false);
        assert!(matches!(
            store.load(DevEui::new(1)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.save(DevEui::new(1), &SessionChanges::default()).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn cloud_messages_are_delivered_in_order() {
        let store = InMemoryDeviceStore::new();
        store.insert(twin(1));
        for id in ["a", "b"] {
            store
                .enqueue_cloud_to_device(
                    DevEui::new(1),
                    CloudToDeviceMessage {
                        message_id: id.into(),
                        fport: Some(1),
                        confirmed: false,
                        payload: vec![],
                    },
                )
                .await
                .unwrap();
        }
        let first = store.take_cloud_to_device(DevEui::new(1)).await.unwrap();
        assert_eq!(first.map(|m| m.message_id), Some("a".to_owned()));
        assert_eq!(store.pending_len(&DevEui::new(1)), 1);
    }
}
