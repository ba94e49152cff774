//! Cached device sessions.
//!
//! A [`DeviceSession`] is the in-memory view of a device record. Its mutable counter state sits
//! behind a mutex that is only ever taken from the device's request lane, so the lock is never
//! contended in practice; it exists to make the session `Sync`.

use std::sync::Arc;

use dashmap::DashMap;
use lns_core::{DevAddr, DevEui, DeviceClass, GatewayId, StationEui};
use parking_lot::Mutex;

/// Backend view of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTwin {
    pub dev_eui: DevEui,
    pub dev_addr: DevAddr,
    pub class: DeviceClass,
    /// `Some` binds the device to exactly one gateway.
    pub gateway_id: Option<GatewayId>,
    pub relaxed_counters: bool,
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    /// No uplink has been accepted since the last join.
    pub newly_joined: bool,
    pub last_station: Option<StationEui>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyFlags {
    pub fcnt_up: bool,
    pub fcnt_down: bool,
    pub last_station: bool,
    pub newly_joined: bool,
}

impl DirtyFlags {
    pub fn any(&self) -> bool {
        self.fcnt_up || self.fcnt_down || self.last_station || self.newly_joined
    }

    /// Anything other than the batched counters.
    pub fn non_counter(&self) -> bool {
        self.last_station || self.newly_joined
    }
}

/// Mutable per-device state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    pub newly_joined: bool,
    pub last_station: Option<StationEui>,
    pub dirty: DirtyFlags,
    /// Counter increments not yet written to the store.
    pub unsaved_up_delta: u32,
    pub unsaved_down_delta: u32,
    /// Set when a save failed; counters must be reconciled before the next decision.
    pub untrusted: bool,
}

impl SessionState {
    fn from_twin(twin: &DeviceTwin) -> Self {
        Self {
            fcnt_up: twin.fcnt_up,
            fcnt_down: twin.fcnt_down,
            newly_joined: twin.newly_joined,
            last_station: twin.last_station,
            dirty: DirtyFlags::default(),
            unsaved_up_delta: 0,
            unsaved_down_delta: 0,
            untrusted: false,
        }
    }

    /// Record an accepted uplink.
    pub fn record_uplink(&mut self, fcnt_up: u32, station: StationEui) {
        if self.fcnt_up != fcnt_up || self.newly_joined {
            self.unsaved_up_delta = self
                .unsaved_up_delta
                .saturating_add(fcnt_up.wrapping_sub(self.fcnt_up).max(1));
            self.fcnt_up = fcnt_up;
            self.dirty.fcnt_up = true;
        }
        if self.newly_joined {
            self.newly_joined = false;
            self.dirty.newly_joined = true;
        }
        if self.last_station != Some(station) {
            self.last_station = Some(station);
            self.dirty.last_station = true;
        }
    }

    /// Advance the down-counter in memory only.
    pub fn advance_down(&mut self) -> u32 {
        self.fcnt_down = self.fcnt_down.wrapping_add(1);
        self.dirty.fcnt_down = true;
        self.unsaved_down_delta = self.unsaved_down_delta.saturating_add(1);
        self.fcnt_down
    }

    /// Give back a down-counter value that never reached the air.
    ///
    /// Only the most recent value can be returned.
    pub fn release_down(&mut self, value: u32) -> bool {
        if self.fcnt_down != value || self.unsaved_down_delta == 0 {
            return false;
        }
        self.fcnt_down = value.wrapping_sub(1);
        self.unsaved_down_delta -= 1;
        if self.unsaved_down_delta == 0 {
            self.dirty.fcnt_down = false;
        }
        true
    }

    /// Restart both counters after an accepted reset.
    pub fn reset_counters(&mut self, fcnt_up: u32) {
        self.fcnt_up = fcnt_up;
        self.fcnt_down = 0;
        self.dirty.fcnt_up = true;
        self.dirty.fcnt_down = true;
    }

    pub fn changes(&self) -> SessionChanges {
        SessionChanges {
            fcnt_up: self.dirty.fcnt_up.then_some(self.fcnt_up),
            fcnt_down: self.dirty.fcnt_down.then_some(self.fcnt_down),
            last_station: if self.dirty.last_station {
                self.last_station
            } else {
                None
            },
            newly_joined: self.dirty.newly_joined.then_some(self.newly_joined),
        }
    }

    /// Clear the flags covered by a successful save.
    ///
    /// Fields modified after `saved` was taken stay dirty.
    pub fn mark_saved(&mut self, saved: &SessionChanges) {
        if saved.fcnt_up == Some(self.fcnt_up) {
            self.dirty.fcnt_up = false;
            self.unsaved_up_delta = 0;
        }
        if saved.fcnt_down == Some(self.fcnt_down) {
            self.dirty.fcnt_down = false;
            self.unsaved_down_delta = 0;
        }
        if saved.last_station.is_some() && saved.last_station == self.last_station {
            self.dirty.last_station = false;
        }
        if saved.newly_joined == Some(self.newly_joined) {
            self.dirty.newly_joined = false;
        }
    }
}

/// The set of dirty fields handed to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionChanges {
    pub fcnt_up: Option<u32>,
    pub fcnt_down: Option<u32>,
    pub last_station: Option<StationEui>,
    pub newly_joined: Option<bool>,
}

impl SessionChanges {
    pub fn is_empty(&self) -> bool {
        self.fcnt_up.is_none()
            && self.fcnt_down.is_none()
            && self.last_station.is_none()
            && self.newly_joined.is_none()
    }
}

#[derive(Debug)]
pub struct DeviceSession {
    pub dev_eui: DevEui,
    pub dev_addr: DevAddr,
    pub class: DeviceClass,
    pub gateway_id: Option<GatewayId>,
    pub relaxed_counters: bool,
    state: Mutex<SessionState>,
}

impl DeviceSession {
    pub fn from_twin(twin: &DeviceTwin) -> Self {
        Self {
            dev_eui: twin.dev_eui,
            dev_addr: twin.dev_addr,
            class: twin.class,
            gateway_id: twin.gateway_id.clone(),
            relaxed_counters: twin.relaxed_counters,
            state: Mutex::new(SessionState::from_twin(twin)),
        }
    }

    /// Build a session whose down-counter skips `skip_down` values past the stored one.
    ///
    /// Used when increments may have been sent without being persisted. The skipped value is
    /// dirty so the next save writes it back.
    pub fn from_twin_skipping(twin: &DeviceTwin, skip_down: u32) -> Self {
        let session = Self::from_twin(twin);
        if skip_down > 0 {
            session.with_state(|state| {
                state.fcnt_down = state.fcnt_down.wrapping_add(skip_down);
                state.dirty.fcnt_down = true;
                state.unsaved_down_delta = skip_down;
            });
        }
        session
    }

    pub fn is_single_gateway(&self) -> bool {
        self.gateway_id.is_some()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn is_untrusted(&self) -> bool {
        self.state.lock().untrusted
    }

    pub fn last_station(&self) -> Option<StationEui> {
        self.state.lock().last_station
    }

    /// Replace the counter state with a reloaded record.
    ///
    /// Counters never move backwards: the larger of the in-memory and stored values wins before
    /// the down-counter skip is applied.
    pub fn reconcile(&self, twin: &DeviceTwin, skip_down: u32) {
        self.with_state(|state| {
            if lns_core::fcnt::is_newer(twin.fcnt_up, state.fcnt_up) {
                state.fcnt_up = twin.fcnt_up;
            }
            let base = if lns_core::fcnt::is_newer(twin.fcnt_down, state.fcnt_down) {
                twin.fcnt_down
            } else {
                state.fcnt_down
            };
            state.fcnt_down = base.wrapping_add(skip_down);
            state.dirty = DirtyFlags {
                fcnt_up: true,
                fcnt_down: true,
                last_station: state.last_station.is_some(),
                newly_joined: true,
            };
            state.unsaved_down_delta = skip_down;
            state.untrusted = false;
        });
    }
}

/// Local session cache, indexed by DevEUI and by DevAddr.
#[derive(Debug, Default)]
pub struct SessionCache {
    by_eui: DashMap<DevEui, Arc<DeviceSession>>,
    by_addr: DashMap<DevAddr, DevEui>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dev_eui: &DevEui) -> Option<Arc<DeviceSession>> {
        self.by_eui.get(dev_eui).map(|entry| entry.value().clone())
    }

    pub fn get_by_addr(&self, dev_addr: &DevAddr) -> Option<Arc<DeviceSession>> {
        let dev_eui = *self.by_addr.get(dev_addr)?;
        self.get(&dev_eui)
    }

    /// Insert `session` unless a session for the same device is already cached.
    ///
    /// Returns the cached session, so concurrent loaders converge on one instance.
    pub fn insert(&self, session: DeviceSession) -> Arc<DeviceSession> {
        let dev_addr = session.dev_addr;
        let dev_eui = session.dev_eui;
        let cached = self
            .by_eui
            .entry(dev_eui)
            .or_insert_with(|| Arc::new(session))
            .value()
            .clone();
        self.by_addr.insert(dev_addr, dev_eui);
        cached
    }

    /// Drop the cached session. Idempotent.
    pub fn evict(&self, dev_eui: &DevEui) -> bool {
        let Some((_, session)) = self.by_eui.remove(dev_eui) else {
            return false;
        };
        self.by_addr
            .remove_if(&session.dev_addr, |_, cached| cached == dev_eui);
        true
    }

    pub fn len(&self) -> usize {
        self.by_eui.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_eui.is_empty()
    }
}
