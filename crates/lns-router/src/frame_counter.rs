//! Frame counter strategies.
//!
//! Down-counters are computed in memory and persisted in batches: the caller calls
//! `save_changes` before the downlink leaves, and a due save that fails suppresses it. Counters
//! sent between two batched saves are lost on a crash; sessions are therefore reloaded with a
//! skip of `save_frequency` down-counter values.

use std::sync::Arc;

use async_trait::async_trait;
use lns_core::fcnt::is_plausible_restart;
use lns_core::GatewayId;

use crate::session::DeviceSession;
use crate::store::{DeviceStore, FrameCounterCoordinator, StoreError};

#[async_trait]
pub trait FrameCounterStrategy: Send + Sync {
    /// Accept a counter reset if `observed_up` is a plausible device restart.
    async fn reset(
        &self,
        session: &DeviceSession,
        observed_up: u32,
        gateway: &GatewayId,
    ) -> Result<bool, StoreError>;

    /// The down-counter for the answer to uplink `observed_up`, or `None` if this instance
    /// must not answer it.
    async fn next_down_counter(
        &self,
        session: &DeviceSession,
        observed_up: u32,
    ) -> Result<Option<u32>, StoreError>;

    /// The down-counter for delivering cloud message `message_id`, or `None` if another
    /// instance already delivered it.
    async fn next_down_for_message(
        &self,
        session: &DeviceSession,
        message_id: &str,
    ) -> Result<Option<u32>, StoreError>;

    /// Persist dirty session fields. Returns whether anything was written.
    async fn save_changes(&self, session: &DeviceSession, force: bool)
        -> Result<bool, StoreError>;

    /// Hand back a down-counter whose downlink never left this instance.
    fn release_down_counter(&self, _session: &DeviceSession, _value: u32) {}
}

/// Write the session's dirty fields and flag the session untrusted on failure.
async fn persist(store: &dyn DeviceStore, session: &DeviceSession) -> Result<bool, StoreError> {
    let changes = session.with_state(|state| state.changes());
    if changes.is_empty() {
        return Ok(false);
    }
    match store.save(session.dev_eui, &changes).await {
        Ok(()) => {
            session.with_state(|state| state.mark_saved(&changes));
            Ok(true)
        }
        Err(err) => {
            session.with_state(|state| state.untrusted = true);
            tracing::warn!(
                target: "lns.router",
                dev_eui = %session.dev_eui,
                error = %err,
                "failed to persist session; counters untrusted until reconciled"
            );
            Err(err)
        }
    }
}

/// Counters owned by this instance, persisted in batches.
pub struct SingleGatewayStrategy {
    store: Arc<dyn DeviceStore>,
    save_frequency: u32,
}

impl SingleGatewayStrategy {
    pub fn new(store: Arc<dyn DeviceStore>, save_frequency: u32) -> Self {
        Self {
            store,
            save_frequency: save_frequency.max(1),
        }
    }
}

#[async_trait]
impl FrameCounterStrategy for SingleGatewayStrategy {
    async fn reset(
        &self,
        session: &DeviceSession,
        observed_up: u32,
        gateway: &GatewayId,
    ) -> Result<bool, StoreError> {
        let accepted = session.with_state(|state| {
            if !is_plausible_restart(state.fcnt_up, observed_up, state.newly_joined) {
                return false;
            }
            state.reset_counters(observed_up);
            true
        });
        if !accepted {
            return Ok(false);
        }
        tracing::info!(
            target: "lns.router",
            dev_eui = %session.dev_eui,
            observed_up,
            gateway = %gateway,
            "frame counters reset"
        );
        self.save_changes(session, true).await?;
        Ok(true)
    }

    async fn next_down_counter(
        &self,
        session: &DeviceSession,
        _observed_up: u32,
    ) -> Result<Option<u32>, StoreError> {
        Ok(Some(session.with_state(|state| state.advance_down())))
    }

    async fn next_down_for_message(
        &self,
        session: &DeviceSession,
        _message_id: &str,
    ) -> Result<Option<u32>, StoreError> {
        Ok(Some(session.with_state(|state| state.advance_down())))
    }

    async fn save_changes(
        &self,
        session: &DeviceSession,
        force: bool,
    ) -> Result<bool, StoreError> {
        let due = session.with_state(|state| {
            force
                || state.dirty.non_counter()
                || state.unsaved_up_delta >= self.save_frequency
                || state.unsaved_down_delta >= self.save_frequency
        });
        if !due {
            return Ok(false);
        }
        persist(self.store.as_ref(), session).await
    }

    fn release_down_counter(&self, session: &DeviceSession, value: u32) {
        session.with_state(|state| state.release_down(value));
    }
}

/// Counters shared between gateways through a [`FrameCounterCoordinator`].
pub struct MultiGatewayStrategy {
    store: Arc<dyn DeviceStore>,
    coordinator: Arc<dyn FrameCounterCoordinator>,
    gateway: GatewayId,
}

impl MultiGatewayStrategy {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        coordinator: Arc<dyn FrameCounterCoordinator>,
        gateway: GatewayId,
    ) -> Self {
        Self {
            store,
            coordinator,
            gateway,
        }
    }
}

#[async_trait]
impl FrameCounterStrategy for MultiGatewayStrategy {
    async fn reset(
        &self,
        session: &DeviceSession,
        observed_up: u32,
        gateway: &GatewayId,
    ) -> Result<bool, StoreError> {
        if !self
            .coordinator
            .reset(session.dev_eui, observed_up, gateway)
            .await?
        {
            return Ok(false);
        }
        session.with_state(|state| {
            state.reset_counters(observed_up);
            // The coordinator already holds the new counters.
            state.dirty.fcnt_down = false;
            state.unsaved_down_delta = 0;
        });
        Ok(true)
    }

    async fn next_down_counter(
        &self,
        session: &DeviceSession,
        observed_up: u32,
    ) -> Result<Option<u32>, StoreError> {
        let next = self
            .coordinator
            .next_down(session.dev_eui, observed_up, &self.gateway)
            .await?;
        if let Some(value) = next {
            session.with_state(|state| state.fcnt_down = value);
        }
        Ok(next)
    }

    async fn next_down_for_message(
        &self,
        session: &DeviceSession,
        message_id: &str,
    ) -> Result<Option<u32>, StoreError> {
        let next = self
            .coordinator
            .next_down_for_message(session.dev_eui, message_id, &self.gateway)
            .await?;
        if let Some(value) = next {
            session.with_state(|state| state.fcnt_down = value);
        }
        Ok(next)
    }

    /// Every gateway reads the shared record, so nothing is batched.
    async fn save_changes(
        &self,
        session: &DeviceSession,
        _force: bool,
    ) -> Result<bool, StoreError> {
        persist(self.store.as_ref(), session).await
    }
}

/// Picks the strategy matching a device's gateway affinity.
pub struct FrameCounterStrategies {
    single: SingleGatewayStrategy,
    multi: MultiGatewayStrategy,
    save_frequency: u32,
}

impl FrameCounterStrategies {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        coordinator: Arc<dyn FrameCounterCoordinator>,
        gateway: GatewayId,
        save_frequency: u32,
    ) -> Self {
        Self {
            single: SingleGatewayStrategy::new(store.clone(), save_frequency),
            multi: MultiGatewayStrategy::new(store, coordinator, gateway),
            save_frequency: save_frequency.max(1),
        }
    }

    pub fn for_session(&self, session: &DeviceSession) -> &dyn FrameCounterStrategy {
        if session.is_single_gateway() {
            &self.single
        } else {
            &self.multi
        }
    }

    /// Down-counter values skipped when a session is (re)loaded from the store.
    pub fn reload_skip(&self, session_is_single_gateway: bool) -> u32 {
        if session_is_single_gateway {
            self.save_frequency
        } else {
            0
        }
    }
}
