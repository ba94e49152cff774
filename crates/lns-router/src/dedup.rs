//! Concentrator-level uplink deduplication.
//!
//! The same logical uplink is usually heard by several stations, each possibly connected to a
//! different instance. Frames are keyed by content, never by station, and the first arrival
//! within the window wins.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use lns_config::DedupConfig;
use lns_core::StationEui;
use lns_proto::UplinkFrame;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

pub type DedupKey = [u8; 32];

/// Content fingerprint of an uplink: address, wire counter, MIC and payload.
pub fn dedup_key(frame: &UplinkFrame) -> DedupKey {
    let mut hasher = Sha256::new();
    hasher.update(frame.dev_addr.to_le_bytes());
    hasher.update(frame.fcnt.to_le_bytes());
    hasher.update(frame.mic.to_le_bytes());
    hasher.update(&frame.payload);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupResult {
    /// First sighting within the window.
    NotDuplicate,
    /// Already seen from another station.
    Duplicate { first_station: StationEui },
    /// The station that delivered the first copy sent it again.
    Resubmission,
}

#[derive(Debug, Clone, Copy)]
struct Seen {
    station: StationEui,
    at: Instant,
}

#[derive(Debug)]
pub struct DeduplicationEngine {
    window: Duration,
    capacity: usize,
    entries: DashMap<DedupKey, Seen>,
    /// Insertion order for eviction. A key refreshed after expiry appears twice; only the
    /// record matching the entry's timestamp is live.
    order: Mutex<VecDeque<(DedupKey, Instant)>>,
}

impl DeduplicationEngine {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.window(), config.capacity)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// `true` when `frame` must not be processed again.
    ///
    /// A station resubmitting an unconfirmed frame is a duplicate; resubmitting a confirmed
    /// frame is not, because the device is waiting for an acknowledgement.
    pub fn is_duplicate(&self, frame: &UplinkFrame, station: StationEui) -> bool {
        match self.check(frame, station) {
            DedupResult::NotDuplicate => false,
            DedupResult::Duplicate { .. } => true,
            DedupResult::Resubmission => !frame.confirmed,
        }
    }

    pub fn check(&self, frame: &UplinkFrame, station: StationEui) -> DedupResult {
        self.check_at(frame, station, Instant::now())
    }

    pub fn check_at(&self, frame: &UplinkFrame, station: StationEui, now: Instant) -> DedupResult {
        let key = dedup_key(frame);

        // Never make room while holding an entry guard: both touch the same shards.
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.make_room(now);
        }

        let result = match self.entries.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(Seen { station, at: now });
                DedupResult::NotDuplicate
            }
            Entry::Occupied(mut occupied) => {
                let seen = *occupied.get();
                if now.saturating_duration_since(seen.at) >= self.window {
                    occupied.insert(Seen { station, at: now });
                    DedupResult::NotDuplicate
                } else if seen.station == station {
                    DedupResult::Resubmission
                } else {
                    tracing::debug!(
                        target: "lns.router",
                        key = %hex::encode(&key[..8]),
                        first_station = %seen.station,
                        station = %station,
                        "duplicate uplink"
                    );
                    DedupResult::Duplicate {
                        first_station: seen.station,
                    }
                }
            }
        };
        // Recorded after the entry guard is released; eviction locks in the opposite order.
        if result == DedupResult::NotDuplicate {
            self.order.lock().push_back((key, now));
        }
        result
    }

    /// Remove every entry older than the window. Returns the number removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, seen| now.saturating_duration_since(seen.at) < self.window);
        {
            let mut order = self.order.lock();
            while order
                .front()
                .is_some_and(|(_, at)| now.saturating_duration_since(*at) >= self.window)
            {
                order.pop_front();
            }
        }
        before.saturating_sub(self.entries.len())
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn make_room(&self, now: Instant) {
        if self.sweep_at(now) > 0 && self.entries.len() < self.capacity {
            return;
        }
        loop {
            let Some((key, at)) = self.order.lock().pop_front() else {
                return;
            };
            if self
                .entries
                .remove_if(&key, |_, seen| seen.at == at)
                .is_some()
            {
                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep expired entries every `interval` until `token` is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        tracing::trace!(target: "lns.router", removed, "swept dedup entries");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use lns_core::DevAddr;
    use lns_proto::RadioMetadata;

    use super::*;

    fn frame(fcnt: u16, confirmed: bool) -> UplinkFrame {
        UplinkFrame {
            dev_addr: DevAddr::new(0x2601_1F2A),
            fcnt,
            mic: 0xCAFE_F00D,
            confirmed,
            fport: Some(1),
            payload: vec![0x01, 0x02],
            radio: RadioMetadata::default(),
            received_at_ms: 0,
        }
    }

    const S1: StationEui = StationEui::new(1);
    const S2: StationEui = StationEui::new(2);

    #[test]
    fn key_ignores_radio_metadata() {
        let a = frame(5, false);
        let mut b = a.clone();
        b.radio.rssi = -120.0;
        b.received_at_ms = 99;
        assert_eq!(dedup_key(&a), dedup_key(&b));

        let mut c = a.clone();
        c.fcnt = 6;
        assert_ne!(dedup_key(&a), dedup_key(&c));
    }

    #[test]
    fn second_station_within_window_is_duplicate() {
        let engine = DeduplicationEngine::new(Duration::from_millis(200), 16);
        let now = Instant::now();
        assert_eq!(engine.check_at(&frame(5, false), S1, now), DedupResult::NotDuplicate);
        assert_eq!(
            engine.check_at(&frame(5, false), S2, now + Duration::from_millis(50)),
            DedupResult::Duplicate { first_station: S1 }
        );
        assert_eq!(
            engine.check_at(&frame(5, false), S1, now + Duration::from_millis(60)),
            DedupResult::Resubmission
        );
    }

    #[test]
    fn confirmed_resubmission_is_not_a_duplicate() {
        let engine = DeduplicationEngine::new(Duration::from_secs(60), 16);
        assert!(!engine.is_duplicate(&frame(5, true), S1));
        assert!(!engine.is_duplicate(&frame(5, true), S1));
        assert!(engine.is_duplicate(&frame(5, true), S2));

        assert!(!engine.is_duplicate(&frame(6, false), S1));
        assert!(engine.is_duplicate(&frame(6, false), S1));
    }

    #[test]
    fn entries_expire_without_further_traffic() {
        let engine = DeduplicationEngine::new(Duration::from_millis(200), 16);
        let now = Instant::now();
        engine.check_at(&frame(5, false), S1, now);
        engine.check_at(&frame(6, false), S1, now + Duration::from_millis(150));

        assert_eq!(engine.sweep_at(now + Duration::from_millis(250)), 1);
        assert_eq!(engine.len(), 1);
        assert_eq!(
            engine.check_at(&frame(5, false), S2, now + Duration::from_millis(260)),
            DedupResult::NotDuplicate
        );
    }

    #[test]
    fn capacity_evicts_the_oldest_entry() {
        let engine = DeduplicationEngine::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        engine.check_at(&frame(1, false), S1, now);
        engine.check_at(&frame(2, false), S1, now + Duration::from_millis(1));
        engine.check_at(&frame(3, false), S1, now + Duration::from_millis(2));

        assert_eq!(engine.len(), 2);
        assert_eq!(
            engine.check_at(&frame(1, false), S2, now + Duration::from_millis(3)),
            DedupResult::NotDuplicate
        );
    }

    #[test]
    fn refreshed_entry_is_evicted_by_its_latest_sighting() {
        let engine = DeduplicationEngine::new(Duration::from_millis(100), 2);
        let now = Instant::now();
        engine.check_at(&frame(1, false), S1, now);
        engine.check_at(&frame(2, false), S1, now + Duration::from_millis(50));
        // Frame 1 expired and is seen again: its old queue record is dead.
        engine.check_at(&frame(1, false), S1, now + Duration::from_millis(120));
        engine.check_at(&frame(3, false), S1, now + Duration::from_millis(130));

        assert_eq!(engine.len(), 2);
        assert_eq!(
            engine.check_at(&frame(1, false), S2, now + Duration::from_millis(140)),
            DedupResult::Duplicate { first_station: S1 }
        );
        assert_eq!(
            engine.check_at(&frame(3, false), S2, now + Duration::from_millis(141)),
            DedupResult::Duplicate { first_station: S1 }
        );
    }
}
