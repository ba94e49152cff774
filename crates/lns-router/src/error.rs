use lns_core::{DevAddr, DevEui, GatewayId, IdParseError};

use crate::bus::BusError;

/// Coarse classification of a terminal request failure.
///
/// Stations never see these directly; they drive logging and the decision to answer a station
/// with an explicit rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Ownership,
    Deduplication,
    CounterInvalid,
    BackendUnavailable,
    QueueOverload,
    ConnectionStale,
    Cancelled,
    Downlink,
}

/// Terminal failure of one device request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestFailure {
    #[error("device {dev_eui} belongs to gateway {owner}")]
    BelongsToAnotherGateway { dev_eui: DevEui, owner: GatewayId },

    #[error("no device known for address {0}")]
    UnknownDevice(DevAddr),

    #[error("duplicate uplink")]
    DuplicateUplink,

    #[error("invalid frame counter: last {last}, observed {observed}")]
    InvalidFrameCounter { last: u32, observed: u32 },

    #[error("frame counter update failed: {0}")]
    FrameCounterUpdateFailed(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("device queue overloaded ({depth} pending)")]
    QueueOverloaded { depth: usize },

    #[error("station connection was replaced")]
    ConnectionStale,

    #[error("request cancelled")]
    Cancelled,

    #[error("downlink failed: {0}")]
    DownlinkFailed(String),
}

impl RequestFailure {
    pub fn class(&self) -> FailureClass {
        match self {
            RequestFailure::BelongsToAnotherGateway { .. } | RequestFailure::UnknownDevice(_) => {
                FailureClass::Ownership
            }
            RequestFailure::DuplicateUplink => FailureClass::Deduplication,
            RequestFailure::InvalidFrameCounter { .. } => FailureClass::CounterInvalid,
            RequestFailure::FrameCounterUpdateFailed(_) | RequestFailure::BackendUnavailable(_) => {
                FailureClass::BackendUnavailable
            }
            RequestFailure::QueueOverloaded { .. } => FailureClass::QueueOverload,
            RequestFailure::ConnectionStale => FailureClass::ConnectionStale,
            RequestFailure::Cancelled => FailureClass::Cancelled,
            RequestFailure::DownlinkFailed(_) => FailureClass::Downlink,
        }
    }

    /// Whether the originating station gets an explicit rejection frame.
    ///
    /// Dedup and ownership drops are silent on the air.
    pub fn rejects_to_station(&self) -> bool {
        matches!(
            self,
            RequestFailure::InvalidFrameCounter { .. } | RequestFailure::FrameCounterUpdateFailed(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid gateway id: {0}")]
    GatewayId(#[from] IdParseError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_counter_failures_are_reported_to_stations() {
        assert!(RequestFailure::InvalidFrameCounter {
            last: 10,
            observed: 3
        }
        .rejects_to_station());
        assert!(RequestFailure::FrameCounterUpdateFailed("store down".into()).rejects_to_station());
        assert!(!RequestFailure::DuplicateUplink.rejects_to_station());
        assert!(!RequestFailure::UnknownDevice(DevAddr::new(1)).rejects_to_station());
    }

    #[test]
    fn classes_follow_the_taxonomy() {
        assert_eq!(
            RequestFailure::QueueOverloaded { depth: 10 }.class(),
            FailureClass::QueueOverload
        );
        assert_eq!(
            RequestFailure::FrameCounterUpdateFailed(String::new()).class(),
            FailureClass::BackendUnavailable
        );
        assert_eq!(
            RequestFailure::ConnectionStale.class(),
            FailureClass::ConnectionStale
        );
    }
}
