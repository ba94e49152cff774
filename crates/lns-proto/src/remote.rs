//! Cross-instance remote call envelope.
//!
//! An envelope is published once on the broadcast channel and every instance sees it. Only the
//! instance owning `target` acts on it; everybody else drops it.

use std::fmt;

use lns_core::{DevEui, StationEui};
use serde::{Deserialize, Serialize};

use crate::{decode, encode, ProtoError};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RemoteCallKind {
    CloudToDeviceMessage,
    ClearCache,
    CloseConnection,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RemoteTarget {
    Station(StationEui),
    Device(DevEui),
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteTarget::Station(eui) => write!(f, "station:{eui}"),
            RemoteTarget::Device(eui) => write!(f, "device:{eui}"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteCall {
    pub kind: RemoteCallKind,
    pub target: RemoteTarget,
    pub payload: Vec<u8>,
}

impl fmt::Debug for RemoteCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCall")
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl RemoteCall {
    /// Forward an already-encoded station message to the instance owning `station`.
    pub fn forward_to_station(station: StationEui, message: Vec<u8>) -> Self {
        Self {
            kind: RemoteCallKind::CloudToDeviceMessage,
            target: RemoteTarget::Station(station),
            payload: message,
        }
    }

    /// Deliver an encoded `CloudToDeviceMessage` to whichever instance serves `device`.
    pub fn cloud_to_device(device: DevEui, message: Vec<u8>) -> Self {
        Self {
            kind: RemoteCallKind::CloudToDeviceMessage,
            target: RemoteTarget::Device(device),
            payload: message,
        }
    }

    pub fn clear_cache(device: DevEui) -> Self {
        Self {
            kind: RemoteCallKind::ClearCache,
            target: RemoteTarget::Device(device),
            payload: Vec::new(),
        }
    }

    pub fn close_connection(station: StationEui) -> Self {
        Self {
            kind: RemoteCallKind::CloseConnection,
            target: RemoteTarget::Station(station),
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        decode(bytes)
    }
}
