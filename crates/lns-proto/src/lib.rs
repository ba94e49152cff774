use bincode::Options;
use lns_core::{DevAddr, DevEui, DeviceClass, StationEui};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Hard limits enforced when encoding and decoding untrusted network payloads.
///
/// Both station sockets and broker connections are untrusted: a small length prefix must not be
/// able to trigger an outsized allocation.
///
/// Maximum size of a single message payload (not including the outer 4-byte length prefix).
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024; // 1 MiB

/// Maximum size of an uplink/downlink application payload.
pub const MAX_FRAME_PAYLOAD_BYTES: usize = 256;

/// Maximum UTF-8 byte length for small identifier strings (topics, reasons, message ids).
pub const MAX_SMALL_STRING_BYTES: usize = 1024;

pub mod remote;
pub mod transport;

pub use remote::{RemoteCall, RemoteCallKind, RemoteTarget};

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("message too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("{field} too large: {len} > {max}")]
    FieldTooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("trailing bytes after frame: {0}")]
    TrailingBytes(usize),

    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_BYTES as u64)
        .reject_trailing_bytes()
}

/// Encode any protocol value with the bounded bincode codec.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    codec()
        .serialize(value)
        .map_err(|err| ProtoError::Encode(err.to_string()))
}

/// Decode a protocol value; fails on oversized input and on trailing bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtoError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ProtoError::TooLarge {
            len: bytes.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    codec()
        .deserialize(bytes)
        .map_err(|err| ProtoError::Decode(err.to_string()))
}

fn check_field(field: &'static str, len: usize, max: usize) -> Result<(), ProtoError> {
    if len > max {
        return Err(ProtoError::FieldTooLarge { field, len, max });
    }
    Ok(())
}

/// Signal quality reported by the station for a received frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RadioMetadata {
    pub rssi: f32,
    pub snr: f32,
    pub frequency_hz: u32,
    pub data_rate: u8,
}

/// A data uplink as handed over by a station.
///
/// Only the fields needed for deduplication and counter checks are interpreted; the payload is
/// opaque.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UplinkFrame {
    pub dev_addr: DevAddr,
    /// Low 16 bits of the device's up-counter, as carried on the air.
    pub fcnt: u16,
    pub mic: u32,
    pub confirmed: bool,
    pub fport: Option<u8>,
    pub payload: Vec<u8>,
    pub radio: RadioMetadata,
    /// Station receive time, milliseconds since the Unix epoch.
    pub received_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownlinkFrame {
    pub dev_eui: DevEui,
    pub dev_addr: DevAddr,
    pub fcnt_down: u32,
    /// Acknowledges a confirmed uplink.
    pub ack: bool,
    pub fport: Option<u8>,
    pub payload: Vec<u8>,
    pub class: DeviceClass,
    pub message_id: Option<String>,
}

/// A message originating in the cloud, addressed to one device.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloudToDeviceMessage {
    pub message_id: String,
    pub fport: Option<u8>,
    pub confirmed: bool,
    pub payload: Vec<u8>,
}

impl CloudToDeviceMessage {
    /// Reject payloads and ids no station could carry.
    pub fn validate(&self) -> Result<(), ProtoError> {
        check_field("message_id", self.message_id.len(), MAX_SMALL_STRING_BYTES)?;
        check_field("payload", self.payload.len(), MAX_FRAME_PAYLOAD_BYTES)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        self.validate()?;
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        let message: Self = decode(bytes)?;
        message.validate()?;
        Ok(message)
    }
}

/// Reason carried by an explicit rejection sent back to a station.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectReason {
    InvalidFrameCounter,
    FrameCounterUpdateFailed,
}

/// Messages exchanged on a station socket.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum StationMessage {
    /// First message on every station connection.
    Hello { station: StationEui },
    Uplink(UplinkFrame),
    Downlink(DownlinkFrame),
    Rejected {
        dev_addr: DevAddr,
        fcnt: u16,
        reason: RejectReason,
    },
    /// Sent by the server before it closes the connection on purpose.
    Close { reason: String },
}

impl StationMessage {
    pub fn validate(&self) -> Result<(), ProtoError> {
        match self {
            StationMessage::Hello { .. } | StationMessage::Rejected { .. } => Ok(()),
            StationMessage::Uplink(frame) => {
                check_field("payload", frame.payload.len(), MAX_FRAME_PAYLOAD_BYTES)
            }
            StationMessage::Downlink(frame) => {
                check_field("payload", frame.payload.len(), MAX_FRAME_PAYLOAD_BYTES)?;
                let id_len = frame.message_id.as_ref().map_or(0, String::len);
                check_field("message_id", id_len, MAX_SMALL_STRING_BYTES)
            }
            StationMessage::Close { reason } => {
                check_field("reason", reason.len(), MAX_SMALL_STRING_BYTES)
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        self.validate()?;
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        let message: Self = decode(bytes)?;
        message.validate()?;
        Ok(message)
    }
}

/// Frames exchanged between an instance and the broadcast broker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BusFrame {
    Subscribe { topic: String },
    Publish { topic: String, payload: Vec<u8> },
    Deliver { topic: String, payload: Vec<u8> },
}

impl BusFrame {
    pub fn validate(&self) -> Result<(), ProtoError> {
        check_field("topic", self.topic().len(), MAX_SMALL_STRING_BYTES)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        self.validate()?;
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        let frame: Self = decode(bytes)?;
        frame.validate()?;
        Ok(frame)
    }

    pub fn topic(&self) -> &str {
        match self {
            BusFrame::Subscribe { topic }
            | BusFrame::Publish { topic, .. }
            | BusFrame::Deliver { topic, .. } => topic,
        }
    }
}
