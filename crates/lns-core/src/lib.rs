//! Core shared types for the LNS workspace.
//!
//! This crate is intentionally small: identifiers, device classes and frame
//! counter arithmetic shared by the wire protocol, the router and the binaries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod fcnt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("expected {expected} hex digits, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("invalid hex digit {0:?}")]
    InvalidDigit(char),
    #[error("gateway id must not be empty")]
    EmptyGatewayId,
}

fn parse_hex(input: &str, digits: usize) -> Result<u64, IdParseError> {
    let mut value: u64 = 0;
    let mut count = 0usize;
    for ch in input.trim().chars() {
        if ch == '-' || ch == ':' {
            continue;
        }
        let nibble = ch.to_digit(16).ok_or(IdParseError::InvalidDigit(ch))?;
        count += 1;
        if count > digits {
            continue;
        }
        value = (value << 4) | u64::from(nibble);
    }
    if count != digits {
        return Err(IdParseError::Length {
            expected: digits,
            actual: count,
        });
    }
    Ok(value)
}

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $repr:ty, $digits:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub $repr);

        impl $name {
            #[inline]
            pub const fn new(raw: $repr) -> Self {
                Self(raw)
            }

            #[inline]
            pub const fn get(self) -> $repr {
                self.0
            }

            pub fn to_le_bytes(self) -> [u8; std::mem::size_of::<$repr>()] {
                self.0.to_le_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:0width$X}", self.0, width = $digits)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({self})", stringify!($name))
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = parse_hex(s, $digits)?;
                Ok(Self(raw as $repr))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.collect_str(self)
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let text = String::deserialize(deserializer)?;
                    text.parse().map_err(serde::de::Error::custom)
                } else {
                    <$repr>::deserialize(deserializer).map(Self)
                }
            }
        }
    };
}

hex_id!(
    /// Globally unique device identifier.
    DevEui,
    u64,
    16
);

hex_id!(
    /// Identifier of a station (LoRaWAN concentrator) holding a socket to one instance.
    StationEui,
    u64,
    16
);

hex_id!(
    /// Session-scoped short network address of a device.
    DevAddr,
    u32,
    8
);

/// Gateway identity of a server instance.
///
/// Single-gateway devices are bound to exactly one gateway id; requests for them arriving at an
/// instance with a different id are rejected for ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GatewayId(String);

impl GatewayId {
    pub fn new(id: impl Into<String>) -> Result<Self, IdParseError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(IdParseError::EmptyGatewayId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GatewayId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        GatewayId::new(value)
    }
}

impl From<GatewayId> for String {
    fn from(value: GatewayId) -> Self {
        value.0
    }
}

impl FromStr for GatewayId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GatewayId::new(s)
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Downlink receptivity of a device.
///
/// Class B exists on the air but is not supported; it is rejected when a device record is
/// loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeviceClass {
    /// Downlinks only in the receive windows following an uplink.
    #[default]
    A,
    /// Continuously listening.
    C,
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(DeviceClass::A),
            "C" | "c" => Ok(DeviceClass::C),
            "B" | "b" => Err("class B devices are not supported".to_owned()),
            other => Err(format!("unknown device class {other:?}")),
        }
    }
}
