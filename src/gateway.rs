//! Gateway identifier (EUI-64)
//!
//! The 8-byte extended unique identifier every gateway reports in its
//! UDP header or connection URL. Serialized as 16 lowercase hex
//! characters everywhere it crosses a text boundary (config files,
//! MQTT topics, log fields).

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// EUI-64 gateway identifier, the primary key across all components.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatewayId([u8; 8]);

impl GatewayId {
    pub const LEN: usize = 8;

    pub fn new(bytes: [u8; 8]) -> Self {
        GatewayId(bytes)
    }

    /// Build an id from a byte slice, as read from a protobuf field.
    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() != Self::LEN {
            anyhow::bail!("gateway id must be {} bytes, got {}", Self::LEN, bytes.len());
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(bytes);
        Ok(GatewayId(id))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// The id as a big-endian integer, used by the Basic Station
    /// protocol which encodes EUIs as JSON numbers.
    pub fn to_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn from_u64(v: u64) -> Self {
        GatewayId(v.to_be_bytes())
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GatewayId({})", self)
    }
}

impl FromStr for GatewayId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| anyhow::anyhow!("invalid gateway id '{}': {}", s, e))?;
        Self::from_slice(&bytes)
    }
}

impl From<[u8; 8]> for GatewayId {
    fn from(bytes: [u8; 8]) -> Self {
        GatewayId(bytes)
    }
}

impl Serialize for GatewayId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for GatewayId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
