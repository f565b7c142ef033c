//! Protobuf wire types exchanged with the network server.
//!
//! These messages are a fixed external contract: the bridge reads and
//! writes them but never interprets the LoRaWAN payload they carry.
//! serde derives sit next to the prost derives so the JSON marshaler
//! round-trips the exact same types (camelCase fields, bytes as
//! base64 — see `base64_bytes`).

pub mod common;
pub mod gw;

/// serde adapter encoding protobuf `bytes` fields as base64 strings
/// in the JSON marshaler.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(D::Error::custom)
    }
}
