use serde::{Deserialize, Serialize};

/// Point in time, wire-compatible with `google.protobuf.Timestamp`.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    /// Non-negative fraction of a second at nanosecond resolution.
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

/// Span of time, wire-compatible with `google.protobuf.Duration`.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default)]
pub struct Duration {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct Location {
    /// Latitude.
    #[prost(double, tag = "1")]
    pub latitude: f64,
    /// Longitude.
    #[prost(double, tag = "2")]
    pub longitude: f64,
    /// Altitude (meters).
    #[prost(double, tag = "3")]
    pub altitude: f64,
    /// Location source.
    #[prost(enumeration = "LocationSource", tag = "4")]
    pub source: i32,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum LocationSource {
    /// Unknown.
    Unknown = 0,
    /// GPS.
    Gps = 1,
    /// Manually configured.
    Config = 2,
}

impl From<chrono::DateTime<chrono::Utc>> for Timestamp {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Timestamp {
            seconds: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos() as i32,
        }
    }
}

impl Timestamp {
    pub fn to_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(self.seconds, self.nanos as u32)
    }
}
