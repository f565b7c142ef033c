#![allow(clippy::enum_variant_names)]

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::common;

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default)]
pub struct Modulation {
    #[prost(oneof = "modulation::Parameters", tags = "1, 2")]
    pub parameters: ::std::option::Option<modulation::Parameters>,
}

pub mod modulation {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Oneof)]
    #[serde(rename_all = "camelCase")]
    pub enum Parameters {
        /// LoRa modulation information.
        #[prost(message, tag = "1")]
        Lora(super::LoraModulationInfo),
        /// FSK modulation information.
        #[prost(message, tag = "2")]
        Fsk(super::FskModulationInfo),
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct LoraModulationInfo {
    /// Bandwidth (kHz).
    #[prost(uint32, tag = "1")]
    pub bandwidth: u32,
    /// Spreading-factor.
    #[prost(uint32, tag = "2")]
    pub spreading_factor: u32,
    /// Code-rate (e.g. "4/5").
    #[prost(string, tag = "3")]
    pub code_rate: ::std::string::String,
    /// Polarization inversion.
    #[prost(bool, tag = "4")]
    pub polarization_inversion: bool,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct FskModulationInfo {
    /// Frequency deviation (Hz).
    #[prost(uint32, tag = "1")]
    pub frequency_deviation: u32,
    /// FSK datarate (bits / sec).
    #[prost(uint32, tag = "2")]
    pub datarate: u32,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct UplinkTxInfo {
    /// Frequency (Hz).
    #[prost(uint32, tag = "1")]
    pub frequency: u32,
    /// Modulation.
    #[prost(message, optional, tag = "2")]
    pub modulation: ::std::option::Option<Modulation>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct UplinkRxInfo {
    /// Gateway ID (EUI-64).
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "super::base64_bytes")]
    pub gateway_id: ::std::vec::Vec<u8>,
    /// RX time, only set when the gateway has a GPS or NTP time source.
    #[prost(message, optional, tag = "2")]
    pub time: ::std::option::Option<common::Timestamp>,
    /// RSSI (dBm).
    #[prost(int32, tag = "3")]
    pub rssi: i32,
    /// LoRa SNR (dB).
    #[prost(double, tag = "4")]
    pub lora_snr: f64,
    /// Concentrator channel.
    #[prost(uint32, tag = "5")]
    pub channel: u32,
    /// RF chain.
    #[prost(uint32, tag = "6")]
    pub rf_chain: u32,
    /// Board.
    #[prost(uint32, tag = "7")]
    pub board: u32,
    /// Antenna.
    #[prost(uint32, tag = "8")]
    pub antenna: u32,
    /// Gateway location.
    #[prost(message, optional, tag = "9")]
    pub location: ::std::option::Option<common::Location>,
    /// Gateway-specific context, echoed back on downlink.
    #[prost(bytes = "vec", tag = "10")]
    #[serde(with = "super::base64_bytes")]
    pub context: ::std::vec::Vec<u8>,
    /// Gateway internal counter value at reception (microseconds),
    /// used to schedule the downlink in the same receive window.
    #[prost(uint32, tag = "11")]
    pub timestamp: u32,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct UplinkFrame {
    /// PHY payload.
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "super::base64_bytes")]
    pub phy_payload: ::std::vec::Vec<u8>,
    /// TX information.
    #[prost(message, optional, tag = "2")]
    pub tx_info: ::std::option::Option<UplinkTxInfo>,
    /// RX information.
    #[prost(message, optional, tag = "3")]
    pub rx_info: ::std::option::Option<UplinkRxInfo>,
    /// Serialized span context, for cross-process trace propagation.
    #[prost(bytes = "vec", tag = "4")]
    #[serde(with = "super::base64_bytes")]
    pub carrier: ::std::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct DownlinkTxInfo {
    /// Gateway ID (EUI-64).
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "super::base64_bytes")]
    pub gateway_id: ::std::vec::Vec<u8>,
    /// Transmit immediately, ignoring the timestamp fields.
    #[prost(bool, tag = "2")]
    pub immediately: bool,
    /// Gateway internal counter value at which to transmit (microseconds).
    #[prost(uint32, tag = "3")]
    pub timestamp: u32,
    /// Transmit at the given GPS epoch offset.
    #[prost(message, optional, tag = "4")]
    pub time_since_gps_epoch: ::std::option::Option<common::Duration>,
    /// Frequency (Hz).
    #[prost(uint32, tag = "5")]
    pub frequency: u32,
    /// Transmit power (dBm).
    #[prost(int32, tag = "6")]
    pub power: i32,
    /// Modulation.
    #[prost(message, optional, tag = "7")]
    pub modulation: ::std::option::Option<Modulation>,
    /// Board.
    #[prost(uint32, tag = "8")]
    pub board: u32,
    /// Antenna.
    #[prost(uint32, tag = "9")]
    pub antenna: u32,
    /// Gateway-specific context, as received in the uplink RX info.
    #[prost(bytes = "vec", tag = "10")]
    #[serde(with = "super::base64_bytes")]
    pub context: ::std::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct DownlinkFrame {
    /// PHY payload.
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "super::base64_bytes")]
    pub phy_payload: ::std::vec::Vec<u8>,
    /// TX information.
    #[prost(message, optional, tag = "2")]
    pub tx_info: ::std::option::Option<DownlinkTxInfo>,
    /// Token supplied by the network server, echoed in the TX ack.
    #[prost(uint32, tag = "3")]
    pub token: u32,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct DownlinkTxAck {
    /// Gateway ID (EUI-64).
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "super::base64_bytes")]
    pub gateway_id: ::std::vec::Vec<u8>,
    /// Token of the acknowledged downlink.
    #[prost(uint32, tag = "2")]
    pub token: u32,
    /// Empty on success, else the gateway fault code (e.g. "TOO_LATE").
    #[prost(string, tag = "3")]
    pub error: ::std::string::String,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayStats {
    /// Gateway ID (EUI-64).
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "super::base64_bytes")]
    pub gateway_id: ::std::vec::Vec<u8>,
    /// Gateway IP address.
    #[prost(string, tag = "2")]
    pub ip: ::std::string::String,
    /// Time of the statistics snapshot.
    #[prost(message, optional, tag = "3")]
    pub time: ::std::option::Option<common::Timestamp>,
    /// Gateway location.
    #[prost(message, optional, tag = "4")]
    pub location: ::std::option::Option<common::Location>,
    /// Version of the most recently applied configuration, empty if none.
    #[prost(string, tag = "5")]
    pub config_version: ::std::string::String,
    /// Radio packets received.
    #[prost(uint32, tag = "6")]
    pub rx_packets_received: u32,
    /// Radio packets received with a valid CRC.
    #[prost(uint32, tag = "7")]
    pub rx_packets_received_ok: u32,
    /// Downlink packets received for transmission.
    #[prost(uint32, tag = "8")]
    pub tx_packets_received: u32,
    /// Downlink packets emitted.
    #[prost(uint32, tag = "9")]
    pub tx_packets_emitted: u32,
    /// Additional metadata (static + dynamic).
    #[prost(map = "string, string", tag = "10")]
    pub meta_data: HashMap<::std::string::String, ::std::string::String>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfiguration {
    /// Gateway ID (EUI-64).
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "super::base64_bytes")]
    pub gateway_id: ::std::vec::Vec<u8>,
    /// Configuration version, echoed in subsequent stats.
    #[prost(string, tag = "2")]
    pub version: ::std::string::String,
    /// Channel plan.
    #[prost(message, repeated, tag = "3")]
    pub channels: ::std::vec::Vec<ChannelConfiguration>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfiguration {
    /// Frequency (Hz).
    #[prost(uint32, tag = "1")]
    pub frequency: u32,
    #[prost(oneof = "channel_configuration::ModulationConfig", tags = "2, 3")]
    #[serde(flatten)]
    pub modulation_config: ::std::option::Option<channel_configuration::ModulationConfig>,
}

pub mod channel_configuration {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Oneof)]
    #[serde(rename_all = "camelCase")]
    pub enum ModulationConfig {
        /// LoRa modulation configuration.
        #[prost(message, tag = "2")]
        LoraModulationConfig(super::LoraModulationConfig),
        /// FSK modulation configuration.
        #[prost(message, tag = "3")]
        FskModulationConfig(super::FskModulationConfig),
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct LoraModulationConfig {
    /// Bandwidth (kHz).
    #[prost(uint32, tag = "1")]
    pub bandwidth: u32,
    /// Enabled spreading-factors.
    #[prost(uint32, repeated, tag = "2")]
    pub spreading_factors: ::std::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
#[serde(default, rename_all = "camelCase")]
pub struct FskModulationConfig {
    /// Bandwidth (kHz).
    #[prost(uint32, tag = "1")]
    pub bandwidth: u32,
    /// Bitrate (bits / sec).
    #[prost(uint32, tag = "2")]
    pub bitrate: u32,
}
