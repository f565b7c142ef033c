//! Semtech UDP Packet Forwarder Protocol (GWMP)
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! The protocol uses a simple binary header followed by JSON payload.
//! All multi-byte integers are big-endian (network byte order).

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compiled::{common, gw};
use crate::gateway::GatewayId;

/// Protocol versions spoken by deployed packet-forwarders. The
/// responder always echoes the version of the request.
pub const PROTOCOL_VERSION_1: u8 = 0x01;
pub const PROTOCOL_VERSION_2: u8 = 0x02;

/// Packet types (identifier byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::PushData),
            0x01 => Ok(PacketType::PushAck),
            0x02 => Ok(PacketType::PullData),
            0x03 => Ok(PacketType::PullResp),
            0x04 => Ok(PacketType::PullAck),
            0x05 => Ok(PacketType::TxAck),
            _ => Err(anyhow::anyhow!("Unknown packet type: 0x{:02x}", value)),
        }
    }
}

/// Read the packet type out of a raw datagram without a full parse.
pub fn packet_type(data: &[u8]) -> anyhow::Result<PacketType> {
    if data.len() < 4 {
        anyhow::bail!("Packet too short: {} bytes", data.len());
    }
    if data[0] != PROTOCOL_VERSION_1 && data[0] != PROTOCOL_VERSION_2 {
        anyhow::bail!("Unsupported protocol version: 0x{:02x}", data[0]);
    }
    PacketType::try_from(data[3])
}

fn parse_prefix(data: &[u8], expected: PacketType) -> anyhow::Result<(u8, u16)> {
    if data.len() < 4 {
        anyhow::bail!("Packet too short: {} bytes", data.len());
    }
    let version = data[0];
    if version != PROTOCOL_VERSION_1 && version != PROTOCOL_VERSION_2 {
        anyhow::bail!("Unsupported protocol version: 0x{:02x}", version);
    }
    let token = u16::from_be_bytes([data[1], data[2]]);
    let pt = PacketType::try_from(data[3])?;
    if pt != expected {
        anyhow::bail!("Expected {:?} packet, got {:?}", expected, pt);
    }
    Ok((version, token))
}

fn parse_gateway_id(buf: &mut &[u8]) -> anyhow::Result<GatewayId> {
    if buf.remaining() < 8 {
        anyhow::bail!("Packet too short for gateway id");
    }
    let mut id = [0u8; 8];
    buf.copy_to_slice(&mut id);
    Ok(GatewayId::new(id))
}

/// Data-rate identifier: `"SF7BW125"` style for LoRa, a plain bitrate
/// number for FSK. Serialized exactly that way in `rxpk`/`txpk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRate {
    Lora { spreading_factor: u32, bandwidth: u32 },
    Fsk { bitrate: u32 },
}

impl Serialize for DataRate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DataRate::Lora { spreading_factor, bandwidth } => {
                serializer.serialize_str(&format!("SF{}BW{}", spreading_factor, bandwidth))
            }
            DataRate::Fsk { bitrate } => serializer.serialize_u32(*bitrate),
        }
    }
}

impl<'de> Deserialize<'de> for DataRate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error as _;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Lora(String),
            Fsk(u32),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Fsk(bitrate) => Ok(DataRate::Fsk { bitrate }),
            Raw::Lora(s) => {
                let rest = s
                    .strip_prefix("SF")
                    .ok_or_else(|| D::Error::custom(format!("invalid datr: {}", s)))?;
                let (sf, bw) = rest
                    .split_once("BW")
                    .ok_or_else(|| D::Error::custom(format!("invalid datr: {}", s)))?;
                Ok(DataRate::Lora {
                    spreading_factor: sf
                        .parse()
                        .map_err(|_| D::Error::custom(format!("invalid datr: {}", s)))?,
                    bandwidth: bw
                        .parse()
                        .map_err(|_| D::Error::custom(format!("invalid datr: {}", s)))?,
                })
            }
        }
    }
}

/// Rxpk (received packet) record from the PUSH_DATA JSON payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    /// UTC time of packet reception (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Concentrator timestamp (microseconds)
    pub tmst: u32,
    /// RF channel
    #[serde(default)]
    pub chan: u32,
    /// Concentrator RF chain
    #[serde(default)]
    pub rfch: u32,
    /// Frequency in MHz
    pub freq: f64,
    /// CRC status: 1 = OK, -1 = fail, 0 = no CRC
    pub stat: i32,
    /// Modulation (LORA or FSK)
    #[serde(default)]
    pub modu: String,
    /// Data-rate identifier
    pub datr: DataRate,
    /// LoRa coding rate (e.g., "4/5")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    /// RSSI in dBm
    pub rssi: i32,
    /// LoRa signal-to-noise ratio
    #[serde(default)]
    pub lsnr: f64,
    /// RF packet payload size in bytes
    pub size: u16,
    /// Base64 encoded RF packet payload
    pub data: String,
}

/// Stat (gateway status) record from the PUSH_DATA JSON payload.
/// The time format here predates RFC 3339: `"2014-01-12 08:59:28 GMT"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Stat {
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lati: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alti: Option<i32>,
    /// Radio packets received
    pub rxnb: u32,
    /// Radio packets received with valid CRC
    pub rxok: u32,
    /// Radio packets forwarded
    pub rxfw: u32,
    /// Acknowledged upstream datagrams (percentage)
    pub ackr: f64,
    /// Downlink datagrams received
    pub dwnb: u32,
    /// Packets emitted
    pub txnb: u32,
}

/// PUSH_DATA JSON wrapper
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PushDataPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rxpk: Option<Vec<Rxpk>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat: Option<Stat>,
}

/// PUSH_DATA: gateway → bridge, uplinks and status
#[derive(Debug)]
pub struct PushDataPacket {
    pub protocol_version: u8,
    pub random_token: u16,
    pub gateway_id: GatewayId,
    pub payload: PushDataPayload,
}

impl PushDataPacket {
    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        let (protocol_version, random_token) = parse_prefix(data, PacketType::PushData)?;
        let mut buf = &data[4..];
        let gateway_id = parse_gateway_id(&mut buf)?;
        let payload: PushDataPayload = serde_json::from_slice(buf)
            .map_err(|e| anyhow::anyhow!("Invalid PUSH_DATA JSON: {}", e))?;
        Ok(PushDataPacket {
            protocol_version,
            random_token,
            gateway_id,
            payload,
        })
    }

    /// Convert the `stat` record, when present, to a stats event.
    pub fn gateway_stats(&self) -> anyhow::Result<Option<gw::GatewayStats>> {
        let stat = match &self.payload.stat {
            Some(s) => s,
            None => return Ok(None),
        };

        let time = parse_stat_time(&stat.time)?;

        let location = match (stat.lati, stat.long) {
            (Some(latitude), Some(longitude)) => Some(common::Location {
                latitude,
                longitude,
                altitude: stat.alti.unwrap_or(0) as f64,
                source: common::LocationSource::Gps as i32,
            }),
            _ => None,
        };

        Ok(Some(gw::GatewayStats {
            gateway_id: self.gateway_id.to_vec(),
            time: Some(common::Timestamp::from(time)),
            location,
            rx_packets_received: stat.rxnb,
            rx_packets_received_ok: stat.rxok,
            tx_packets_received: stat.dwnb,
            tx_packets_emitted: stat.txnb,
            ..Default::default()
        }))
    }

    /// Convert the `rxpk` records to uplink events. Records with a
    /// failed CRC are dropped unless `skip_crc_check` is set; records
    /// without a time source get the current time when `fake_rx_time`
    /// is set.
    pub fn uplink_frames(
        &self,
        skip_crc_check: bool,
        fake_rx_time: bool,
    ) -> anyhow::Result<Vec<gw::UplinkFrame>> {
        let rxpks = match &self.payload.rxpk {
            Some(r) => r,
            None => return Ok(Vec::new()),
        };

        let mut frames = Vec::with_capacity(rxpks.len());
        for rxpk in rxpks {
            if rxpk.stat == -1 && !skip_crc_check {
                tracing::debug!(
                    gateway_id = %self.gateway_id,
                    "udp: dropping rxpk with invalid crc"
                );
                continue;
            }
            frames.push(self.uplink_frame(rxpk, fake_rx_time)?);
        }
        Ok(frames)
    }

    fn uplink_frame(&self, rxpk: &Rxpk, fake_rx_time: bool) -> anyhow::Result<gw::UplinkFrame> {
        use base64::Engine;
        let phy_payload = base64::engine::general_purpose::STANDARD
            .decode(&rxpk.data)
            .map_err(|e| anyhow::anyhow!("Base64 decode error: {}", e))?;

        let parameters = match rxpk.datr {
            DataRate::Lora { spreading_factor, bandwidth } => {
                gw::modulation::Parameters::Lora(gw::LoraModulationInfo {
                    bandwidth,
                    spreading_factor,
                    code_rate: rxpk.codr.clone().unwrap_or_default(),
                    polarization_inversion: false,
                })
            }
            DataRate::Fsk { bitrate } => gw::modulation::Parameters::Fsk(gw::FskModulationInfo {
                frequency_deviation: bitrate / 2,
                datarate: bitrate,
            }),
        };

        let time = match rxpk.time {
            Some(t) => Some(common::Timestamp::from(t)),
            None if fake_rx_time => Some(common::Timestamp::from(Utc::now())),
            None => None,
        };

        Ok(gw::UplinkFrame {
            phy_payload,
            tx_info: Some(gw::UplinkTxInfo {
                frequency: (rxpk.freq * 1_000_000.0).round() as u32,
                modulation: Some(gw::Modulation {
                    parameters: Some(parameters),
                }),
            }),
            rx_info: Some(gw::UplinkRxInfo {
                gateway_id: self.gateway_id.to_vec(),
                time,
                rssi: rxpk.rssi,
                lora_snr: rxpk.lsnr,
                channel: rxpk.chan,
                rf_chain: rxpk.rfch,
                timestamp: rxpk.tmst,
                ..Default::default()
            }),
            carrier: Vec::new(),
        })
    }
}

/// PUSH_ACK: bridge → gateway, acknowledges a PUSH_DATA
#[derive(Debug, PartialEq)]
pub struct PushAckPacket {
    pub protocol_version: u8,
    pub random_token: u16,
}

impl PushAckPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(self.protocol_version);
        buf.put_u16(self.random_token);
        buf.put_u8(PacketType::PushAck as u8);
        buf.to_vec()
    }
}

/// PULL_DATA: gateway → bridge, keep-alive poll that also teaches the
/// bridge the gateway's current source address
#[derive(Debug, PartialEq)]
pub struct PullDataPacket {
    pub protocol_version: u8,
    pub random_token: u16,
    pub gateway_id: GatewayId,
}

impl PullDataPacket {
    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        let (protocol_version, random_token) = parse_prefix(data, PacketType::PullData)?;
        let mut buf = &data[4..];
        let gateway_id = parse_gateway_id(&mut buf)?;
        Ok(PullDataPacket {
            protocol_version,
            random_token,
            gateway_id,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u8(self.protocol_version);
        buf.put_u16(self.random_token);
        buf.put_u8(PacketType::PullData as u8);
        buf.put_slice(self.gateway_id.as_bytes());
        buf.to_vec()
    }
}

/// PULL_ACK: bridge → gateway, acknowledges a PULL_DATA
#[derive(Debug, PartialEq)]
pub struct PullAckPacket {
    pub protocol_version: u8,
    pub random_token: u16,
}

impl PullAckPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(self.protocol_version);
        buf.put_u16(self.random_token);
        buf.put_u8(PacketType::PullAck as u8);
        buf.to_vec()
    }
}

/// Txpk (transmit packet) record inside a PULL_RESP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txpk {
    /// Send immediately, ignoring tmst/tmms
    #[serde(default)]
    pub imme: bool,
    /// Concentrator timestamp at which to send (microseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    /// GPS time at which to send (milliseconds since GPS epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmms: Option<u64>,
    /// Frequency in MHz
    pub freq: f64,
    /// Concentrator RF chain
    #[serde(default)]
    pub rfch: u32,
    /// Transmit power in dBm
    #[serde(default)]
    pub powe: i32,
    /// Modulation (LORA or FSK)
    pub modu: String,
    /// Data-rate identifier
    pub datr: DataRate,
    /// LoRa coding rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    /// FSK frequency deviation in Hz
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fdev: Option<u32>,
    /// LoRa polarization inversion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipol: Option<bool>,
    /// RF packet payload size in bytes
    pub size: u16,
    /// Base64 encoded RF packet payload
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PullRespPayload {
    pub txpk: Txpk,
}

/// PULL_RESP: bridge → gateway, carries one downlink
#[derive(Debug)]
pub struct PullRespPacket {
    pub protocol_version: u8,
    pub random_token: u16,
    pub payload: PullRespPayload,
}

impl PullRespPacket {
    /// Build a PULL_RESP from a downlink frame. The random token is
    /// the low 16 bits of the frame's token so the gateway's TX_ACK
    /// can be correlated back to it.
    pub fn from_downlink_frame(
        protocol_version: u8,
        frame: &gw::DownlinkFrame,
    ) -> anyhow::Result<Self> {
        use base64::Engine;

        let tx_info = frame
            .tx_info
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("downlink frame without tx_info"))?;
        let parameters = tx_info
            .modulation
            .as_ref()
            .and_then(|m| m.parameters.as_ref())
            .ok_or_else(|| anyhow::anyhow!("downlink frame without modulation"))?;

        let (modu, datr, codr, fdev, ipol) = match parameters {
            gw::modulation::Parameters::Lora(lora) => (
                "LORA".to_string(),
                DataRate::Lora {
                    spreading_factor: lora.spreading_factor,
                    bandwidth: lora.bandwidth,
                },
                Some(lora.code_rate.clone()),
                None,
                Some(lora.polarization_inversion),
            ),
            gw::modulation::Parameters::Fsk(fsk) => (
                "FSK".to_string(),
                DataRate::Fsk { bitrate: fsk.datarate },
                None,
                Some(fsk.frequency_deviation),
                None,
            ),
        };

        let (tmst, tmms) = if tx_info.immediately {
            (None, None)
        } else if let Some(gps) = &tx_info.time_since_gps_epoch {
            (
                None,
                Some((gps.seconds as u64) * 1000 + (gps.nanos as u64) / 1_000_000),
            )
        } else {
            (Some(tx_info.timestamp), None)
        };

        Ok(PullRespPacket {
            protocol_version,
            random_token: (frame.token & 0xffff) as u16,
            payload: PullRespPayload {
                txpk: Txpk {
                    imme: tx_info.immediately,
                    tmst,
                    tmms,
                    freq: tx_info.frequency as f64 / 1_000_000.0,
                    rfch: 0,
                    powe: tx_info.power,
                    modu,
                    datr,
                    codr,
                    fdev,
                    ipol,
                    size: frame.phy_payload.len() as u16,
                    data: base64::engine::general_purpose::STANDARD.encode(&frame.phy_payload),
                },
            },
        })
    }

    /// Reconstruct the downlink frame a PULL_RESP was built from.
    pub fn to_downlink_frame(&self, gateway_id: GatewayId) -> anyhow::Result<gw::DownlinkFrame> {
        use base64::Engine;

        let txpk = &self.payload.txpk;
        let phy_payload = base64::engine::general_purpose::STANDARD
            .decode(&txpk.data)
            .map_err(|e| anyhow::anyhow!("Base64 decode error: {}", e))?;

        let parameters = match txpk.datr {
            DataRate::Lora { spreading_factor, bandwidth } => {
                gw::modulation::Parameters::Lora(gw::LoraModulationInfo {
                    bandwidth,
                    spreading_factor,
                    code_rate: txpk.codr.clone().unwrap_or_default(),
                    polarization_inversion: txpk.ipol.unwrap_or(true),
                })
            }
            DataRate::Fsk { bitrate } => gw::modulation::Parameters::Fsk(gw::FskModulationInfo {
                frequency_deviation: txpk.fdev.unwrap_or_default(),
                datarate: bitrate,
            }),
        };

        Ok(gw::DownlinkFrame {
            phy_payload,
            tx_info: Some(gw::DownlinkTxInfo {
                gateway_id: gateway_id.to_vec(),
                immediately: txpk.imme,
                timestamp: txpk.tmst.unwrap_or_default(),
                time_since_gps_epoch: txpk.tmms.map(|ms| common::Duration {
                    seconds: (ms / 1000) as i64,
                    nanos: ((ms % 1000) * 1_000_000) as i32,
                }),
                frequency: (txpk.freq * 1_000_000.0).round() as u32,
                power: txpk.powe,
                modulation: Some(gw::Modulation {
                    parameters: Some(parameters),
                }),
                ..Default::default()
            }),
            token: self.random_token as u32,
        })
    }

    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        let (protocol_version, random_token) = parse_prefix(data, PacketType::PullResp)?;
        let payload: PullRespPayload = serde_json::from_slice(&data[4..])
            .map_err(|e| anyhow::anyhow!("Invalid PULL_RESP JSON: {}", e))?;
        Ok(PullRespPacket {
            protocol_version,
            random_token,
            payload,
        })
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(&self.payload)?;
        let mut buf = BytesMut::with_capacity(4 + json.len());
        buf.put_u8(self.protocol_version);
        buf.put_u16(self.random_token);
        buf.put_u8(PacketType::PullResp as u8);
        buf.put_slice(&json);
        Ok(buf.to_vec())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TxpkAck {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TxAckPayload {
    pub txpk_ack: TxpkAck,
}

/// TX_ACK: gateway → bridge, reports the outcome of a PULL_RESP
#[derive(Debug)]
pub struct TxAckPacket {
    pub protocol_version: u8,
    pub random_token: u16,
    pub gateway_id: GatewayId,
    pub payload: Option<TxAckPayload>,
}

impl TxAckPacket {
    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        let (protocol_version, random_token) = parse_prefix(data, PacketType::TxAck)?;
        let mut buf = &data[4..];
        let gateway_id = parse_gateway_id(&mut buf)?;
        let payload = if buf.has_remaining() {
            Some(
                serde_json::from_slice(buf)
                    .map_err(|e| anyhow::anyhow!("Invalid TX_ACK JSON: {}", e))?,
            )
        } else {
            None
        };
        Ok(TxAckPacket {
            protocol_version,
            random_token,
            gateway_id,
            payload,
        })
    }

    /// Convert to the ack event. An absent body or `"NONE"` both mean
    /// success; anything else is surfaced verbatim.
    pub fn downlink_tx_ack(&self) -> gw::DownlinkTxAck {
        let error = match &self.payload {
            Some(p) if !p.txpk_ack.error.is_empty() && p.txpk_ack.error != "NONE" => {
                p.txpk_ack.error.clone()
            }
            _ => String::new(),
        };
        gw::DownlinkTxAck {
            gateway_id: self.gateway_id.to_vec(),
            token: self.random_token as u32,
            error,
        }
    }
}

/// Parse the expanded stat time format. The trailing zone name is
/// always GMT in practice; anything else is rejected.
fn parse_stat_time(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let trimmed = s.trim_end_matches(" GMT").trim_end_matches(" UTC");
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| anyhow::anyhow!("Invalid stat time '{}': {}", s, e))?;
    Ok(naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GW_ID: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn test_pull_data_round_trip() {
        // version=2, token=0xABCD, type=PULL_DATA, gateway MAC
        let data: Vec<u8> = vec![
            0x02, 0xAB, 0xCD, 0x02, //
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
        ];
        let packet = PullDataPacket::from_bytes(&data).unwrap();
        assert_eq!(packet.protocol_version, 0x02);
        assert_eq!(packet.random_token, 0xABCD);
        assert_eq!(packet.gateway_id, GatewayId::new(GW_ID));
        assert_eq!(packet.to_bytes(), data);
    }

    #[test]
    fn test_pull_ack_bytes() {
        let ack = PullAckPacket {
            protocol_version: 0x02,
            random_token: 0xABCD,
        };
        assert_eq!(ack.to_bytes(), vec![0x02, 0xAB, 0xCD, 0x04]);
    }

    #[test]
    fn test_push_ack_bytes() {
        let ack = PushAckPacket {
            protocol_version: 0x01,
            random_token: 0x1234,
        };
        assert_eq!(ack.to_bytes(), vec![0x01, 0x12, 0x34, 0x01]);
    }

    #[test]
    fn test_protocol_version_1_accepted() {
        let mut data = vec![0x01, 0x00, 0x01, 0x02];
        data.extend_from_slice(&GW_ID);
        let packet = PullDataPacket::from_bytes(&data).unwrap();
        assert_eq!(packet.protocol_version, 0x01);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let data = vec![0x03, 0x00, 0x01, 0x02, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(PullDataPacket::from_bytes(&data).is_err());
        assert!(packet_type(&data).is_err());
    }

    #[test]
    fn test_push_data_uplink() {
        let json = r#"{"rxpk":[{"tmst":1,"freq":868.1,"chan":0,"rfch":0,"stat":1,"modu":"LORA","datr":"SF7BW125","codr":"4/5","rssi":-42,"lsnr":5.5,"size":4,"data":"AQIDBA=="}]}"#;
        let mut data = vec![0x02, 0x12, 0x34, 0x00];
        data.extend_from_slice(&GW_ID);
        data.extend_from_slice(json.as_bytes());

        let packet = PushDataPacket::from_bytes(&data).unwrap();
        assert_eq!(packet.random_token, 0x1234);

        let frames = packet.uplink_frames(false, false).unwrap();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.phy_payload, vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frame.rx_info.as_ref().unwrap().gateway_id, GW_ID.to_vec());
        assert_eq!(frame.rx_info.as_ref().unwrap().rssi, -42);
        assert_eq!(frame.rx_info.as_ref().unwrap().lora_snr, 5.5);
        let tx_info = frame.tx_info.as_ref().unwrap();
        assert_eq!(tx_info.frequency, 868_100_000);
        match tx_info.modulation.as_ref().unwrap().parameters.as_ref().unwrap() {
            gw::modulation::Parameters::Lora(lora) => {
                assert_eq!(lora.spreading_factor, 7);
                assert_eq!(lora.bandwidth, 125);
                assert_eq!(lora.code_rate, "4/5");
            }
            other => panic!("Expected LoRa modulation, got {:?}", other),
        }
    }

    #[test]
    fn test_push_data_invalid_crc_dropped() {
        let json = r#"{"rxpk":[{"tmst":1,"freq":868.1,"stat":-1,"modu":"LORA","datr":"SF7BW125","rssi":-42,"lsnr":5.5,"size":4,"data":"AQIDBA=="}]}"#;
        let mut data = vec![0x02, 0x12, 0x34, 0x00];
        data.extend_from_slice(&GW_ID);
        data.extend_from_slice(json.as_bytes());

        let packet = PushDataPacket::from_bytes(&data).unwrap();
        assert!(packet.uplink_frames(false, false).unwrap().is_empty());
        assert_eq!(packet.uplink_frames(true, false).unwrap().len(), 1);
    }

    #[test]
    fn test_push_data_fake_rx_time() {
        let json = r#"{"rxpk":[{"tmst":1,"freq":868.1,"stat":1,"modu":"LORA","datr":"SF7BW125","rssi":-42,"lsnr":5.5,"size":4,"data":"AQIDBA=="}]}"#;
        let mut data = vec![0x02, 0x12, 0x34, 0x00];
        data.extend_from_slice(&GW_ID);
        data.extend_from_slice(json.as_bytes());

        let packet = PushDataPacket::from_bytes(&data).unwrap();
        let without = packet.uplink_frames(false, false).unwrap();
        assert!(without[0].rx_info.as_ref().unwrap().time.is_none());
        let with = packet.uplink_frames(false, true).unwrap();
        assert!(with[0].rx_info.as_ref().unwrap().time.is_some());
    }

    #[test]
    fn test_push_data_stats() {
        let json = r#"{"stat":{"time":"2014-01-12 08:59:28 GMT","lati":46.24,"long":3.2523,"alti":145,"rxnb":2,"rxok":2,"rxfw":2,"ackr":100.0,"dwnb":2,"txnb":2}}"#;
        let mut data = vec![0x02, 0x00, 0x01, 0x00];
        data.extend_from_slice(&GW_ID);
        data.extend_from_slice(json.as_bytes());

        let packet = PushDataPacket::from_bytes(&data).unwrap();
        let stats = packet.gateway_stats().unwrap().unwrap();
        assert_eq!(stats.gateway_id, GW_ID.to_vec());
        assert_eq!(stats.rx_packets_received, 2);
        assert_eq!(stats.rx_packets_received_ok, 2);
        assert_eq!(stats.tx_packets_received, 2);
        assert_eq!(stats.tx_packets_emitted, 2);
        let location = stats.location.unwrap();
        assert_eq!(location.latitude, 46.24);
        assert_eq!(location.altitude, 145.0);
        let time = stats.time.unwrap().to_datetime().unwrap();
        assert_eq!(time.to_rfc3339(), "2014-01-12T08:59:28+00:00");
    }

    #[test]
    fn test_tx_ack_with_error() {
        let json = r#"{"txpk_ack":{"error":"TOO_LATE"}}"#;
        let mut data = vec![0x02, 0xAA, 0xBB, 0x05];
        data.extend_from_slice(&GW_ID);
        data.extend_from_slice(json.as_bytes());

        let packet = TxAckPacket::from_bytes(&data).unwrap();
        let ack = packet.downlink_tx_ack();
        assert_eq!(ack.token, 0xAABB);
        assert_eq!(ack.error, "TOO_LATE");
    }

    #[test]
    fn test_tx_ack_success_variants() {
        // No JSON body at all.
        let mut data = vec![0x02, 0x00, 0x01, 0x05];
        data.extend_from_slice(&GW_ID);
        let packet = TxAckPacket::from_bytes(&data).unwrap();
        assert_eq!(packet.downlink_tx_ack().error, "");

        // Explicit "NONE".
        let json = r#"{"txpk_ack":{"error":"NONE"}}"#;
        let mut data = vec![0x02, 0x00, 0x01, 0x05];
        data.extend_from_slice(&GW_ID);
        data.extend_from_slice(json.as_bytes());
        let packet = TxAckPacket::from_bytes(&data).unwrap();
        assert_eq!(packet.downlink_tx_ack().error, "");
    }

    fn lora_downlink_frame() -> gw::DownlinkFrame {
        gw::DownlinkFrame {
            phy_payload: vec![0x01, 0x02, 0x03, 0x04],
            tx_info: Some(gw::DownlinkTxInfo {
                gateway_id: GW_ID.to_vec(),
                immediately: false,
                timestamp: 5_000_000,
                time_since_gps_epoch: None,
                frequency: 869_525_000,
                power: 14,
                modulation: Some(gw::Modulation {
                    parameters: Some(gw::modulation::Parameters::Lora(gw::LoraModulationInfo {
                        bandwidth: 125,
                        spreading_factor: 9,
                        code_rate: "4/5".to_string(),
                        polarization_inversion: true,
                    })),
                }),
                ..Default::default()
            }),
            token: 0x0001_AABB,
        }
    }

    #[test]
    fn test_pull_resp_token_is_low_16_bits() {
        let packet = PullRespPacket::from_downlink_frame(0x02, &lora_downlink_frame()).unwrap();
        assert_eq!(packet.random_token, 0xAABB);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0x02, 0xAA, 0xBB, 0x03]);
    }

    #[test]
    fn test_pull_resp_round_trip_lora() {
        for version in [PROTOCOL_VERSION_1, PROTOCOL_VERSION_2] {
            let mut frame = lora_downlink_frame();
            frame.token &= 0xffff; // only the low 16 bits survive the wire
            let packet = PullRespPacket::from_downlink_frame(version, &frame).unwrap();
            let decoded = PullRespPacket::from_bytes(&packet.to_bytes().unwrap()).unwrap();
            assert_eq!(decoded.protocol_version, version);
            let restored = decoded
                .to_downlink_frame(GatewayId::new(GW_ID))
                .unwrap();
            assert_eq!(restored, frame);
        }
    }

    #[test]
    fn test_pull_resp_round_trip_fsk() {
        let frame = gw::DownlinkFrame {
            phy_payload: vec![0xAA, 0xBB],
            tx_info: Some(gw::DownlinkTxInfo {
                gateway_id: GW_ID.to_vec(),
                immediately: true,
                frequency: 868_800_000,
                power: 27,
                modulation: Some(gw::Modulation {
                    parameters: Some(gw::modulation::Parameters::Fsk(gw::FskModulationInfo {
                        frequency_deviation: 25000,
                        datarate: 50000,
                    })),
                }),
                ..Default::default()
            }),
            token: 0x1234,
        };
        let packet = PullRespPacket::from_downlink_frame(0x02, &frame).unwrap();
        assert_eq!(packet.payload.txpk.modu, "FSK");
        assert_eq!(packet.payload.txpk.fdev, Some(25000));
        assert!(packet.payload.txpk.imme);

        let decoded = PullRespPacket::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        let restored = decoded
            .to_downlink_frame(GatewayId::new(GW_ID))
            .unwrap();
        assert_eq!(restored, frame);
    }

    #[test]
    fn test_datr_serde() {
        let lora: DataRate = serde_json::from_str("\"SF12BW500\"").unwrap();
        assert_eq!(lora, DataRate::Lora { spreading_factor: 12, bandwidth: 500 });
        assert_eq!(serde_json::to_string(&lora).unwrap(), "\"SF12BW500\"");

        let fsk: DataRate = serde_json::from_str("50000").unwrap();
        assert_eq!(fsk, DataRate::Fsk { bitrate: 50000 });
        assert_eq!(serde_json::to_string(&fsk).unwrap(), "50000");

        assert!(serde_json::from_str::<DataRate>("\"SFXBW1\"").is_err());
    }
}
