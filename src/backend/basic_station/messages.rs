//! Basic Station JSON messages
//!
//! Reference: https://doc.sm.tc/station/tcproto.html
//!
//! Messages are dispatched on the top-level `msgtype` key. Uplinks
//! arrive pre-parsed (the station splits the PHY payload into MAC
//! fields), so the conversions here reassemble the exact over-the-air
//! bytes before handing the frame to the network server.

use std::fmt;

use bytes::{BufMut, BytesMut};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::band::{Band, DataRate};
use crate::compiled::gw;
use crate::gateway::GatewayId;

/// EUI-64 in the Basic Station's dashed text form
/// (`"01-02-03-04-05-06-07-08"`). Plain or colon-separated hex and
/// JSON numbers are accepted on input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    pub fn gateway_id(&self) -> GatewayId {
        GatewayId::new(self.0)
    }
}

impl From<GatewayId> for Eui64 {
    fn from(id: GatewayId) -> Self {
        Eui64(*id.as_bytes())
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{}", parts.join("-"))
    }
}

impl Serialize for Eui64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Eui64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Eui64(n.to_be_bytes())),
            Raw::Text(s) => {
                let cleaned: String = s.chars().filter(|c| *c != '-' && *c != ':').collect();
                let bytes = hex::decode(&cleaned)
                    .map_err(|_| D::Error::custom(format!("invalid EUI-64: {}", s)))?;
                if bytes.len() != 8 {
                    return Err(D::Error::custom(format!("invalid EUI-64: {}", s)));
                }
                let mut out = [0u8; 8];
                out.copy_from_slice(&bytes);
                Ok(Eui64(out))
            }
        }
    }
}

/// Message discriminator, from the top-level `msgtype` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Version,
    RouterInfo,
    JoinRequest,
    UplinkDataFrame,
    ProprietaryDataFrame,
    DownlinkTransmitted,
    Unknown(String),
}

pub fn message_type(data: &[u8]) -> anyhow::Result<MessageType> {
    #[derive(Deserialize)]
    struct Probe {
        msgtype: String,
    }
    let probe: Probe = serde_json::from_slice(data)
        .map_err(|e| anyhow::anyhow!("message without msgtype: {}", e))?;
    Ok(match probe.msgtype.as_str() {
        "version" => MessageType::Version,
        "router_info" => MessageType::RouterInfo,
        "jreq" => MessageType::JoinRequest,
        "updf" => MessageType::UplinkDataFrame,
        "propdf" => MessageType::ProprietaryDataFrame,
        "dntxed" => MessageType::DownlinkTransmitted,
        other => MessageType::Unknown(other.to_string()),
    })
}

/// `version`: sent by the station right after connecting.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Version {
    pub station: String,
    pub firmware: String,
    pub package: String,
    pub model: String,
    pub protocol: u32,
    pub features: Option<String>,
}

/// `router_info` request on the discovery endpoint.
#[derive(Debug, Deserialize)]
pub struct RouterInfoRequest {
    pub router: Eui64,
}

/// `router_info` reply carrying the data-plane URL.
#[derive(Debug, Serialize)]
pub struct RouterInfoResponse {
    pub router: Eui64,
    pub muxs: Eui64,
    pub uri: String,
}

/// Radio metadata common to all uplink messages.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct UpInfo {
    pub rctx: u64,
    pub xtime: u64,
    pub gpstime: u64,
    pub rssi: f64,
    pub snr: f64,
}

impl UpInfo {
    fn rx_info(&self, gateway_id: GatewayId) -> gw::UplinkRxInfo {
        gw::UplinkRxInfo {
            gateway_id: gateway_id.to_vec(),
            rssi: self.rssi as i32,
            lora_snr: self.snr,
            context: self.rctx.to_be_bytes().to_vec(),
            timestamp: self.xtime as u32,
            ..Default::default()
        }
    }
}

fn tx_info(band: &Band, dr: u8, freq: u32) -> anyhow::Result<gw::UplinkTxInfo> {
    let parameters = match band.data_rate(dr)? {
        DataRate::Lora { spreading_factor, bandwidth } => {
            gw::modulation::Parameters::Lora(gw::LoraModulationInfo {
                bandwidth,
                spreading_factor,
                code_rate: "4/5".to_string(),
                polarization_inversion: false,
            })
        }
        DataRate::Fsk { bitrate } => gw::modulation::Parameters::Fsk(gw::FskModulationInfo {
            frequency_deviation: bitrate / 2,
            datarate: bitrate,
        }),
    };
    Ok(gw::UplinkTxInfo {
        frequency: freq,
        modulation: Some(gw::Modulation {
            parameters: Some(parameters),
        }),
    })
}

fn decode_hex_field(name: &str, value: &str) -> anyhow::Result<Vec<u8>> {
    hex::decode(value).map_err(|e| anyhow::anyhow!("invalid hex in {}: {}", name, e))
}

/// `updf`: LoRaWAN data uplink, split into MAC fields by the station.
#[derive(Debug, Deserialize)]
pub struct UplinkDataFrame {
    #[serde(rename = "MHdr")]
    pub mhdr: u8,
    #[serde(rename = "DevAddr")]
    pub dev_addr: u32,
    #[serde(rename = "FCtrl")]
    pub fctrl: u8,
    #[serde(rename = "FCnt")]
    pub fcnt: u16,
    #[serde(rename = "FOpts", default)]
    pub fopts: String,
    #[serde(rename = "FPort", default = "negative_one")]
    pub fport: i32,
    #[serde(rename = "FRMPayload", default)]
    pub frm_payload: String,
    #[serde(rename = "MIC")]
    pub mic: i32,
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq: u32,
    pub upinfo: UpInfo,
}

fn negative_one() -> i32 {
    -1
}

impl UplinkDataFrame {
    pub fn to_proto(&self, band: &Band, gateway_id: GatewayId) -> anyhow::Result<gw::UplinkFrame> {
        let fopts = decode_hex_field("FOpts", &self.fopts)?;
        let frm_payload = decode_hex_field("FRMPayload", &self.frm_payload)?;

        // MHDR | DevAddr | FCtrl | FCnt | FOpts | [FPort | FRMPayload] | MIC
        let mut phy = BytesMut::new();
        phy.put_u8(self.mhdr);
        phy.put_u32_le(self.dev_addr);
        phy.put_u8(self.fctrl);
        phy.put_u16_le(self.fcnt);
        phy.put_slice(&fopts);
        if self.fport >= 0 {
            phy.put_u8(self.fport as u8);
            phy.put_slice(&frm_payload);
        }
        phy.put_u32_le(self.mic as u32);

        Ok(gw::UplinkFrame {
            phy_payload: phy.to_vec(),
            tx_info: Some(tx_info(band, self.dr, self.freq)?),
            rx_info: Some(self.upinfo.rx_info(gateway_id)),
            carrier: Vec::new(),
        })
    }
}

/// `jreq`: join-request uplink.
#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "MHdr")]
    pub mhdr: u8,
    #[serde(rename = "JoinEui")]
    pub join_eui: Eui64,
    #[serde(rename = "DevEui")]
    pub dev_eui: Eui64,
    #[serde(rename = "DevNonce")]
    pub dev_nonce: u16,
    #[serde(rename = "MIC")]
    pub mic: i32,
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq: u32,
    pub upinfo: UpInfo,
}

impl JoinRequest {
    pub fn to_proto(&self, band: &Band, gateway_id: GatewayId) -> anyhow::Result<gw::UplinkFrame> {
        // MHDR | JoinEUI (LE) | DevEUI (LE) | DevNonce (LE) | MIC
        let mut phy = BytesMut::with_capacity(23);
        phy.put_u8(self.mhdr);
        let mut join_eui = self.join_eui.0;
        join_eui.reverse();
        phy.put_slice(&join_eui);
        let mut dev_eui = self.dev_eui.0;
        dev_eui.reverse();
        phy.put_slice(&dev_eui);
        phy.put_u16_le(self.dev_nonce);
        phy.put_u32_le(self.mic as u32);

        Ok(gw::UplinkFrame {
            phy_payload: phy.to_vec(),
            tx_info: Some(tx_info(band, self.dr, self.freq)?),
            rx_info: Some(self.upinfo.rx_info(gateway_id)),
            carrier: Vec::new(),
        })
    }
}

/// `propdf`: proprietary uplink, raw payload.
#[derive(Debug, Deserialize)]
pub struct UplinkProprietaryFrame {
    #[serde(rename = "FRMPayload")]
    pub frm_payload: String,
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq: u32,
    pub upinfo: UpInfo,
}

impl UplinkProprietaryFrame {
    pub fn to_proto(&self, band: &Band, gateway_id: GatewayId) -> anyhow::Result<gw::UplinkFrame> {
        Ok(gw::UplinkFrame {
            phy_payload: decode_hex_field("FRMPayload", &self.frm_payload)?,
            tx_info: Some(tx_info(band, self.dr, self.freq)?),
            rx_info: Some(self.upinfo.rx_info(gateway_id)),
            carrier: Vec::new(),
        })
    }
}

/// `dntxed`: the station transmitted a queued downlink.
#[derive(Debug, Deserialize)]
pub struct DownlinkTransmitted {
    pub diid: i64,
    #[serde(rename = "DevEui", default)]
    pub dev_eui: Eui64,
    #[serde(default)]
    pub rctx: u64,
    #[serde(default)]
    pub xtime: u64,
}

impl DownlinkTransmitted {
    pub fn to_proto(&self, gateway_id: GatewayId) -> gw::DownlinkTxAck {
        gw::DownlinkTxAck {
            gateway_id: gateway_id.to_vec(),
            token: self.diid as u32,
            error: String::new(),
        }
    }
}

/// `dnmsg`: downlink queued at the station.
#[derive(Debug, Serialize, Deserialize)]
pub struct DownlinkMessage {
    pub msgtype: String,
    #[serde(rename = "DevEui")]
    pub dev_eui: Eui64,
    /// Downlink id, echoed in `dntxed`; carries the frame token.
    pub diid: i64,
    /// Base64 encoded PHY payload.
    pub pdu: String,
    /// Device class: 0 = class A (scheduled), 2 = class C (immediate).
    #[serde(rename = "dC")]
    pub device_class: u8,
    #[serde(rename = "RCtx")]
    pub rctx: u64,
    #[serde(rename = "XTime")]
    pub xtime: u64,
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq: u32,
    pub priority: u8,
}

impl DownlinkMessage {
    pub fn from_proto(band: &Band, frame: &gw::DownlinkFrame) -> anyhow::Result<Self> {
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

        let dr = match parameters {
            gw::modulation::Parameters::Lora(lora) => band.data_rate_index(DataRate::Lora {
                spreading_factor: lora.spreading_factor,
                bandwidth: lora.bandwidth,
            })?,
            gw::modulation::Parameters::Fsk(fsk) => {
                band.data_rate_index(DataRate::Fsk { bitrate: fsk.datarate })?
            }
        };

        let rctx = if tx_info.context.len() == 8 {
            u64::from_be_bytes(tx_info.context.as_slice().try_into().unwrap())
        } else {
            0
        };

        Ok(DownlinkMessage {
            msgtype: "dnmsg".to_string(),
            dev_eui: Eui64::default(),
            diid: frame.token as i64,
            pdu: base64::engine::general_purpose::STANDARD.encode(&frame.phy_payload),
            device_class: if tx_info.immediately { 2 } else { 0 },
            rctx,
            xtime: tx_info.timestamp as u64,
            dr,
            freq: tx_info.frequency,
            priority: 25,
        })
    }
}

/// `router_config`: region parameters pushed to the station.
#[derive(Debug, Serialize, Deserialize)]
pub struct RouterConfig {
    pub msgtype: String,
    #[serde(rename = "NetID")]
    pub net_ids: Vec<u32>,
    #[serde(rename = "JoinEui")]
    pub join_euis: Vec<[u64; 2]>,
    pub region: String,
    pub hwspec: String,
    pub freq_range: [u32; 2],
    #[serde(rename = "DRs")]
    pub drs: Vec<[i32; 3]>,
    pub sx1301_conf: Vec<serde_json::Value>,
    pub nocca: bool,
    pub nodc: bool,
    pub nodwell: bool,
}

impl RouterConfig {
    /// Build from the band plan intersected with the configured
    /// frequency window.
    pub fn from_band(
        band: &Band,
        net_ids: &[u32],
        join_euis: &[[u64; 2]],
        frequency_min: u32,
        frequency_max: u32,
    ) -> anyhow::Result<Self> {
        let channels = band.uplink_channels(frequency_min, frequency_max);
        if channels.is_empty() {
            anyhow::bail!(
                "no {} uplink channels inside [{}, {}]",
                band.region(),
                frequency_min,
                frequency_max
            );
        }
        let frequencies: Vec<u32> = channels.iter().map(|c| c.frequency).collect();

        let mut drs: Vec<[i32; 3]> = band
            .data_rates()
            .iter()
            .map(|dr| match dr {
                Some(DataRate::Lora { spreading_factor, bandwidth }) => {
                    [*spreading_factor as i32, *bandwidth as i32, 0]
                }
                // FSK and unassigned indices are not usable by the station.
                _ => [-1, -1, 0],
            })
            .collect();
        drs.resize(16, [-1, -1, 0]);

        let min = frequencies.iter().min().copied().unwrap_or_default();
        let max = frequencies.iter().max().copied().unwrap_or_default();

        Ok(RouterConfig {
            msgtype: "router_config".to_string(),
            net_ids: net_ids.to_vec(),
            join_euis: join_euis.to_vec(),
            region: band.region().to_string(),
            hwspec: "sx1301/1".to_string(),
            freq_range: [min, max],
            drs,
            sx1301_conf: vec![sx1301_conf(&frequencies)],
            nocca: true,
            nodc: true,
            nodwell: true,
        })
    }

    /// Build from an explicit channel plan pushed by the network
    /// server.
    pub fn from_gateway_configuration(
        band: &Band,
        net_ids: &[u32],
        join_euis: &[[u64; 2]],
        config: &gw::GatewayConfiguration,
    ) -> anyhow::Result<Self> {
        let frequencies: Vec<u32> = config
            .channels
            .iter()
            .filter(|c| {
                matches!(
                    &c.modulation_config,
                    Some(gw::channel_configuration::ModulationConfig::LoraModulationConfig(l))
                        if l.bandwidth == 125
                )
            })
            .map(|c| c.frequency)
            .collect();
        if frequencies.is_empty() {
            anyhow::bail!("gateway configuration has no 125 kHz LoRa channels");
        }

        let mut rc = Self::from_band(band, net_ids, join_euis, 0, 0)?;
        let min = frequencies.iter().min().copied().unwrap_or_default();
        let max = frequencies.iter().max().copied().unwrap_or_default();
        rc.freq_range = [min, max];
        rc.sx1301_conf = vec![sx1301_conf(&frequencies)];
        Ok(rc)
    }
}

/// One SX1301 concentrator block: two radios centered on the channel
/// span, one multi-SF channel slot per frequency.
fn sx1301_conf(frequencies: &[u32]) -> serde_json::Value {
    let mut sorted = frequencies.to_vec();
    sorted.sort_unstable();
    sorted.truncate(8);

    let split = sorted.len().div_ceil(2);
    let (radio_0, radio_1) = sorted.split_at(split);
    let radio_0_freq = (radio_0.first().unwrap_or(&0) + radio_0.last().unwrap_or(&0)) / 2;
    let radio_1_freq = if radio_1.is_empty() {
        radio_0_freq
    } else {
        (radio_1.first().unwrap() + radio_1.last().unwrap()) / 2
    };

    let mut conf = serde_json::Map::new();
    conf.insert(
        "radio_0".to_string(),
        serde_json::json!({"enable": true, "freq": radio_0_freq}),
    );
    conf.insert(
        "radio_1".to_string(),
        serde_json::json!({"enable": true, "freq": radio_1_freq}),
    );
    for i in 0..8usize {
        let entry = if i < radio_0.len() {
            serde_json::json!({
                "enable": true,
                "radio": 0,
                "if": radio_0[i] as i64 - radio_0_freq as i64,
            })
        } else if i < sorted.len() {
            serde_json::json!({
                "enable": true,
                "radio": 1,
                "if": radio_1[i - radio_0.len()] as i64 - radio_1_freq as i64,
            })
        } else {
            serde_json::json!({"enable": false})
        };
        conf.insert(format!("chan_multiSF_{}", i), entry);
    }
    conf.insert(
        "chan_Lora_std".to_string(),
        serde_json::json!({"enable": false}),
    );
    conf.insert("chan_FSK".to_string(), serde_json::json!({"enable": false}));
    serde_json::Value::Object(conf)
}
