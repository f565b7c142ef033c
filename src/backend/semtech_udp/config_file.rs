//! Packet-forwarder configuration rewriting.
//!
//! A `GatewayConfiguration` command turns into an SX1301 concentrator
//! section: channels are assigned to the two radios, the section is
//! structurally merged over the operator's base file (preserving
//! every key the bridge does not manage), and the result is written
//! whole-file before the forwarder process is restarted.

use serde_json::{json, Map, Value};

use crate::compiled::gw;

/// Build the `SX1301_conf` overlay for the given channel plan.
pub fn gateway_config_json(config: &gw::GatewayConfiguration) -> anyhow::Result<Value> {
    let mut multi_sf: Vec<(u32, &gw::LoraModulationConfig)> = Vec::new();
    let mut lora_std: Option<(u32, &gw::LoraModulationConfig)> = None;
    let mut fsk: Option<(u32, &gw::FskModulationConfig)> = None;

    for channel in &config.channels {
        match &channel.modulation_config {
            Some(gw::channel_configuration::ModulationConfig::LoraModulationConfig(lora)) => {
                if lora.bandwidth == 125 && lora.spreading_factors.len() > 1 {
                    multi_sf.push((channel.frequency, lora));
                } else {
                    lora_std = Some((channel.frequency, lora));
                }
            }
            Some(gw::channel_configuration::ModulationConfig::FskModulationConfig(f)) => {
                fsk = Some((channel.frequency, f));
            }
            None => anyhow::bail!(
                "channel at {} Hz has no modulation config",
                channel.frequency
            ),
        }
    }

    if multi_sf.is_empty() {
        anyhow::bail!("channel plan has no multi-SF channels");
    }
    if multi_sf.len() > 8 {
        anyhow::bail!("channel plan has {} multi-SF channels, max 8", multi_sf.len());
    }

    multi_sf.sort_by_key(|(freq, _)| *freq);

    // First half of the sorted channels on radio 0, the rest on
    // radio 1; each radio is centered on its channel span.
    let split = multi_sf.len().div_ceil(2);
    let (radio_0_channels, radio_1_channels) = multi_sf.split_at(split);

    let radio_0_freq = center_frequency(radio_0_channels);
    let radio_1_freq = if radio_1_channels.is_empty() {
        radio_0_freq
    } else {
        center_frequency(radio_1_channels)
    };

    let mut conf = Map::new();
    conf.insert("lorawan_public".to_string(), json!(true));
    conf.insert(
        "radio_0".to_string(),
        json!({"enable": true, "freq": radio_0_freq}),
    );
    conf.insert(
        "radio_1".to_string(),
        json!({"enable": true, "freq": radio_1_freq}),
    );

    for i in 0..8usize {
        let entry = if i < radio_0_channels.len() {
            let (freq, _) = radio_0_channels[i];
            json!({"enable": true, "radio": 0, "if": freq as i64 - radio_0_freq as i64})
        } else if i < multi_sf.len() {
            let (freq, _) = radio_1_channels[i - radio_0_channels.len()];
            json!({"enable": true, "radio": 1, "if": freq as i64 - radio_1_freq as i64})
        } else {
            json!({"enable": false})
        };
        conf.insert(format!("chan_multiSF_{}", i), entry);
    }

    conf.insert(
        "chan_Lora_std".to_string(),
        match lora_std {
            Some((freq, lora)) => {
                let spread_factor = lora.spreading_factors.first().copied().unwrap_or(7);
                json!({
                    "enable": true,
                    "radio": 0,
                    "if": freq as i64 - radio_0_freq as i64,
                    "bandwidth": lora.bandwidth * 1000,
                    "spread_factor": spread_factor,
                })
            }
            None => json!({"enable": false}),
        },
    );

    conf.insert(
        "chan_FSK".to_string(),
        match fsk {
            Some((freq, f)) => json!({
                "enable": true,
                "radio": 1,
                "if": freq as i64 - radio_1_freq as i64,
                "bandwidth": f.bandwidth * 1000,
                "datarate": f.bitrate,
            }),
            None => json!({"enable": false}),
        },
    );

    Ok(json!({ "SX1301_conf": Value::Object(conf) }))
}

fn center_frequency(channels: &[(u32, &gw::LoraModulationConfig)]) -> u32 {
    let min = channels.first().map(|(f, _)| *f).unwrap_or(0);
    let max = channels.last().map(|(f, _)| *f).unwrap_or(0);
    (min + max) / 2
}

/// Structurally merge `overlay` into `base`: objects merge key by
/// key, everything else is replaced. Keys only present in the base
/// file survive untouched.
pub fn merge_into(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, value) => *base_slot = value.clone(),
    }
}
