//! Regional band plans.
//!
//! The slice of the LoRaWAN regional parameters the bridge needs:
//! data-rate tables (to map Basic Station `DR` indices to SF/BW and
//! back) and the uplink channel plan (to build `router_config`
//! messages and packet-forwarder channel sections). Frequencies in
//! Hz, bandwidths in kHz, as everywhere else in the crate.

use std::fmt;
use std::str::FromStr;

/// Supported regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Eu868,
    Us915,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Eu868 => write!(f, "EU868"),
            Region::Us915 => write!(f, "US915"),
        }
    }
}

impl FromStr for Region {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EU868" => Ok(Region::Eu868),
            "US915" => Ok(Region::Us915),
            _ => Err(anyhow::anyhow!("unsupported region: {}", s)),
        }
    }
}

/// One entry of a region's data-rate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRate {
    Lora { spreading_factor: u32, bandwidth: u32 },
    Fsk { bitrate: u32 },
}

/// An uplink channel with the data-rate range it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub frequency: u32,
    pub min_dr: u8,
    pub max_dr: u8,
}

/// The band-plan slice for one region.
pub struct Band {
    region: Region,
    data_rates: Vec<Option<DataRate>>,
    uplink_channels: Vec<Channel>,
}

impl Band {
    pub fn config(region: Region) -> Band {
        match region {
            Region::Eu868 => Band {
                region,
                data_rates: vec![
                    Some(DataRate::Lora { spreading_factor: 12, bandwidth: 125 }),
                    Some(DataRate::Lora { spreading_factor: 11, bandwidth: 125 }),
                    Some(DataRate::Lora { spreading_factor: 10, bandwidth: 125 }),
                    Some(DataRate::Lora { spreading_factor: 9, bandwidth: 125 }),
                    Some(DataRate::Lora { spreading_factor: 8, bandwidth: 125 }),
                    Some(DataRate::Lora { spreading_factor: 7, bandwidth: 125 }),
                    Some(DataRate::Lora { spreading_factor: 7, bandwidth: 250 }),
                    Some(DataRate::Fsk { bitrate: 50000 }),
                ],
                uplink_channels: vec![
                    Channel { frequency: 868_100_000, min_dr: 0, max_dr: 5 },
                    Channel { frequency: 868_300_000, min_dr: 0, max_dr: 5 },
                    Channel { frequency: 868_500_000, min_dr: 0, max_dr: 5 },
                ],
            },
            Region::Us915 => {
                let mut uplink_channels = Vec::with_capacity(72);
                for i in 0..64u32 {
                    uplink_channels.push(Channel {
                        frequency: 902_300_000 + i * 200_000,
                        min_dr: 0,
                        max_dr: 3,
                    });
                }
                for i in 0..8u32 {
                    uplink_channels.push(Channel {
                        frequency: 903_000_000 + i * 1_600_000,
                        min_dr: 4,
                        max_dr: 4,
                    });
                }
                Band {
                    region,
                    data_rates: vec![
                        Some(DataRate::Lora { spreading_factor: 10, bandwidth: 125 }),
                        Some(DataRate::Lora { spreading_factor: 9, bandwidth: 125 }),
                        Some(DataRate::Lora { spreading_factor: 8, bandwidth: 125 }),
                        Some(DataRate::Lora { spreading_factor: 7, bandwidth: 125 }),
                        Some(DataRate::Lora { spreading_factor: 8, bandwidth: 500 }),
                    ],
                    uplink_channels,
                }
            }
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// Resolve a data-rate index to its parameters.
    pub fn data_rate(&self, index: u8) -> anyhow::Result<DataRate> {
        self.data_rates
            .get(index as usize)
            .copied()
            .flatten()
            .ok_or_else(|| anyhow::anyhow!("invalid data-rate index {} for {}", index, self.region))
    }

    /// Resolve data-rate parameters back to their index.
    pub fn data_rate_index(&self, dr: DataRate) -> anyhow::Result<u8> {
        self.data_rates
            .iter()
            .position(|d| *d == Some(dr))
            .map(|i| i as u8)
            .ok_or_else(|| anyhow::anyhow!("data-rate {:?} not in {} table", dr, self.region))
    }

    /// The full data-rate table, `None` for unassigned indices.
    pub fn data_rates(&self) -> &[Option<DataRate>] {
        &self.data_rates
    }

    /// Uplink channels with frequencies inside `[min, max]`; a zero
    /// bound means unbounded on that side.
    pub fn uplink_channels(&self, min: u32, max: u32) -> Vec<Channel> {
        self.uplink_channels
            .iter()
            .filter(|c| (min == 0 || c.frequency >= min) && (max == 0 || c.frequency <= max))
            .copied()
            .collect()
    }
}
