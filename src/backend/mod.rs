//! Gateway backends.
//!
//! A backend terminates one gateway-side protocol and normalizes it
//! into the shared event model: uplinks, stats, TX acks and
//! reachability notifications flow out on `Events`; downlinks and
//! configuration pushes flow back in through the `Backend` trait.

pub mod basic_station;
pub mod semtech_udp;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::compiled::gw;
use crate::config::Config;
use crate::gateway::GatewayId;

/// Event streams produced by a backend, consumed by the forwarder.
pub struct Events {
    pub uplink_frames: mpsc::Receiver<gw::UplinkFrame>,
    pub gateway_stats: mpsc::Receiver<gw::GatewayStats>,
    pub downlink_tx_acks: mpsc::Receiver<gw::DownlinkTxAck>,
    pub notify_macs: mpsc::Receiver<gw::GatewayStats>,
    pub connects: mpsc::Receiver<GatewayId>,
    pub disconnects: mpsc::Receiver<GatewayId>,
}

/// Commands a backend accepts from the forwarder.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Deliver a downlink frame to its target gateway in the
    /// backend's native wire form. Fails when the gateway is unknown;
    /// the frame is never buffered.
    async fn send_downlink_frame(&self, frame: gw::DownlinkFrame) -> anyhow::Result<()>;

    /// Apply a channel-plan configuration to its target gateway.
    async fn apply_configuration(&self, config: gw::GatewayConfiguration) -> anyhow::Result<()>;

    /// Shut the backend down, flushing gateway-bound packets.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Build the backend selected by the configuration.
pub async fn setup(conf: &Config) -> anyhow::Result<(Arc<dyn Backend>, Events)> {
    match conf.backend.backend_type.as_str() {
        "semtech_udp" => {
            let (backend, events) =
                semtech_udp::SemtechUdpBackend::setup(&conf.backend.semtech_udp).await?;
            Ok((backend as Arc<dyn Backend>, events))
        }
        "basic_station" => {
            let (backend, events) =
                basic_station::BasicStationBackend::setup(&conf.backend.basic_station).await?;
            Ok((backend as Arc<dyn Backend>, events))
        }
        other => anyhow::bail!("unknown backend type: {}", other),
    }
}
