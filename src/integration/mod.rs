//! Network-server integrations.
//!
//! An integration carries the normalized event model to the network
//! server: events are published per gateway, commands come back on
//! the `Commands` streams. MQTT is the only transport.

pub mod mqtt;

use std::sync::Arc;

use async_trait::async_trait;
use prost::Message as _;
use tokio::sync::mpsc;

use crate::compiled::gw;
use crate::config::Config;
use crate::gateway::GatewayId;

/// Per-gateway event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Up,
    Stats,
    Ack,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Up => "up",
            EventType::Stats => "stats",
            EventType::Ack => "ack",
        }
    }
}

/// Out-of-band notify event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyType {
    Mac,
}

impl NotifyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyType::Mac => "mac",
        }
    }
}

/// An event payload; the variant decides the wire encoding.
#[derive(Debug, Clone)]
pub enum EventMessage {
    Up(gw::UplinkFrame),
    Stats(gw::GatewayStats),
    Ack(gw::DownlinkTxAck),
}

impl EventMessage {
    pub fn encode_protobuf(&self) -> Vec<u8> {
        match self {
            EventMessage::Up(m) => m.encode_to_vec(),
            EventMessage::Stats(m) => m.encode_to_vec(),
            EventMessage::Ack(m) => m.encode_to_vec(),
        }
    }

    pub fn encode_json(&self) -> anyhow::Result<Vec<u8>> {
        Ok(match self {
            EventMessage::Up(m) => serde_json::to_vec(m)?,
            EventMessage::Stats(m) => serde_json::to_vec(m)?,
            EventMessage::Ack(m) => serde_json::to_vec(m)?,
        })
    }
}

/// Command streams produced by an integration, consumed by the
/// forwarder.
pub struct Commands {
    pub downlink_frames: mpsc::Receiver<gw::DownlinkFrame>,
    pub gateway_configurations: mpsc::Receiver<gw::GatewayConfiguration>,
}

#[async_trait]
pub trait Integration: Send + Sync {
    /// Create the command subscription for the given gateway.
    async fn subscribe_gateway(&self, gateway_id: GatewayId) -> anyhow::Result<()>;

    /// Remove the command subscription for the given gateway.
    async fn unsubscribe_gateway(&self, gateway_id: GatewayId) -> anyhow::Result<()>;

    /// Publish a per-gateway event.
    async fn publish_event(
        &self,
        gateway_id: GatewayId,
        event: EventType,
        message: &EventMessage,
    ) -> anyhow::Result<()>;

    /// Publish an out-of-band notify event.
    async fn publish_notify_event(
        &self,
        event: NotifyType,
        message: &EventMessage,
    ) -> anyhow::Result<()>;

    /// Close the integration.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Build and connect the configured integration.
pub async fn setup(conf: &Config) -> anyhow::Result<(Arc<dyn Integration>, Commands)> {
    let (integration, commands) = mqtt::MqttIntegration::setup(conf).await?;
    Ok((integration as Arc<dyn Integration>, commands))
}
