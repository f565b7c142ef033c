//! MQTT integration.
//!
//! Publishes events on templated topics and dispatches inbound
//! commands by topic suffix. The connection is owned by a blocking
//! connect loop that retries every two seconds; on every reconnect
//! the known per-gateway subscriptions are restored, so subscription
//! state survives broker restarts.

pub mod auth;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use paho_mqtt as mqtt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::compiled::gw;
use crate::config::Config;
use crate::gateway::GatewayId;

use super::{Commands, EventMessage, EventType, Integration, NotifyType};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Process-global payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marshaler {
    Protobuf,
    Json,
}

pub struct MqttIntegration {
    client: mqtt::AsyncClient,
    auth: Arc<dyn auth::Authentication>,
    qos: i32,
    marshaler: Marshaler,
    event_topic_template: String,
    command_topic_template: String,
    notify_topic_template: String,
    gateways: Mutex<HashSet<GatewayId>>,
    downlink_tx: mpsc::Sender<gw::DownlinkFrame>,
    config_tx: mpsc::Sender<gw::GatewayConfiguration>,
    closed: AtomicBool,
}

impl MqttIntegration {
    /// Build the integration, connect (blocking until the broker
    /// accepts) and start the command and reconnect tasks.
    pub async fn setup(conf: &Config) -> anyhow::Result<(Arc<Self>, Commands)> {
        let (integration, commands, stream) = Self::new(conf)?;

        integration.connect_loop().await;

        let command_consumer = integration.clone();
        tokio::spawn(async move { command_consumer.command_loop(stream).await });

        let reconnector = integration.clone();
        tokio::spawn(async move { reconnector.reconnect_loop().await });

        Ok((integration, commands))
    }

    /// Build without connecting.
    #[allow(clippy::type_complexity)]
    fn new(
        conf: &Config,
    ) -> anyhow::Result<(
        Arc<Self>,
        Commands,
        mqtt::AsyncReceiver<Option<mqtt::Message>>,
    )> {
        let mqtt_conf = &conf.integration.mqtt;

        let auth_impl: Arc<dyn auth::Authentication>;
        let mut event_topic_template = mqtt_conf.event_topic_template.clone();
        let mut command_topic_template = mqtt_conf.command_topic_template.clone();
        let mut notify_topic_template = mqtt_conf.notify_topic_template.clone();

        match mqtt_conf.auth.auth_type.as_str() {
            "generic" => {
                auth_impl = Arc::new(auth::GenericAuthentication::new(&mqtt_conf.auth.generic)?);
            }
            "gcp_cloud_iot_core" => {
                auth_impl = Arc::new(auth::GcpCloudIotCoreAuthentication::new(
                    &mqtt_conf.auth.gcp_cloud_iot_core,
                )?);
                // Cloud IoT Core mandates its own topic layout.
                event_topic_template = "/devices/gw-{gateway_id}/events/{event_type}".to_string();
                notify_topic_template = "/devices/notify/{event_type}".to_string();
                command_topic_template = "/devices/gw-{gateway_id}/commands/#".to_string();
            }
            "azure_iot_hub" => {
                auth_impl = Arc::new(auth::AzureIotHubAuthentication::new(
                    &mqtt_conf.auth.azure_iot_hub,
                )?);
                // IoT Hub mandates its own topic layout.
                event_topic_template =
                    "devices/{gateway_id}/messages/events/{event_type}".to_string();
                notify_topic_template = "/devices/notify/{event_type}".to_string();
                command_topic_template =
                    "devices/{gateway_id}/messages/devicebound/#".to_string();
            }
            other => anyhow::bail!("unknown mqtt auth type: {}", other),
        }

        for template in [
            &event_topic_template,
            &command_topic_template,
            &notify_topic_template,
        ] {
            validate_topic_template(template)?;
        }

        let marshaler = match conf.integration.marshaler.as_str() {
            "protobuf" => Marshaler::Protobuf,
            "json" => Marshaler::Json,
            other => anyhow::bail!("unknown marshaler: {}", other),
        };

        let mut client = mqtt::AsyncClient::new(auth_impl.init()?)
            .map_err(|e| anyhow::anyhow!("create mqtt client: {}", e))?;
        let stream = client.get_stream(25);

        let (downlink_tx, downlink_rx) = mpsc::channel(1);
        let (config_tx, config_rx) = mpsc::channel(1);

        let integration = Arc::new(MqttIntegration {
            client,
            auth: auth_impl,
            qos: conf.integration.mqtt.auth.generic.qos as i32,
            marshaler,
            event_topic_template,
            command_topic_template,
            notify_topic_template,
            gateways: Mutex::new(HashSet::new()),
            downlink_tx,
            config_tx,
            closed: AtomicBool::new(false),
        });

        let commands = Commands {
            downlink_frames: downlink_rx,
            gateway_configurations: config_rx,
        };

        Ok((integration, commands, stream))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let copts = {
            let mut opts = mqtt::ConnectOptionsBuilder::new();
            opts.keep_alive_interval(Duration::from_secs(30));
            self.auth
                .update(&mut opts)
                .context("update authentication")?;
            opts.finalize()
        };
        self.client
            .connect(copts)
            .await
            .map_err(|e| anyhow::anyhow!("connect: {}", e))?;
        Ok(())
    }

    /// Block until a broker connection succeeds, then restore every
    /// known per-gateway subscription.
    async fn connect_loop(&self) {
        loop {
            match self.connect().await {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, "mqtt: connection error");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
        info!("mqtt: connected to mqtt broker");
        self.on_connected().await;
    }

    async fn on_connected(&self) {
        let gateways: Vec<GatewayId> = self.gateways.lock().unwrap().iter().copied().collect();
        for gateway_id in gateways {
            loop {
                match self.subscribe(gateway_id).await {
                    Ok(()) => break,
                    Err(e) => {
                        error!(gateway_id = %gateway_id, error = %e, "mqtt: subscribe gateway error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    /// Consume the broker stream; a `None` entry means the connection
    /// was lost, anything else is an inbound command.
    async fn command_loop(
        &self,
        stream: mqtt::AsyncReceiver<Option<mqtt::Message>>,
    ) {
        while let Ok(entry) = stream.recv().await {
            match entry {
                Some(message) => self.handle_command(message).await,
                None => {
                    if self.is_closed() {
                        return;
                    }
                    error!("mqtt: connection lost");
                    self.connect_loop().await;
                }
            }
        }
    }

    /// Force a periodic reconnect when the provider's credentials
    /// expire, so they are refreshed proactively.
    async fn reconnect_loop(&self) {
        let Some(interval) = self.auth.reconnect_after() else {
            return;
        };
        loop {
            tokio::time::sleep(interval).await;
            if self.is_closed() {
                return;
            }
            info!("mqtt: re-connect triggered");
            let _ = self.client.disconnect(None).await;
            self.connect_loop().await;
        }
    }

    async fn subscribe(&self, gateway_id: GatewayId) -> anyhow::Result<()> {
        let topic = render_topic(&self.command_topic_template, Some(gateway_id), "");
        info!(topic = %topic, qos = self.qos, "mqtt: subscribing to topic");
        self.client
            .subscribe(topic, self.qos)
            .await
            .map_err(|e| anyhow::anyhow!("subscribe topic: {}", e))?;
        Ok(())
    }

    async fn handle_command(&self, message: mqtt::Message) {
        let topic = message.topic().to_string();
        if topic.ends_with("down") || topic.contains("command=down") {
            self.handle_downlink_frame(&topic, message.payload()).await;
        } else if topic.ends_with("config") || topic.contains("command=config") {
            self.handle_gateway_configuration(&topic, message.payload())
                .await;
        } else {
            warn!(topic = %topic, "mqtt: unexpected command received");
        }
    }

    async fn handle_downlink_frame(&self, topic: &str, payload: &[u8]) {
        info!(topic = %topic, "mqtt: downlink frame received");
        let frame: gw::DownlinkFrame = match self.unmarshal(payload) {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "mqtt: unmarshal downlink frame error");
                return;
            }
        };
        let _ = self.downlink_tx.send(frame).await;
    }

    async fn handle_gateway_configuration(&self, topic: &str, payload: &[u8]) {
        info!(topic = %topic, "mqtt: gateway configuration received");
        let config: gw::GatewayConfiguration = match self.unmarshal(payload) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "mqtt: unmarshal gateway configuration error");
                return;
            }
        };
        let _ = self.config_tx.send(config).await;
    }

    fn marshal(&self, message: &EventMessage) -> anyhow::Result<Vec<u8>> {
        match self.marshaler {
            Marshaler::Protobuf => Ok(message.encode_protobuf()),
            Marshaler::Json => message.encode_json(),
        }
    }

    fn unmarshal<T>(&self, payload: &[u8]) -> anyhow::Result<T>
    where
        T: prost::Message + serde::de::DeserializeOwned + Default,
    {
        match self.marshaler {
            Marshaler::Protobuf => Ok(T::decode(payload)?),
            Marshaler::Json => Ok(serde_json::from_slice(payload)?),
        }
    }

    async fn publish(&self, topic: String, message: &EventMessage) -> anyhow::Result<()> {
        let payload = self.marshal(message)?;
        self.client
            .publish(mqtt::Message::new(topic, payload, self.qos))
            .await
            .map_err(|e| anyhow::anyhow!("publish: {}", e))?;
        Ok(())
    }
}

#[async_trait]
impl Integration for MqttIntegration {
    async fn subscribe_gateway(&self, gateway_id: GatewayId) -> anyhow::Result<()> {
        self.subscribe(gateway_id).await?;
        self.gateways.lock().unwrap().insert(gateway_id);
        Ok(())
    }

    async fn unsubscribe_gateway(&self, gateway_id: GatewayId) -> anyhow::Result<()> {
        let topic = render_topic(&self.command_topic_template, Some(gateway_id), "");
        info!(topic = %topic, "mqtt: unsubscribe topic");
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| anyhow::anyhow!("unsubscribe topic: {}", e))?;
        self.gateways.lock().unwrap().remove(&gateway_id);
        Ok(())
    }

    async fn publish_event(
        &self,
        gateway_id: GatewayId,
        event: EventType,
        message: &EventMessage,
    ) -> anyhow::Result<()> {
        let topic = render_topic(
            &self.event_topic_template,
            Some(gateway_id),
            event.as_str(),
        );
        info!(topic = %topic, qos = self.qos, event = event.as_str(), "mqtt: publishing event");
        self.publish(topic, message).await
    }

    async fn publish_notify_event(
        &self,
        event: NotifyType,
        message: &EventMessage,
    ) -> anyhow::Result<()> {
        let topic = render_topic(&self.notify_topic_template, None, event.as_str());
        info!(topic = %topic, qos = self.qos, event = event.as_str(), "mqtt: publishing notify event");
        self.publish(topic, message).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.client.is_connected() {
            let _ = self.client.disconnect(None).await;
        }
        Ok(())
    }
}

/// Substitute `{gateway_id}` and `{event_type}` into a topic
/// template.
fn render_topic(template: &str, gateway_id: Option<GatewayId>, event_type: &str) -> String {
    let mut topic = template.replace("{event_type}", event_type);
    if let Some(id) = gateway_id {
        topic = topic.replace("{gateway_id}", &id.to_string());
    }
    topic
}

/// Reject templates referencing unknown placeholders; a typo here
/// must abort startup, not surface as malformed topics later.
fn validate_topic_template(template: &str) -> anyhow::Result<()> {
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let tail = &rest[start..];
        let end = tail
            .find('}')
            .ok_or_else(|| anyhow::anyhow!("unclosed placeholder in template: {}", template))?;
        let placeholder = &tail[1..end];
        if placeholder != "gateway_id" && placeholder != "event_type" {
            anyhow::bail!(
                "unknown placeholder '{{{}}}' in template: {}",
                placeholder,
                template
            );
        }
        rest = &tail[end + 1..];
    }
    Ok(())
}
