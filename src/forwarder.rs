//! Forwarder: wires backend event streams to integration publishes
//! and integration command streams back to the backend.
//!
//! Each stream gets its own receive loop; each received event is
//! published from a short-lived task so one slow broker call never
//! stalls the upstream channel. Lifecycle (connect/disconnect) events
//! are handled inline instead, keeping subscribe/unsubscribe ordered
//! per gateway.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, Instrument as _};

use crate::backend::{Backend, Events};
use crate::compiled::gw;
use crate::config::Config;
use crate::gateway::GatewayId;
use crate::integration::{Commands, EventMessage, EventType, Integration, NotifyType};
use crate::metadata::Metadata;
use crate::trace::SpanContext;

pub struct Forwarder {
    backend: Arc<dyn Backend>,
    integration: Arc<dyn Integration>,
    metadata: Arc<Metadata>,
    always_subscribe: HashSet<GatewayId>,
}

impl Forwarder {
    /// Subscribe the always-subscribed gateways and launch the
    /// forwarding loops.
    pub async fn setup(
        conf: &Config,
        backend: Arc<dyn Backend>,
        integration: Arc<dyn Integration>,
        metadata: Arc<Metadata>,
        events: Events,
        commands: Commands,
    ) -> anyhow::Result<()> {
        let mut always_subscribe = HashSet::new();
        for pf in &conf.backend.semtech_udp.configuration {
            integration.subscribe_gateway(pf.gateway_id).await?;
            always_subscribe.insert(pf.gateway_id);
        }

        let forwarder = Arc::new(Forwarder {
            backend,
            integration,
            metadata,
            always_subscribe,
        });

        tokio::spawn(forwarder.clone().on_connected_loop(events.connects));
        tokio::spawn(forwarder.clone().on_disconnected_loop(events.disconnects));
        tokio::spawn(forwarder.clone().forward_uplink_frame_loop(events.uplink_frames));
        tokio::spawn(forwarder.clone().forward_gateway_stats_loop(events.gateway_stats));
        tokio::spawn(forwarder.clone().forward_notify_mac_loop(events.notify_macs));
        tokio::spawn(forwarder.clone().forward_downlink_tx_ack_loop(events.downlink_tx_acks));
        tokio::spawn(forwarder.clone().forward_downlink_frame_loop(commands.downlink_frames));
        tokio::spawn(forwarder.forward_gateway_configuration_loop(commands.gateway_configurations));

        Ok(())
    }

    async fn on_connected_loop(self: Arc<Self>, mut rx: mpsc::Receiver<GatewayId>) {
        while let Some(gateway_id) = rx.recv().await {
            // Always-subscribed gateways are driven by startup, not
            // by liveness; skip this event and keep processing.
            if self.always_subscribe.contains(&gateway_id) {
                continue;
            }
            if let Err(e) = self.integration.subscribe_gateway(gateway_id).await {
                error!(gateway_id = %gateway_id, error = %e, "forwarder: subscribe gateway error");
            }
        }
    }

    async fn on_disconnected_loop(self: Arc<Self>, mut rx: mpsc::Receiver<GatewayId>) {
        while let Some(gateway_id) = rx.recv().await {
            if self.always_subscribe.contains(&gateway_id) {
                continue;
            }
            if let Err(e) = self.integration.unsubscribe_gateway(gateway_id).await {
                error!(gateway_id = %gateway_id, error = %e, "forwarder: unsubscribe gateway error");
            }
        }
    }

    async fn forward_uplink_frame_loop(self: Arc<Self>, mut rx: mpsc::Receiver<gw::UplinkFrame>) {
        while let Some(frame) = rx.recv().await {
            let forwarder = self.clone();
            tokio::spawn(async move {
                let gateway_id = match frame.rx_info.as_ref().map(|r| &r.gateway_id) {
                    Some(id) => match GatewayId::from_slice(id) {
                        Ok(id) => id,
                        Err(e) => {
                            error!(error = %e, "forwarder: invalid uplink gateway id");
                            return;
                        }
                    },
                    None => {
                        error!("forwarder: uplink frame without rx_info");
                        return;
                    }
                };

                // Continue the trace started at decode time.
                let span = match SpanContext::from_carrier(&frame.carrier) {
                    Ok(parent) => {
                        let child = parent.child();
                        tracing::debug_span!(
                            "forward_uplink_frame",
                            trace_id = %child.trace_id_hex(),
                            span_id = %child.span_id_hex(),
                        )
                    }
                    Err(_) => tracing::debug_span!("forward_uplink_frame"),
                };

                let message = EventMessage::Up(frame);
                let publish =
                    forwarder
                        .integration
                        .publish_event(gateway_id, EventType::Up, &message);
                if let Err(e) = publish.instrument(span).await {
                    error!(
                        gateway_id = %gateway_id,
                        event_type = EventType::Up.as_str(),
                        error = %e,
                        "forwarder: publish event error"
                    );
                }
            });
        }
    }

    async fn forward_gateway_stats_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<gw::GatewayStats>,
    ) {
        while let Some(mut stats) = rx.recv().await {
            let forwarder = self.clone();
            tokio::spawn(async move {
                let gateway_id = match GatewayId::from_slice(&stats.gateway_id) {
                    Ok(id) => id,
                    Err(e) => {
                        error!(error = %e, "forwarder: invalid stats gateway id");
                        return;
                    }
                };

                stats.meta_data = forwarder.metadata.get();

                if let Err(e) = forwarder
                    .integration
                    .publish_event(gateway_id, EventType::Stats, &EventMessage::Stats(stats))
                    .await
                {
                    error!(
                        gateway_id = %gateway_id,
                        event_type = EventType::Stats.as_str(),
                        error = %e,
                        "forwarder: publish event error"
                    );
                }
            });
        }
    }

    async fn forward_notify_mac_loop(self: Arc<Self>, mut rx: mpsc::Receiver<gw::GatewayStats>) {
        while let Some(stats) = rx.recv().await {
            let forwarder = self.clone();
            tokio::spawn(async move {
                if let Err(e) = forwarder
                    .integration
                    .publish_notify_event(NotifyType::Mac, &EventMessage::Stats(stats))
                    .await
                {
                    error!(
                        event_type = NotifyType::Mac.as_str(),
                        error = %e,
                        "forwarder: notify event error"
                    );
                }
            });
        }
    }

    async fn forward_downlink_tx_ack_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<gw::DownlinkTxAck>,
    ) {
        while let Some(ack) = rx.recv().await {
            let forwarder = self.clone();
            tokio::spawn(async move {
                let gateway_id = match GatewayId::from_slice(&ack.gateway_id) {
                    Ok(id) => id,
                    Err(e) => {
                        error!(error = %e, "forwarder: invalid tx ack gateway id");
                        return;
                    }
                };

                if let Err(e) = forwarder
                    .integration
                    .publish_event(gateway_id, EventType::Ack, &EventMessage::Ack(ack))
                    .await
                {
                    error!(
                        gateway_id = %gateway_id,
                        event_type = EventType::Ack.as_str(),
                        error = %e,
                        "forwarder: publish event error"
                    );
                }
            });
        }
    }

    async fn forward_downlink_frame_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<gw::DownlinkFrame>,
    ) {
        while let Some(frame) = rx.recv().await {
            let forwarder = self.clone();
            tokio::spawn(async move {
                if let Err(e) = forwarder.backend.send_downlink_frame(frame).await {
                    error!(error = %e, "forwarder: send downlink frame error");
                }
            });
        }
    }

    async fn forward_gateway_configuration_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<gw::GatewayConfiguration>,
    ) {
        while let Some(config) = rx.recv().await {
            let forwarder = self.clone();
            tokio::spawn(async move {
                if let Err(e) = forwarder.backend.apply_configuration(config).await {
                    error!(error = %e, "forwarder: apply gateway-configuration error");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetadataConfig, PacketForwarderConfig};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum IntegrationCall {
        Subscribe(GatewayId),
        Unsubscribe(GatewayId),
        Publish(GatewayId, &'static str),
        Notify(&'static str),
    }

    struct MockIntegration {
        calls: Mutex<Vec<IntegrationCall>>,
        last_stats: Mutex<Option<gw::GatewayStats>>,
        notify_tx: mpsc::Sender<()>,
    }

    #[async_trait]
    impl Integration for MockIntegration {
        async fn subscribe_gateway(&self, gateway_id: GatewayId) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(IntegrationCall::Subscribe(gateway_id));
            let _ = self.notify_tx.send(()).await;
            Ok(())
        }

        async fn unsubscribe_gateway(&self, gateway_id: GatewayId) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(IntegrationCall::Unsubscribe(gateway_id));
            let _ = self.notify_tx.send(()).await;
            Ok(())
        }

        async fn publish_event(
            &self,
            gateway_id: GatewayId,
            event: EventType,
            message: &EventMessage,
        ) -> anyhow::Result<()> {
            if let EventMessage::Stats(stats) = message {
                *self.last_stats.lock().unwrap() = Some(stats.clone());
            }
            self.calls
                .lock()
                .unwrap()
                .push(IntegrationCall::Publish(gateway_id, event.as_str()));
            let _ = self.notify_tx.send(()).await;
            Ok(())
        }

        async fn publish_notify_event(
            &self,
            event: NotifyType,
            _message: &EventMessage,
        ) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(IntegrationCall::Notify(event.as_str()));
            let _ = self.notify_tx.send(()).await;
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct MockBackend {
        downlinks: Mutex<Vec<gw::DownlinkFrame>>,
        configs: Mutex<Vec<gw::GatewayConfiguration>>,
        notify_tx: mpsc::Sender<()>,
    }

    #[async_trait]
    impl Backend for MockBackend {
        async fn send_downlink_frame(&self, frame: gw::DownlinkFrame) -> anyhow::Result<()> {
            self.downlinks.lock().unwrap().push(frame);
            let _ = self.notify_tx.send(()).await;
            Ok(())
        }

        async fn apply_configuration(
            &self,
            config: gw::GatewayConfiguration,
        ) -> anyhow::Result<()> {
            self.configs.lock().unwrap().push(config);
            let _ = self.notify_tx.send(()).await;
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        integration: Arc<MockIntegration>,
        backend: Arc<MockBackend>,
        calls: mpsc::Receiver<()>,
        connects: mpsc::Sender<GatewayId>,
        disconnects: mpsc::Sender<GatewayId>,
        uplinks: mpsc::Sender<gw::UplinkFrame>,
        stats: mpsc::Sender<gw::GatewayStats>,
        downlink_commands: mpsc::Sender<gw::DownlinkFrame>,
        // Held so the loops for streams the test does not drive stay
        // alive.
        _notify_macs: mpsc::Sender<gw::GatewayStats>,
        _acks: mpsc::Sender<gw::DownlinkTxAck>,
        _configs: mpsc::Sender<gw::GatewayConfiguration>,
    }

    fn id(n: u8) -> GatewayId {
        GatewayId::new([0, 0, 0, 0, 0, 0, 0, n])
    }

    async fn fixture(always_subscribe: Vec<GatewayId>) -> Fixture {
        let (notify_tx, calls) = mpsc::channel(64);
        let integration = Arc::new(MockIntegration {
            calls: Mutex::new(Vec::new()),
            last_stats: Mutex::new(None),
            notify_tx: notify_tx.clone(),
        });
        let backend = Arc::new(MockBackend {
            downlinks: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
            notify_tx,
        });

        let (connect_tx, connect_rx) = mpsc::channel(1);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        let (uplink_tx, uplink_rx) = mpsc::channel(1);
        let (stats_tx, stats_rx) = mpsc::channel(1);
        let (notify_mac_tx, notify_mac_rx) = mpsc::channel(1);
        let (ack_tx, ack_rx) = mpsc::channel(1);
        let (downlink_tx, downlink_rx) = mpsc::channel(1);
        let (config_tx, config_rx) = mpsc::channel(1);

        let mut conf = Config::default();
        for gateway_id in &always_subscribe {
            conf.backend.semtech_udp.configuration.push(PacketForwarderConfig {
                gateway_id: *gateway_id,
                base_file: String::new(),
                output_file: String::new(),
                restart_command: String::new(),
            });
        }

        let metadata = Metadata::setup(&MetadataConfig::default());

        Forwarder::setup(
            &conf,
            backend.clone(),
            integration.clone(),
            metadata,
            Events {
                uplink_frames: uplink_rx,
                gateway_stats: stats_rx,
                downlink_tx_acks: ack_rx,
                notify_macs: notify_mac_rx,
                connects: connect_rx,
                disconnects: disconnect_rx,
            },
            Commands {
                downlink_frames: downlink_rx,
                gateway_configurations: config_rx,
            },
        )
        .await
        .unwrap();

        Fixture {
            integration,
            backend,
            calls,
            connects: connect_tx,
            disconnects: disconnect_tx,
            uplinks: uplink_tx,
            stats: stats_tx,
            downlink_commands: downlink_tx,
            _notify_macs: notify_mac_tx,
            _acks: ack_tx,
            _configs: config_tx,
        }
    }

    async fn wait_call(fixture: &mut Fixture) {
        tokio::time::timeout(Duration::from_secs(2), fixture.calls.recv())
            .await
            .expect("timed out waiting for a call")
            .unwrap();
    }

    #[tokio::test]
    async fn test_always_subscribe_set_subscribed_at_startup() {
        let mut fixture = fixture(vec![id(1)]).await;
        wait_call(&mut fixture).await;
        assert_eq!(
            fixture.integration.calls.lock().unwrap()[0],
            IntegrationCall::Subscribe(id(1))
        );
    }

    #[tokio::test]
    async fn test_connect_skips_always_subscribed_but_keeps_processing() {
        let mut fixture = fixture(vec![id(1)]).await;
        wait_call(&mut fixture).await; // startup subscribe of id(1)

        // A connect for the always-subscribed id is skipped, and the
        // loop keeps running: the next connect still subscribes.
        fixture.connects.send(id(1)).await.unwrap();
        fixture.connects.send(id(2)).await.unwrap();
        wait_call(&mut fixture).await;

        let calls = fixture.integration.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], IntegrationCall::Subscribe(id(2)));
    }

    #[tokio::test]
    async fn test_disconnect_never_unsubscribes_always_subscribed() {
        let mut fixture = fixture(vec![id(1)]).await;
        wait_call(&mut fixture).await;

        fixture.disconnects.send(id(1)).await.unwrap();
        fixture.disconnects.send(id(2)).await.unwrap();
        wait_call(&mut fixture).await;

        let calls = fixture.integration.calls.lock().unwrap();
        assert!(!calls.contains(&IntegrationCall::Unsubscribe(id(1))));
        assert!(calls.contains(&IntegrationCall::Unsubscribe(id(2))));
    }

    #[tokio::test]
    async fn test_uplink_published_as_up_event() {
        let mut fixture = fixture(Vec::new()).await;

        let context = SpanContext::new_root();
        fixture
            .uplinks
            .send(gw::UplinkFrame {
                phy_payload: vec![1, 2, 3],
                rx_info: Some(gw::UplinkRxInfo {
                    gateway_id: id(7).to_vec(),
                    ..Default::default()
                }),
                carrier: context.to_carrier(),
                ..Default::default()
            })
            .await
            .unwrap();
        wait_call(&mut fixture).await;

        assert!(fixture
            .integration
            .calls
            .lock()
            .unwrap()
            .contains(&IntegrationCall::Publish(id(7), "up")));
    }

    #[tokio::test]
    async fn test_stats_carry_metadata_snapshot() {
        let mut fixture = fixture(Vec::new()).await;

        fixture
            .stats
            .send(gw::GatewayStats {
                gateway_id: id(3).to_vec(),
                meta_data: HashMap::new(),
                ..Default::default()
            })
            .await
            .unwrap();
        wait_call(&mut fixture).await;

        assert!(fixture
            .integration
            .calls
            .lock()
            .unwrap()
            .contains(&IntegrationCall::Publish(id(3), "stats")));
        assert!(fixture.integration.last_stats.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_downlink_command_routed_to_backend() {
        let mut fixture = fixture(Vec::new()).await;

        fixture
            .downlink_commands
            .send(gw::DownlinkFrame {
                token: 42,
                ..Default::default()
            })
            .await
            .unwrap();
        wait_call(&mut fixture).await;

        let downlinks = fixture.backend.downlinks.lock().unwrap();
        assert_eq!(downlinks.len(), 1);
        assert_eq!(downlinks[0].token, 42);
    }

    #[tokio::test]
    async fn test_uplink_without_rx_info_dropped() {
        let mut fixture = fixture(Vec::new()).await;

        fixture
            .uplinks
            .send(gw::UplinkFrame::default())
            .await
            .unwrap();
        // The frame is dropped; no publish happens. Feed a valid one
        // afterwards to prove the loop survived.
        fixture
            .uplinks
            .send(gw::UplinkFrame {
                rx_info: Some(gw::UplinkRxInfo {
                    gateway_id: id(9).to_vec(),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        wait_call(&mut fixture).await;

        let calls = fixture.integration.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], IntegrationCall::Publish(id(9), "up"));
    }
}
