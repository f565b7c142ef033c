//! Semtech packet-forwarder (UDP) gateway backend.
//!
//! Connectionless: gateways are known only by the source address of
//! their most recent PULL_DATA, tracked in the registry and evicted
//! after 30 s of silence. One reader task turns datagrams into
//! per-packet handler tasks; one writer task owns all outgoing
//! datagrams; one sweeper task runs the registry eviction loop.

pub mod config_file;
pub mod packets;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument as _};

use crate::compiled::gw;
use crate::config::SemtechUdpConfig;
use crate::gateway::GatewayId;
use crate::registry::{GatewayDoesNotExist, Registry};
use crate::trace::SpanContext;

use super::{Backend, Events};

/// Max UDP payload size (65535 - 8 byte UDP header - 20 byte IP header).
const MAX_PACKET_SIZE: usize = 65507;
/// A gateway with no traffic for this long is evicted.
const GATEWAY_STALE_TIMEOUT: Duration = Duration::from_secs(30);
/// How often the sweeper scans the registry.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct GatewayEntry {
    addr: SocketAddr,
    last_seen: DateTime<Utc>,
    protocol_version: u8,
}

struct UdpPacket {
    addr: SocketAddr,
    data: Vec<u8>,
}

struct PfConfiguration {
    gateway_id: GatewayId,
    base_file: String,
    output_file: String,
    restart_command: String,
    current_version: String,
}

pub struct SemtechUdpBackend {
    socket: Arc<UdpSocket>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    gateways: Arc<Registry<GatewayEntry>>,
    udp_send_tx: mpsc::Sender<UdpPacket>,
    uplink_tx: mpsc::Sender<gw::UplinkFrame>,
    stats_tx: mpsc::Sender<gw::GatewayStats>,
    ack_tx: mpsc::Sender<gw::DownlinkTxAck>,
    notify_tx: mpsc::Sender<gw::GatewayStats>,
    configurations: Mutex<Vec<PfConfiguration>>,
    skip_crc_check: bool,
    fake_rx_time: bool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SemtechUdpBackend {
    /// Bind the socket and start the reader, writer and sweeper
    /// tasks. A bind failure is fatal for process startup.
    pub async fn setup(conf: &SemtechUdpConfig) -> anyhow::Result<(Arc<Self>, Events)> {
        let socket = UdpSocket::bind(&conf.udp_bind)
            .await
            .with_context(|| format!("bind udp listener on {}", conf.udp_bind))?;
        info!(addr = %conf.udp_bind, "udp: starting gateway udp listener");

        let (registry, connects, disconnects) = Registry::new();
        let (udp_send_tx, udp_send_rx) = mpsc::channel::<UdpPacket>(1);
        let (uplink_tx, uplink_rx) = mpsc::channel(1);
        let (stats_tx, stats_rx) = mpsc::channel(1);
        let (ack_tx, ack_rx) = mpsc::channel(1);
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);

        let configurations = conf
            .configuration
            .iter()
            .map(|c| PfConfiguration {
                gateway_id: c.gateway_id,
                base_file: c.base_file.clone(),
                output_file: c.output_file.clone(),
                restart_command: c.restart_command.clone(),
                current_version: String::new(),
            })
            .collect();

        let backend = Arc::new(SemtechUdpBackend {
            socket: Arc::new(socket),
            closed: AtomicBool::new(false),
            shutdown,
            gateways: Arc::new(registry),
            udp_send_tx,
            uplink_tx,
            stats_tx,
            ack_tx,
            notify_tx,
            configurations: Mutex::new(configurations),
            skip_crc_check: conf.skip_crc_check,
            fake_rx_time: conf.fake_rx_time,
            tasks: Mutex::new(Vec::new()),
        });

        let reader = tokio::spawn(backend.clone().read_packets());
        let writer = tokio::spawn(send_packets(
            backend.socket.clone(),
            udp_send_rx,
            backend.shutdown.subscribe(),
        ));
        let sweeper = tokio::spawn(cleanup_loop(
            backend.gateways.clone(),
            backend.shutdown.subscribe(),
        ));
        backend.tasks.lock().unwrap().extend([reader, writer, sweeper]);

        let events = Events {
            uplink_frames: uplink_rx,
            gateway_stats: stats_rx,
            downlink_tx_acks: ack_rx,
            notify_macs: notify_rx,
            connects,
            disconnects,
        };

        Ok((backend, events))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn read_packets(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let (len, addr) = tokio::select! {
                _ = shutdown.changed() => return,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(r) => r,
                    Err(e) => {
                        if self.is_closed() {
                            return;
                        }
                        error!(error = %e, "udp: read from udp error");
                        continue;
                    }
                },
            };

            let data = buf[..len].to_vec();
            let backend = self.clone();
            // Handle each packet in its own task so a slow consumer
            // does not block the socket read.
            tokio::spawn(async move {
                if let Err(e) = backend.handle_packet(addr, &data).await {
                    use base64::Engine as _;
                    let data_base64 = base64::engine::general_purpose::STANDARD.encode(&data);
                    warn!(
                        addr = %addr,
                        data_base64 = %data_base64,
                        error = %e,
                        "udp: could not handle packet"
                    );
                }
            });
        }
    }

    async fn handle_packet(&self, addr: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let packet_type = packets::packet_type(data)?;
        debug!(
            addr = %addr,
            packet_type = ?packet_type,
            protocol_version = data[0],
            "udp: received udp packet from gateway"
        );

        match packet_type {
            packets::PacketType::PushData => self.handle_push_data(addr, data).await,
            packets::PacketType::PullData => self.handle_pull_data(addr, data).await,
            packets::PacketType::TxAck => self.handle_tx_ack(data).await,
            other => anyhow::bail!("unexpected packet type: {:?}", other),
        }
    }

    async fn handle_pull_data(&self, addr: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        let packet = packets::PullDataPacket::from_bytes(data)?;
        let ack = packets::PullAckPacket {
            protocol_version: packet.protocol_version,
            random_token: packet.random_token,
        };

        self.gateways
            .set(
                packet.gateway_id,
                GatewayEntry {
                    addr,
                    last_seen: Utc::now(),
                    protocol_version: packet.protocol_version,
                },
            )
            .await;

        self.udp_send_tx
            .send(UdpPacket { addr, data: ack.to_bytes() })
            .await
            .context("enqueue pull ack")?;

        // Announce the gateway's reachability out-of-band.
        let _ = self
            .notify_tx
            .send(gw::GatewayStats {
                gateway_id: packet.gateway_id.to_vec(),
                ..Default::default()
            })
            .await;

        Ok(())
    }

    async fn handle_push_data(&self, addr: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        let packet = packets::PushDataPacket::from_bytes(data)?;

        // Ack before any event is emitted.
        let ack = packets::PushAckPacket {
            protocol_version: packet.protocol_version,
            random_token: packet.random_token,
        };
        self.udp_send_tx
            .send(UdpPacket { addr, data: ack.to_bytes() })
            .await
            .context("enqueue push ack")?;

        self.gateways
            .update(packet.gateway_id, |entry| entry.last_seen = Utc::now());

        if let Some(mut stats) = packet.gateway_stats()? {
            stats.ip = source_ip(addr).await;
            stats.config_version = self.config_version(packet.gateway_id);
            let _ = self.stats_tx.send(stats).await;
        }

        let frames = packet.uplink_frames(self.skip_crc_check, self.fake_rx_time)?;
        if !frames.is_empty() {
            // One root context per decode; its serialized form rides
            // on every frame of the packet.
            let span_context = SpanContext::new_root();
            let carrier = span_context.to_carrier();
            let span = tracing::debug_span!(
                "handle_push_data",
                trace_id = %span_context.trace_id_hex(),
                span_id = %span_context.span_id_hex(),
                gateway_id = %packet.gateway_id,
            );

            async {
                for mut frame in frames {
                    frame.carrier = carrier.clone();
                    let _ = self.uplink_tx.send(frame).await;
                }
            }
            .instrument(span)
            .await;
        }

        Ok(())
    }

    async fn handle_tx_ack(&self, data: &[u8]) -> anyhow::Result<()> {
        let packet = packets::TxAckPacket::from_bytes(data)?;
        self.gateways
            .update(packet.gateway_id, |entry| entry.last_seen = Utc::now());
        let _ = self.ack_tx.send(packet.downlink_tx_ack()).await;
        Ok(())
    }

    fn config_version(&self, gateway_id: GatewayId) -> String {
        self.configurations
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.gateway_id == gateway_id)
            .map(|c| c.current_version.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Backend for SemtechUdpBackend {
    /// Encode the frame as a PULL_RESP and enqueue it for the
    /// gateway's last known address.
    async fn send_downlink_frame(&self, frame: gw::DownlinkFrame) -> anyhow::Result<()> {
        let gateway_id = GatewayId::from_slice(
            &frame
                .tx_info
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("downlink frame without tx_info"))?
                .gateway_id,
        )?;

        let gateway = self.gateways.get(gateway_id).map_err(anyhow::Error::from)?;

        let pull_resp =
            packets::PullRespPacket::from_downlink_frame(gateway.protocol_version, &frame)?;
        let data = pull_resp.to_bytes()?;

        self.udp_send_tx
            .send(UdpPacket { addr: gateway.addr, data })
            .await
            .context("enqueue pull resp")?;
        Ok(())
    }

    /// Rewrite the packet-forwarder configuration file for the target
    /// gateway and restart the forwarder process.
    async fn apply_configuration(&self, config: gw::GatewayConfiguration) -> anyhow::Result<()> {
        let gateway_id = GatewayId::from_slice(&config.gateway_id)?;

        let (base_file, output_file, restart_command) = {
            let configurations = self.configurations.lock().unwrap();
            let pf = configurations
                .iter()
                .find(|c| c.gateway_id == gateway_id)
                .ok_or(GatewayDoesNotExist)?;
            (
                pf.base_file.clone(),
                pf.output_file.clone(),
                pf.restart_command.clone(),
            )
        };

        let overlay = config_file::gateway_config_json(&config)?;

        let base_content = tokio::fs::read_to_string(&base_file)
            .await
            .with_context(|| format!("read base config file {}", base_file))?;
        let mut base: serde_json::Value =
            serde_json::from_str(&base_content).context("parse base config file")?;
        if !base.is_object() {
            anyhow::bail!("base config file {} is not a JSON object", base_file);
        }

        config_file::merge_into(&mut base, &overlay);

        let merged = serde_json::to_vec_pretty(&base)?;
        tokio::fs::write(&output_file, merged)
            .await
            .with_context(|| format!("write config file {}", output_file))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&output_file, std::fs::Permissions::from_mode(0o644))
                .context("set config file permissions")?;
        }
        info!(gateway_id = %gateway_id, file = %output_file, "udp: new configuration file written");

        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&restart_command)
            .status()
            .await
            .context("invoke packet-forwarder restart command")?;
        if !status.success() {
            anyhow::bail!("restart command exited with {}", status);
        }
        info!(gateway_id = %gateway_id, cmd = %restart_command, "udp: packet-forwarder restart command invoked");

        let mut configurations = self.configurations.lock().unwrap();
        if let Some(pf) = configurations
            .iter_mut()
            .find(|c| c.gateway_id == gateway_id)
        {
            pf.current_version = config.version.clone();
        }

        Ok(())
    }

    /// Stop the I/O tasks; queued outgoing packets are flushed first.
    async fn close(&self) -> anyhow::Result<()> {
        info!("udp: closing gateway backend");
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

async fn send_packets(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<UdpPacket>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            _ = shutdown.changed() => break,
            p = rx.recv() => match p {
                Some(p) => p,
                None => return,
            },
        };
        write_packet(&socket, &packet).await;
    }

    // Handle last packets before shutting down.
    while let Ok(packet) = rx.try_recv() {
        write_packet(&socket, &packet).await;
    }
}

async fn write_packet(socket: &UdpSocket, packet: &UdpPacket) {
    match packets::packet_type(&packet.data) {
        Ok(packet_type) => {
            debug!(
                addr = %packet.addr,
                packet_type = ?packet_type,
                protocol_version = packet.data[0],
                "udp: sending udp packet to gateway"
            );
        }
        Err(e) => {
            error!(addr = %packet.addr, error = %e, "udp: get packet-type error");
            return;
        }
    }
    if let Err(e) = socket.send_to(&packet.data, packet.addr).await {
        error!(addr = %packet.addr, error = %e, "udp: write to udp error");
    }
}

async fn cleanup_loop(registry: Arc<Registry<GatewayEntry>>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        debug!("udp: cleanup gateway registry");
        let stale_after = chrono::Duration::from_std(GATEWAY_STALE_TIMEOUT).unwrap();
        let now = Utc::now();
        registry.cleanup(|e| now - e.last_seen > stale_after).await;
    }
}

/// The IP to report in stats events. Loopback sources are replaced
/// by the host's outbound address so hosted setups see a routable IP;
/// the dial sends no packet, it only selects a local endpoint.
async fn source_ip(addr: SocketAddr) -> String {
    if !addr.ip().is_loopback() {
        return addr.ip().to_string();
    }
    match outbound_ip().await {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            error!(error = %e, "udp: get outbound ip error");
            addr.ip().to_string()
        }
    }
}

async fn outbound_ip() -> anyhow::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PacketForwarderConfig;

    const GW_ID: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    async fn test_backend() -> (Arc<SemtechUdpBackend>, Events, UdpSocket) {
        let conf = SemtechUdpConfig {
            udp_bind: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let (backend, events) = SemtechUdpBackend::setup(&conf).await.unwrap();
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        gateway
            .connect(backend.socket.local_addr().unwrap())
            .await
            .unwrap();
        (backend, events, gateway)
    }

    #[tokio::test]
    async fn test_pull_data_acked_and_registered() {
        let (backend, mut events, gateway) = test_backend().await;

        let mut pull_data = vec![0x02, 0xAB, 0xCD, 0x02];
        pull_data.extend_from_slice(&GW_ID);
        gateway.send(&pull_data).await.unwrap();

        let mut buf = [0u8; 64];
        let len = tokio::time::timeout(Duration::from_secs(2), gateway.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[0x02, 0xAB, 0xCD, 0x04]);

        let connected = tokio::time::timeout(Duration::from_secs(2), events.connects.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connected, GatewayId::new(GW_ID));

        let notify = tokio::time::timeout(Duration::from_secs(2), events.notify_macs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notify.gateway_id, GW_ID.to_vec());

        assert_eq!(backend.gateways.len(), 1);
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_push_data_acked_and_uplink_emitted() {
        let (backend, mut events, gateway) = test_backend().await;

        let json = r#"{"rxpk":[{"tmst":1,"freq":868.1,"chan":0,"rfch":0,"stat":1,"modu":"LORA","datr":"SF7BW125","codr":"4/5","rssi":-42,"lsnr":5.5,"size":4,"data":"AQIDBA=="}]}"#;
        let mut push_data = vec![0x02, 0x12, 0x34, 0x00];
        push_data.extend_from_slice(&GW_ID);
        push_data.extend_from_slice(json.as_bytes());
        gateway.send(&push_data).await.unwrap();

        let mut buf = [0u8; 64];
        let len = tokio::time::timeout(Duration::from_secs(2), gateway.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[0x02, 0x12, 0x34, 0x01]);

        let frame = tokio::time::timeout(Duration::from_secs(2), events.uplink_frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.phy_payload, vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frame.rx_info.as_ref().unwrap().gateway_id, GW_ID.to_vec());
        assert_eq!(frame.tx_info.as_ref().unwrap().frequency, 868_100_000);
        // The span context travels on the frame.
        assert!(SpanContext::from_carrier(&frame.carrier).is_ok());

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tx_ack_emitted() {
        let (backend, mut events, gateway) = test_backend().await;

        let json = r#"{"txpk_ack":{"error":"TOO_LATE"}}"#;
        let mut tx_ack = vec![0x02, 0xAA, 0xBB, 0x05];
        tx_ack.extend_from_slice(&GW_ID);
        tx_ack.extend_from_slice(json.as_bytes());
        gateway.send(&tx_ack).await.unwrap();

        let ack = tokio::time::timeout(Duration::from_secs(2), events.downlink_tx_acks.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.token, 0xAABB);
        assert_eq!(ack.error, "TOO_LATE");

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_downlink_to_unknown_gateway_fails() {
        let (backend, _events, _gateway) = test_backend().await;

        let frame = gw::DownlinkFrame {
            phy_payload: vec![1, 2, 3],
            tx_info: Some(gw::DownlinkTxInfo {
                gateway_id: vec![0xff; 8],
                immediately: true,
                frequency: 868_100_000,
                modulation: Some(gw::Modulation {
                    parameters: Some(gw::modulation::Parameters::Lora(
                        gw::LoraModulationInfo {
                            bandwidth: 125,
                            spreading_factor: 7,
                            code_rate: "4/5".to_string(),
                            polarization_inversion: true,
                        },
                    )),
                }),
                ..Default::default()
            }),
            token: 1,
        };

        let err = backend.send_downlink_frame(frame).await.unwrap_err();
        assert!(err.downcast_ref::<GatewayDoesNotExist>().is_some());

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_downlink_sent_to_registered_gateway() {
        let (backend, mut events, gateway) = test_backend().await;

        let mut pull_data = vec![0x02, 0x00, 0x01, 0x02];
        pull_data.extend_from_slice(&GW_ID);
        gateway.send(&pull_data).await.unwrap();

        // Drain the PULL_ACK and lifecycle events.
        let mut buf = [0u8; 1024];
        tokio::time::timeout(Duration::from_secs(2), gateway.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        events.connects.recv().await.unwrap();
        events.notify_macs.recv().await.unwrap();

        let frame = gw::DownlinkFrame {
            phy_payload: vec![0x0A, 0x0B],
            tx_info: Some(gw::DownlinkTxInfo {
                gateway_id: GW_ID.to_vec(),
                timestamp: 1_000_000,
                frequency: 869_525_000,
                power: 14,
                modulation: Some(gw::Modulation {
                    parameters: Some(gw::modulation::Parameters::Lora(
                        gw::LoraModulationInfo {
                            bandwidth: 125,
                            spreading_factor: 9,
                            code_rate: "4/5".to_string(),
                            polarization_inversion: true,
                        },
                    )),
                }),
                ..Default::default()
            }),
            token: 0x1234_ABCD,
        };
        backend.send_downlink_frame(frame).await.unwrap();

        let len = tokio::time::timeout(Duration::from_secs(2), gateway.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        // Prefix carries the low 16 bits of the token.
        assert_eq!(&buf[..4], &[0x02, 0xAB, 0xCD, 0x03]);
        let pull_resp = packets::PullRespPacket::from_bytes(&buf[..len]).unwrap();
        assert_eq!(pull_resp.payload.txpk.tmst, Some(1_000_000));

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_configuration_writes_merged_file() {
        let dir = std::env::temp_dir().join(format!("lora-bridge-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let base_file = dir.join("base.json");
        let output_file = dir.join("output.json");
        let marker_file = dir.join("restarted");
        std::fs::write(
            &base_file,
            r#"{"SX1301_conf":{"radio_0":{"freq":868100000}}}"#,
        )
        .unwrap();

        let conf = SemtechUdpConfig {
            udp_bind: "127.0.0.1:0".to_string(),
            configuration: vec![PacketForwarderConfig {
                gateway_id: GatewayId::new(GW_ID),
                base_file: base_file.to_str().unwrap().to_string(),
                output_file: output_file.to_str().unwrap().to_string(),
                restart_command: format!("touch {}", marker_file.to_str().unwrap()),
            }],
            ..Default::default()
        };
        let (backend, mut events, gateway) = {
            let (backend, events) = SemtechUdpBackend::setup(&conf).await.unwrap();
            let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            gateway
                .connect(backend.socket.local_addr().unwrap())
                .await
                .unwrap();
            (backend, events, gateway)
        };

        let config = gw::GatewayConfiguration {
            gateway_id: GW_ID.to_vec(),
            version: "v2".to_string(),
            channels: vec![gw::ChannelConfiguration {
                frequency: 868_100_000,
                modulation_config: Some(
                    gw::channel_configuration::ModulationConfig::LoraModulationConfig(
                        gw::LoraModulationConfig {
                            bandwidth: 125,
                            spreading_factors: (7..=12).collect(),
                        },
                    ),
                ),
            }],
        };
        backend.apply_configuration(config).await.unwrap();

        let merged: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&output_file).unwrap()).unwrap();
        assert_eq!(merged["SX1301_conf"]["radio_0"]["enable"], true);
        assert_eq!(merged["SX1301_conf"]["chan_multiSF_0"]["enable"], true);
        assert!(marker_file.exists());

        // The next stats event for this gateway carries the version.
        let json = r#"{"stat":{"time":"2014-01-12 08:59:28 GMT","rxnb":1,"rxok":1,"rxfw":1,"ackr":100.0,"dwnb":0,"txnb":0}}"#;
        let mut push_data = vec![0x02, 0x00, 0x02, 0x00];
        push_data.extend_from_slice(&GW_ID);
        push_data.extend_from_slice(json.as_bytes());
        gateway.send(&push_data).await.unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), events.gateway_stats.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.config_version, "v2");

        backend.close().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_apply_configuration_unknown_gateway() {
        let (backend, _events, _gateway) = test_backend().await;
        let config = gw::GatewayConfiguration {
            gateway_id: vec![0xff; 8],
            ..Default::default()
        };
        let err = backend.apply_configuration(config).await.unwrap_err();
        assert!(err.downcast_ref::<GatewayDoesNotExist>().is_some());
        backend.close().await.unwrap();
    }
}
