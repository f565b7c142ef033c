//! Basic Station (WebSocket) gateway backend.
//!
//! Connection-oriented: each gateway opens `/gateway/{eui}` after
//! discovering it through the one-shot `/router-info` handshake. A
//! per-connection writer task serializes pings, downlinks and
//! configuration pushes onto the socket; the read loop dispatches
//! inbound messages by `msgtype`.

pub mod messages;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::band::{Band, Region};
use crate::compiled::{common, gw};
use crate::config::BasicStationConfig;
use crate::gateway::GatewayId;
use crate::registry::Registry;

use super::{Backend, Events};

#[derive(Clone)]
struct GatewayEntry {
    tx: mpsc::Sender<Message>,
    config_version: String,
}

pub struct BasicStationBackend {
    scheme: &'static str,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    gateways: Arc<Registry<GatewayEntry>>,
    band: Band,
    net_ids: Vec<u32>,
    join_euis: Vec<[u64; 2]>,
    frequency_min: u32,
    frequency_max: u32,
    ping_interval: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    uplink_tx: mpsc::Sender<gw::UplinkFrame>,
    stats_tx: mpsc::Sender<gw::GatewayStats>,
    ack_tx: mpsc::Sender<gw::DownlinkTxAck>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BasicStationBackend {
    /// Bind the listener and start accepting gateways. A bind (or
    /// TLS material) failure is fatal for process startup.
    pub async fn setup(conf: &BasicStationConfig) -> anyhow::Result<(Arc<Self>, Events)> {
        let region: Region = conf.region.parse()?;
        let band = Band::config(region);

        let mut net_ids = Vec::new();
        for n in &conf.filters.net_ids {
            let raw = u32::from_str_radix(n, 16)
                .map_err(|e| anyhow::anyhow!("invalid net id '{}': {}", n, e))?;
            net_ids.push(raw);
        }
        let join_euis = conf
            .filters
            .join_euis
            .iter()
            .map(|[begin, end]| [begin.to_u64(), end.to_u64()])
            .collect();

        let tls = tls_acceptor(conf)?;
        let scheme = if tls.is_some() { "wss" } else { "ws" };

        let listener = TcpListener::bind(&conf.bind)
            .await
            .with_context(|| format!("bind websocket listener on {}", conf.bind))?;
        let local_addr = listener.local_addr()?;
        info!(
            bind = %local_addr,
            tls_cert = %conf.tls_cert,
            ca_cert = %conf.ca_cert,
            "basicstation: starting websocket listener"
        );

        let (registry, connects, disconnects) = Registry::new();
        let (uplink_tx, uplink_rx) = mpsc::channel(1);
        let (stats_tx, stats_rx) = mpsc::channel(1);
        let (ack_tx, ack_rx) = mpsc::channel(1);
        // Reachability notifications are a UDP-protocol concept; the
        // stream exists for interface symmetry and stays empty.
        let (_notify_tx, notify_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);

        let backend = Arc::new(BasicStationBackend {
            scheme,
            local_addr,
            shutdown,
            gateways: Arc::new(registry),
            band,
            net_ids,
            join_euis,
            frequency_min: conf.frequency_min,
            frequency_max: conf.frequency_max,
            ping_interval: conf.ping_interval,
            read_timeout: conf.read_timeout,
            write_timeout: conf.write_timeout,
            uplink_tx,
            stats_tx,
            ack_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let acceptor = tokio::spawn(backend.clone().accept_loop(listener, tls));
        backend.tasks.lock().unwrap().push(acceptor);

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

    /// The bound address, useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, tls: Option<TlsAcceptor>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.changed() => return,
                accepted = listener.accept() => match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        error!(error = %e, "basicstation: accept error");
                        continue;
                    }
                },
            };

            let backend = self.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => backend.serve_stream(tls_stream, peer).await,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "basicstation: tls handshake error");
                        }
                    },
                    None => backend.serve_stream(stream, peer).await,
                }
            });
        }
    }

    async fn serve_stream<S>(self: Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut path = String::new();
        let mut host = String::new();
        let callback = |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            if let Some(h) = req.headers().get("host").and_then(|h| h.to_str().ok()) {
                host = h.to_string();
            }
            Ok(resp)
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(peer = %peer, error = %e, "basicstation: websocket upgrade error");
                return;
            }
        };
        if host.is_empty() {
            host = self.local_addr.to_string();
        }

        if path == "/router-info" {
            self.handle_router_info(ws, peer, &host).await;
            return;
        }

        // The gateway id is the URL tail: /gateway/{eui}.
        let tail = path.rsplit('/').next().unwrap_or_default();
        match tail.parse::<GatewayId>() {
            Ok(gateway_id) => self.handle_gateway(ws, gateway_id, peer).await,
            Err(e) => {
                error!(peer = %peer, url = %path, error = %e, "basicstation: unable to read gateway id from url");
            }
        }
    }

    /// One-shot discovery handshake: the gateway learns its
    /// data-plane URL.
    async fn handle_router_info<S>(
        &self,
        mut ws: tokio_tungstenite::WebSocketStream<S>,
        peer: SocketAddr,
        host: &str,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let msg = match tokio::time::timeout(self.read_timeout, ws.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                warn!(peer = %peer, error = %e, "basicstation: read message error");
                return;
            }
            Ok(None) | Err(_) => return,
        };

        let request: messages::RouterInfoRequest = match serde_json::from_slice(&msg.into_data()) {
            Ok(r) => r,
            Err(e) => {
                warn!(peer = %peer, error = %e, "basicstation: unmarshal router-info request error");
                return;
            }
        };

        let gateway_id = request.router.gateway_id();
        let response = messages::RouterInfoResponse {
            router: request.router,
            muxs: request.router,
            uri: format!("{}://{}/gateway/{}", self.scheme, host, gateway_id),
        };

        let payload = match serde_json::to_string(&response) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "basicstation: marshal router-info response error");
                return;
            }
        };
        match tokio::time::timeout(self.write_timeout, ws.send(Message::Text(payload))).await {
            Err(_) => {
                warn!(peer = %peer, "basicstation: write timeout");
                return;
            }
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "basicstation: websocket send message error");
                return;
            }
            Ok(Ok(())) => {}
        }

        info!(
            gateway_id = %gateway_id,
            remote_addr = %peer,
            "basicstation: router-info request received"
        );
    }

    async fn handle_gateway<S>(
        &self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        gateway_id: GatewayId,
        peer: SocketAddr,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // A second connection for a live id is rejected, not adopted.
        if self.gateways.contains(gateway_id) {
            error!(gateway_id = %gateway_id, "basicstation: connection with same gateway id already exists");
            return;
        }

        let (tx, rx) = mpsc::channel::<Message>(16);
        self.gateways
            .set(gateway_id, GatewayEntry { tx, config_version: String::new() })
            .await;
        info!(gateway_id = %gateway_id, remote_addr = %peer, "basicstation: gateway connected");

        let (sink, mut stream) = ws.split();
        let writer = tokio::spawn(write_loop(
            sink,
            rx,
            self.ping_interval,
            self.write_timeout,
        ));

        loop {
            let msg = match tokio::time::timeout(self.read_timeout, stream.next()).await {
                Err(_) => {
                    warn!(gateway_id = %gateway_id, "basicstation: read timeout");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(gateway_id = %gateway_id, error = %e, "basicstation: read message error");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Text(_) | Message::Binary(_) => {
                    self.handle_message(gateway_id, peer, &msg.into_data()).await;
                }
                // Any pong resets the read deadline simply by being a
                // received message.
                Message::Pong(_) => debug!(gateway_id = %gateway_id, "basicstation: pong received"),
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.gateways.remove(gateway_id).await;
        writer.abort();
        info!(gateway_id = %gateway_id, remote_addr = %peer, "basicstation: gateway disconnected");
    }

    async fn handle_message(&self, gateway_id: GatewayId, peer: SocketAddr, data: &[u8]) {
        let message_type = match messages::message_type(data) {
            Ok(t) => t,
            Err(e) => {
                error!(
                    gateway_id = %gateway_id,
                    payload = %String::from_utf8_lossy(data),
                    error = %e,
                    "basicstation: get message-type error"
                );
                return;
            }
        };

        let result = match message_type {
            messages::MessageType::Version => self.handle_version(gateway_id, peer, data).await,
            messages::MessageType::UplinkDataFrame => {
                self.handle_uplink_data_frame(gateway_id, data).await
            }
            messages::MessageType::JoinRequest => self.handle_join_request(gateway_id, data).await,
            messages::MessageType::ProprietaryDataFrame => {
                self.handle_proprietary_frame(gateway_id, data).await
            }
            messages::MessageType::DownlinkTransmitted => {
                self.handle_downlink_transmitted(gateway_id, data).await
            }
            messages::MessageType::RouterInfo | messages::MessageType::Unknown(_) => {
                warn!(
                    gateway_id = %gateway_id,
                    message_type = ?message_type,
                    payload = %String::from_utf8_lossy(data),
                    "basicstation: unexpected message-type"
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(
                gateway_id = %gateway_id,
                payload = %String::from_utf8_lossy(data),
                error = %e,
                "basicstation: handle message error"
            );
        }
    }

    /// `version` doubles as the end of the connect handshake: reply
    /// with the regional router_config and emit a stats event.
    async fn handle_version(
        &self,
        gateway_id: GatewayId,
        peer: SocketAddr,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let version: messages::Version = serde_json::from_slice(data)?;
        info!(
            gateway_id = %gateway_id,
            station = %version.station,
            firmware = %version.firmware,
            package = %version.package,
            model = %version.model,
            protocol = version.protocol,
            "basicstation: gateway version received"
        );

        let router_config = messages::RouterConfig::from_band(
            &self.band,
            &self.net_ids,
            &self.join_euis,
            self.frequency_min,
            self.frequency_max,
        )?;
        self.send_to_gateway(gateway_id, &router_config).await?;

        let entry = self.gateways.get(gateway_id)?;
        let _ = self
            .stats_tx
            .send(gw::GatewayStats {
                gateway_id: gateway_id.to_vec(),
                ip: peer.ip().to_string(),
                time: Some(common::Timestamp::from(Utc::now())),
                config_version: entry.config_version,
                ..Default::default()
            })
            .await;
        Ok(())
    }

    async fn handle_uplink_data_frame(
        &self,
        gateway_id: GatewayId,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let updf: messages::UplinkDataFrame = serde_json::from_slice(data)?;
        info!(gateway_id = %gateway_id, "basicstation: uplink frame received");
        let frame = updf.to_proto(&self.band, gateway_id)?;
        let _ = self.uplink_tx.send(frame).await;
        Ok(())
    }

    async fn handle_join_request(&self, gateway_id: GatewayId, data: &[u8]) -> anyhow::Result<()> {
        let jreq: messages::JoinRequest = serde_json::from_slice(data)?;
        info!(gateway_id = %gateway_id, "basicstation: join-request received");
        let frame = jreq.to_proto(&self.band, gateway_id)?;
        let _ = self.uplink_tx.send(frame).await;
        Ok(())
    }

    async fn handle_proprietary_frame(
        &self,
        gateway_id: GatewayId,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let propdf: messages::UplinkProprietaryFrame = serde_json::from_slice(data)?;
        info!(gateway_id = %gateway_id, "basicstation: proprietary uplink frame received");
        let frame = propdf.to_proto(&self.band, gateway_id)?;
        let _ = self.uplink_tx.send(frame).await;
        Ok(())
    }

    async fn handle_downlink_transmitted(
        &self,
        gateway_id: GatewayId,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let dntxed: messages::DownlinkTransmitted = serde_json::from_slice(data)?;
        info!(gateway_id = %gateway_id, "basicstation: downlink transmitted message received");
        let _ = self.ack_tx.send(dntxed.to_proto(gateway_id)).await;
        Ok(())
    }

    async fn send_to_gateway<T: serde::Serialize>(
        &self,
        gateway_id: GatewayId,
        message: &T,
    ) -> anyhow::Result<()> {
        let entry = self.gateways.get(gateway_id)?;
        let payload = serde_json::to_string(message)?;
        entry
            .tx
            .send(Message::Text(payload))
            .await
            .map_err(|_| anyhow::anyhow!("gateway connection closed"))?;
        Ok(())
    }
}

#[async_trait]
impl Backend for BasicStationBackend {
    /// Queue the frame as a `dnmsg` on the gateway's socket.
    async fn send_downlink_frame(&self, frame: gw::DownlinkFrame) -> anyhow::Result<()> {
        let gateway_id = GatewayId::from_slice(
            &frame
                .tx_info
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("downlink frame without tx_info"))?
                .gateway_id,
        )?;

        let dnmsg = messages::DownlinkMessage::from_proto(&self.band, &frame)?;
        self.send_to_gateway(gateway_id, &dnmsg).await?;
        info!(gateway_id = %gateway_id, "basicstation: downlink-frame message sent to gateway");
        Ok(())
    }

    /// Push a fresh `router_config` derived from the supplied channel
    /// plan and remember its version for subsequent stats.
    async fn apply_configuration(&self, config: gw::GatewayConfiguration) -> anyhow::Result<()> {
        let gateway_id = GatewayId::from_slice(&config.gateway_id)?;

        let router_config = messages::RouterConfig::from_gateway_configuration(
            &self.band,
            &self.net_ids,
            &self.join_euis,
            &config,
        )?;
        self.send_to_gateway(gateway_id, &router_config).await?;

        self.gateways
            .update(gateway_id, |entry| entry.config_version = config.version.clone());
        info!(gateway_id = %gateway_id, "basicstation: router-config message sent to gateway");
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        info!("basicstation: closing gateway backend");
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

/// Owns the socket sink: downlinks and configuration pushes arrive on
/// the channel, pings fire on the interval, every write re-arms the
/// write deadline.
async fn write_loop<S>(
    mut sink: futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Message>,
    ping_interval: Duration,
    write_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so the first ping
    // waits a full interval.
    ticker.tick().await;

    loop {
        let msg = tokio::select! {
            _ = ticker.tick() => Message::Ping(Vec::new()),
            m = rx.recv() => match m {
                Some(m) => m,
                None => return,
            },
        };
        match tokio::time::timeout(write_timeout, sink.send(msg)).await {
            Err(_) => {
                warn!("basicstation: write timeout");
                return;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "basicstation: send message error");
                return;
            }
            Ok(Ok(())) => {}
        }
    }
}

fn tls_acceptor(conf: &BasicStationConfig) -> anyhow::Result<Option<TlsAcceptor>> {
    if conf.tls_cert.is_empty() && conf.tls_key.is_empty() {
        if !conf.ca_cert.is_empty() {
            anyhow::bail!("ca_cert is set but tls_cert / tls_key are not");
        }
        return Ok(None);
    }

    let certs: Vec<CertificateDer> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
            &conf.tls_cert,
        )?))
        .collect::<Result<_, _>>()
        .context("read tls cert")?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
        &conf.tls_key,
    )?))
    .context("read tls key")?
    .ok_or_else(|| anyhow::anyhow!("no private key in {}", conf.tls_key))?;

    let builder = ServerConfig::builder();
    let server_config = if conf.ca_cert.is_empty() {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("build tls config")?
    } else {
        // Client certificates are required when a CA is configured.
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
            &conf.ca_cert,
        )?)) {
            roots.add(cert.context("read ca cert")?)?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("build client cert verifier")?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .context("build tls config")?
    };

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_backend() -> (Arc<BasicStationBackend>, Events) {
        let conf = BasicStationConfig {
            bind: "127.0.0.1:0".to_string(),
            ping_interval: Duration::from_secs(60),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        BasicStationBackend::setup(&conf).await.unwrap()
    }

    async fn connect(
        backend: &BasicStationBackend,
        path: &str,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let url = format!("ws://{}{}", backend.local_addr(), path);
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws
    }

    #[tokio::test]
    async fn test_router_info_handshake() {
        let (backend, _events) = test_backend().await;

        let mut ws = connect(&backend, "/router-info").await;
        ws.send(Message::Text(
            r#"{"router": "01-02-03-04-05-06-07-08"}"#.to_string(),
        ))
        .await
        .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&reply.into_data()).unwrap();
        assert_eq!(value["router"], "01-02-03-04-05-06-07-08");
        assert_eq!(value["muxs"], "01-02-03-04-05-06-07-08");
        let uri = value["uri"].as_str().unwrap();
        assert!(uri.starts_with("ws://"));
        assert!(uri.ends_with("/gateway/0102030405060708"));

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_version_yields_router_config_and_stats() {
        let (backend, mut events) = test_backend().await;

        let mut ws = connect(&backend, "/gateway/0102030405060708").await;
        let connected = tokio::time::timeout(Duration::from_secs(2), events.connects.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connected.to_string(), "0102030405060708");

        ws.send(Message::Text(
            r#"{"msgtype":"version","station":"2.0.5","firmware":"1.0","package":"","model":"corecell","protocol":2}"#.to_string(),
        ))
        .await
        .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let rc: serde_json::Value = serde_json::from_slice(&reply.into_data()).unwrap();
        assert_eq!(rc["msgtype"], "router_config");
        assert_eq!(rc["region"], "EU868");

        let stats = tokio::time::timeout(Duration::from_secs(2), events.gateway_stats.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stats.gateway_id,
            vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
        assert!(stats.time.is_some());

        drop(ws);
        let disconnected =
            tokio::time::timeout(Duration::from_secs(2), events.disconnects.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(disconnected.to_string(), "0102030405060708");

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_gateway_rejected() {
        let (backend, mut events) = test_backend().await;

        let _ws1 = connect(&backend, "/gateway/0102030405060708").await;
        events.connects.recv().await.unwrap();

        let mut ws2 = connect(&backend, "/gateway/0102030405060708").await;
        // The backend drops the second socket without registering it.
        let next = tokio::time::timeout(Duration::from_secs(2), ws2.next()).await;
        match next {
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) => {}
            other => panic!("Expected closed second connection, got {:?}", other),
        }
        assert_eq!(backend.gateways.len(), 1);

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_updf_emits_uplink() {
        let (backend, mut events) = test_backend().await;

        let mut ws = connect(&backend, "/gateway/0102030405060708").await;
        events.connects.recv().await.unwrap();

        ws.send(Message::Text(
            r#"{
                "msgtype": "updf",
                "MHdr": 64, "DevAddr": 1, "FCtrl": 0, "FCnt": 2,
                "FOpts": "", "FPort": 1, "FRMPayload": "01",
                "MIC": 0, "DR": 5, "Freq": 868100000,
                "upinfo": {"rctx": 0, "xtime": 123, "gpstime": 0, "rssi": -50.0, "snr": 9.2}
            }"#
            .to_string(),
        ))
        .await
        .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), events.uplink_frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.tx_info.as_ref().unwrap().frequency, 868_100_000);
        assert_eq!(frame.rx_info.as_ref().unwrap().rssi, -50);

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_downlink_and_dntxed_round_trip() {
        let (backend, mut events) = test_backend().await;

        let mut ws = connect(&backend, "/gateway/0102030405060708").await;
        events.connects.recv().await.unwrap();

        let frame = gw::DownlinkFrame {
            phy_payload: vec![0x01, 0x02],
            tx_info: Some(gw::DownlinkTxInfo {
                gateway_id: vec![1, 2, 3, 4, 5, 6, 7, 8],
                timestamp: 1_000_000,
                frequency: 869_525_000,
                modulation: Some(gw::Modulation {
                    parameters: Some(gw::modulation::Parameters::Lora(
                        gw::LoraModulationInfo {
                            bandwidth: 125,
                            spreading_factor: 12,
                            code_rate: "4/5".to_string(),
                            polarization_inversion: true,
                        },
                    )),
                }),
                ..Default::default()
            }),
            token: 7777,
        };
        backend.send_downlink_frame(frame).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let dnmsg: serde_json::Value = serde_json::from_slice(&msg.into_data()).unwrap();
        assert_eq!(dnmsg["msgtype"], "dnmsg");
        assert_eq!(dnmsg["diid"], 7777);

        // The station acknowledges the transmission.
        ws.send(Message::Text(
            r#"{"msgtype":"dntxed","diid":7777,"DevEui":"00-00-00-00-00-00-00-00","rctx":0,"xtime":0}"#.to_string(),
        ))
        .await
        .unwrap();
        let ack = tokio::time::timeout(Duration::from_secs(2), events.downlink_tx_acks.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.token, 7777);
        assert_eq!(ack.error, "");

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_downlink_to_unknown_gateway_fails() {
        let (backend, _events) = test_backend().await;
        let frame = gw::DownlinkFrame {
            phy_payload: vec![0x01],
            tx_info: Some(gw::DownlinkTxInfo {
                gateway_id: vec![0xff; 8],
                frequency: 869_525_000,
                modulation: Some(gw::Modulation {
                    parameters: Some(gw::modulation::Parameters::Lora(
                        gw::LoraModulationInfo {
                            bandwidth: 125,
                            spreading_factor: 12,
                            code_rate: "4/5".to_string(),
                            polarization_inversion: true,
                        },
                    )),
                }),
                ..Default::default()
            }),
            token: 1,
        };
        assert!(backend.send_downlink_frame(frame).await.is_err());
        backend.close().await.unwrap();
    }
}
