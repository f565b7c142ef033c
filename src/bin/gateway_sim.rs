//! Gateway Simulator
//!
//! Simulates a LoRa gateway speaking the Semtech UDP Packet Forwarder
//! protocol at a running bridge. Useful for testing without hardware:
//! it polls with PULL_DATA (so downlinks can flow back), pushes a few
//! uplinks and a status report, and prints whatever the bridge
//! replies.
//!
//! Usage: cargo run --bin gateway-sim [server_addr]

use std::env;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Duration};

const PROTOCOL_VERSION: u8 = 0x02;
const PUSH_DATA: u8 = 0x00;
const PULL_DATA: u8 = 0x02;
const PULL_RESP: u8 = 0x03;

/// Fake gateway EUI
const GATEWAY_EUI: [u8; 8] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1700".to_string())
        .parse()?;

    println!("LoRa Bridge Gateway Simulator");
    println!("  Target: {}", server_addr);
    println!("  Gateway EUI: {}", hex::encode(GATEWAY_EUI));
    println!();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server_addr).await?;
    let mut token: u16 = 0;

    // Announce ourselves so the bridge registers our address.
    token = token.wrapping_add(1);
    socket.send(&build_pull_data(token)).await?;
    expect_reply(&socket, 0x04, "PULL_ACK").await;

    let scenarios: Vec<(&str, String)> = vec![
        ("Uplink (SF7, 868.1 MHz)", build_uplink_json(1_000_000, "SF7BW125", -42, 5.5)),
        ("Uplink (SF12, 868.3 MHz)", build_uplink_json(2_000_000, "SF12BW125", -117, -19.8)),
        ("Gateway status", build_stat_json()),
    ];

    for (desc, json) in &scenarios {
        token = token.wrapping_add(1);
        let packet = build_push_data(token, json);

        println!("Sending: {} ({} bytes)", desc, packet.len());
        socket.send(&packet).await?;
        expect_reply(&socket, 0x01, "PUSH_ACK").await;
        sleep(Duration::from_secs(1)).await;
    }

    // Keep polling for a while so a queued downlink can arrive.
    println!("Polling for downlinks (10s)...");
    for _ in 0..5 {
        token = token.wrapping_add(1);
        socket.send(&build_pull_data(token)).await?;

        let mut buf = [0u8; 65507];
        match timeout(Duration::from_secs(2), socket.recv(&mut buf)).await {
            Ok(Ok(len)) if len >= 4 && buf[3] == PULL_RESP => {
                println!(
                    "  PULL_RESP received (token 0x{:04x}): {}",
                    u16::from_be_bytes([buf[1], buf[2]]),
                    String::from_utf8_lossy(&buf[4..len])
                );
            }
            Ok(Ok(_)) => {} // PULL_ACK
            Ok(Err(e)) => println!("  recv error: {}", e),
            Err(_) => {}
        }
    }

    println!("Simulation complete");
    Ok(())
}

async fn expect_reply(socket: &UdpSocket, packet_type: u8, name: &str) {
    let mut buf = [0u8; 64];
    match timeout(Duration::from_secs(2), socket.recv(&mut buf)).await {
        Ok(Ok(len)) if len >= 4 && buf[3] == packet_type => {
            println!("  {} received", name);
        }
        Ok(Ok(len)) => println!("  unexpected reply ({} bytes)", len),
        Ok(Err(e)) => println!("  recv error: {}", e),
        Err(_) => println!("  no {} (timeout)", name),
    }
}

fn build_pull_data(token: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(12);
    packet.push(PROTOCOL_VERSION);
    packet.extend_from_slice(&token.to_be_bytes());
    packet.push(PULL_DATA);
    packet.extend_from_slice(&GATEWAY_EUI);
    packet
}

fn build_push_data(token: u16, json: &str) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.push(PROTOCOL_VERSION);
    packet.extend_from_slice(&token.to_be_bytes());
    packet.push(PUSH_DATA);
    packet.extend_from_slice(&GATEWAY_EUI);
    packet.extend_from_slice(json.as_bytes());
    packet
}

fn build_uplink_json(tmst: u32, datr: &str, rssi: i32, lsnr: f64) -> String {
    use base64::Engine;
    // An arbitrary payload; the bridge forwards it opaquely.
    let phy: Vec<u8> = vec![0x40, 0x34, 0x12, 0x0B, 0x26, 0x80, 0x42, 0x00, 0x01, 0xE1];
    format!(
        r#"{{"rxpk":[{{"tmst":{},"freq":868.1,"chan":0,"rfch":0,"stat":1,"modu":"LORA","datr":"{}","codr":"4/5","rssi":{},"lsnr":{},"size":{},"data":"{}"}}]}}"#,
        tmst,
        datr,
        rssi,
        lsnr,
        phy.len(),
        base64::engine::general_purpose::STANDARD.encode(&phy)
    )
}

fn build_stat_json() -> String {
    r#"{"stat":{"time":"2026-02-18 17:30:00 GMT","lati":29.7604,"long":-95.3698,"alti":15,"rxnb":47,"rxok":44,"rxfw":44,"ackr":100.0,"dwnb":3,"txnb":3}}"#
        .to_string()
}
