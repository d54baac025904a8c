//! Synthetic frame builders and a runtime harness for pipeline tests.

use flowscope_core::{CollectSink, Config, Runtime};

use serde_json::Value;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const ACK: u8 = 0x10;

fn ethernet(ip: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 12];
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    frame.extend_from_slice(ip);
    frame
}

fn ipv4(src: [u8; 4], dst: [u8; 4], proto: u8, l4: &[u8]) -> Vec<u8> {
    let total = (20 + l4.len()) as u16;
    let mut ip = vec![
        0x45, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x40, proto, 0x00, 0x00,
    ];
    ip[2..4].copy_from_slice(&total.to_be_bytes());
    ip.extend_from_slice(&src);
    ip.extend_from_slice(&dst);
    ip.extend_from_slice(l4);
    ip
}

pub fn tcp_frame(
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    seq: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut tcp = vec![0u8; 20];
    tcp[0..2].copy_from_slice(&sport.to_be_bytes());
    tcp[2..4].copy_from_slice(&dport.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    tcp.extend_from_slice(payload);
    ethernet(&ipv4(src, dst, IP_PROTO_TCP, &tcp))
}

pub fn udp_frame(
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut udp = vec![0u8; 8];
    udp[0..2].copy_from_slice(&sport.to_be_bytes());
    udp[2..4].copy_from_slice(&dport.to_be_bytes());
    udp[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    udp.extend_from_slice(payload);
    ethernet(&ipv4(src, dst, IP_PROTO_UDP, &udp))
}

/// Single-worker, tickless runtime for deterministic tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.runtime.workers = 1;
    config.runtime.tick = false;
    config
}

pub fn run_frames(config: Config, frames: &[(u64, Vec<u8>)]) -> Vec<Value> {
    let sink = CollectSink::new();
    let runtime = Runtime::new(config, Box::new(sink.clone())).unwrap();
    for (ts, frame) in frames {
        runtime.deliver(*ts, flowscope_core::LinkType::Ethernet, frame);
    }
    runtime.shutdown();
    let events = sink.events.lock().unwrap();
    events.clone()
}

/// Hand-built DNS query for `www.google.com A`, id 0x1234.
pub fn dns_query(id: u16) -> Vec<u8> {
    let mut m = id.to_be_bytes().to_vec();
    m.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in ["www", "google", "com"] {
        m.push(label.len() as u8);
        m.extend_from_slice(label.as_bytes());
    }
    m.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01]);
    m
}

/// Matching response with one A record 1.2.3.4.
pub fn dns_response(id: u16) -> Vec<u8> {
    let mut m = id.to_be_bytes().to_vec();
    m.extend_from_slice(&[0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
    for label in ["www", "google", "com"] {
        m.push(label.len() as u8);
        m.extend_from_slice(label.as_bytes());
    }
    m.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01]);
    m.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01, 0x2c]);
    m.extend_from_slice(&[0x00, 0x04, 1, 2, 3, 4]);
    m
}
