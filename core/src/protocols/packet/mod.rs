//! Link-, network- and transport-layer header parsing.
//!
//! [`decode_frame`] strips L2/L3/L4 headers from a captured frame and
//! produces an [`L4Pdu`] for the flow router, or a [`DecodeError`] for
//! anything that cannot be classified. Zero-payload TCP segments are still
//! forwarded so SYN/FIN/RST control flags reach the reassembler.

pub mod ethernet;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

use self::ethernet::{Ethernet, ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use self::ipv4::{Ipv4, IP_PROTO_TCP, IP_PROTO_UDP};
use self::ipv6::Ipv6;
use self::tcp::Tcp;
use self::udp::Udp;
use crate::conntrack::pdu::{L4Context, L4Pdu, Transport};

use std::net::{IpAddr, SocketAddr};

use byteorder::{ByteOrder, NetworkEndian};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated {0} header")]
    Truncated(&'static str),
    #[error("invalid {0}")]
    Invalid(&'static str),
    #[error("unsupported link type {0}")]
    UnsupportedLinkType(i32),
    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedEtherType(u16),
    #[error("unsupported ip protocol {0}")]
    UnsupportedIpProto(u8),
}

/// Link-layer framing of the capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Raw IP, no link header.
    RawIp,
    /// BSD/Darwin loopback: 4-byte address-family word.
    Null,
    /// Linux cooked capture (SLL), 16-byte pseudo header.
    LinuxSll,
}

impl LinkType {
    /// Maps a pcap DLT value.
    pub fn from_dlt(dlt: i32) -> Result<LinkType, DecodeError> {
        match dlt {
            1 => Ok(LinkType::Ethernet),
            12 | 101 => Ok(LinkType::RawIp),
            0 | 108 => Ok(LinkType::Null),
            113 => Ok(LinkType::LinuxSll),
            other => Err(DecodeError::UnsupportedLinkType(other)),
        }
    }
}

/// Decodes one captured frame down to its transport payload.
pub fn decode_frame(link: LinkType, ts: u64, data: &[u8]) -> Result<L4Pdu, DecodeError> {
    match link {
        LinkType::Ethernet => {
            let eth = Ethernet::parse(data)?;
            match eth.ethertype() {
                ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => decode_ip(ts, eth.payload()),
                other => Err(DecodeError::UnsupportedEtherType(other)),
            }
        }
        LinkType::RawIp => decode_ip(ts, data),
        LinkType::Null => {
            if data.len() < 4 {
                return Err(DecodeError::Truncated("null link"));
            }
            decode_ip(ts, &data[4..])
        }
        LinkType::LinuxSll => {
            if data.len() < 16 {
                return Err(DecodeError::Truncated("linux sll"));
            }
            match NetworkEndian::read_u16(&data[14..16]) {
                ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => decode_ip(ts, &data[16..]),
                other => Err(DecodeError::UnsupportedEtherType(other)),
            }
        }
    }
}

fn decode_ip(ts: u64, data: &[u8]) -> Result<L4Pdu, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Truncated("ip"));
    }
    let (src_ip, dst_ip, proto, l4): (IpAddr, IpAddr, u8, &[u8]) = match data[0] >> 4 {
        4 => {
            let ip = Ipv4::parse(data)?;
            if ip.is_fragment() {
                return Err(DecodeError::Invalid("ipv4 fragment"));
            }
            (ip.src().into(), ip.dst().into(), ip.protocol(), ip.payload())
        }
        6 => {
            let ip = Ipv6::parse(data)?;
            (ip.src().into(), ip.dst().into(), ip.protocol(), ip.payload())
        }
        v => {
            let _ = v;
            return Err(DecodeError::Invalid("ip version"));
        }
    };

    match proto {
        IP_PROTO_TCP => {
            let t = Tcp::parse(l4)?;
            Ok(L4Pdu {
                ctxt: L4Context {
                    ts,
                    src: SocketAddr::new(src_ip, t.src_port()),
                    dst: SocketAddr::new(dst_ip, t.dst_port()),
                    proto: Transport::Tcp,
                    seq_no: t.seq_no(),
                    flags: t.flags(),
                },
                payload: t.payload().to_vec(),
            })
        }
        IP_PROTO_UDP => {
            let u = Udp::parse(l4)?;
            Ok(L4Pdu {
                ctxt: L4Context {
                    ts,
                    src: SocketAddr::new(src_ip, u.src_port()),
                    dst: SocketAddr::new(dst_ip, u.dst_port()),
                    proto: Transport::Udp,
                    seq_no: 0,
                    flags: 0,
                },
                payload: u.payload().to_vec(),
            })
        }
        other => Err(DecodeError::UnsupportedIpProto(other)),
    }
}
