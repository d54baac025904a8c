//! IPv6 header, with skipping of the chained extension headers that can
//! legally precede the transport header.

use std::net::Ipv6Addr;

use byteorder::{ByteOrder, NetworkEndian};

use super::DecodeError;

const HDR_LEN: usize = 40;

const EXT_HOP_BY_HOP: u8 = 0;
const EXT_ROUTING: u8 = 43;
const EXT_FRAGMENT: u8 = 44;
const EXT_DEST_OPTS: u8 = 60;

pub struct Ipv6<'a> {
    header: &'a [u8],
    next_header: u8,
    payload: &'a [u8],
}

impl<'a> Ipv6<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Ipv6<'a>, DecodeError> {
        if data.len() < HDR_LEN {
            return Err(DecodeError::Truncated("ipv6"));
        }
        if data[0] >> 4 != 6 {
            return Err(DecodeError::Invalid("ipv6 version"));
        }
        let payload_len = NetworkEndian::read_u16(&data[4..6]) as usize;
        let end = (HDR_LEN + payload_len).min(data.len());
        let mut next_header = data[6];
        let mut rest = &data[HDR_LEN..end];

        loop {
            match next_header {
                EXT_HOP_BY_HOP | EXT_ROUTING | EXT_DEST_OPTS => {
                    if rest.len() < 8 {
                        return Err(DecodeError::Truncated("ipv6 extension"));
                    }
                    let ext_len = 8 + rest[1] as usize * 8;
                    if rest.len() < ext_len {
                        return Err(DecodeError::Truncated("ipv6 extension"));
                    }
                    next_header = rest[0];
                    rest = &rest[ext_len..];
                }
                EXT_FRAGMENT => return Err(DecodeError::Invalid("ipv6 fragment")),
                _ => break,
            }
        }

        Ok(Ipv6 {
            header: &data[..HDR_LEN],
            next_header,
            payload: rest,
        })
    }

    #[inline]
    pub fn src(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.header[8..24]);
        Ipv6Addr::from(octets)
    }

    #[inline]
    pub fn dst(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.header[24..40]);
        Ipv6Addr::from(octets)
    }

    #[inline]
    pub fn protocol(&self) -> u8 {
        self.next_header
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::packet::ipv4::IP_PROTO_UDP;

    fn header(next: u8, payload: &[u8]) -> Vec<u8> {
        let mut h = vec![0u8; HDR_LEN];
        h[0] = 0x60;
        h[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        h[6] = next;
        h[7] = 64; // hop limit
        h[8..24].copy_from_slice(&Ipv6Addr::LOCALHOST.octets());
        h[24..40].copy_from_slice(&Ipv6Addr::LOCALHOST.octets());
        h.extend_from_slice(payload);
        h
    }

    #[test]
    fn core_ipv6_parse() {
        let h = header(IP_PROTO_UDP, &[5, 6, 7]);
        let ip = Ipv6::parse(&h).unwrap();
        assert_eq!(ip.protocol(), IP_PROTO_UDP);
        assert_eq!(ip.payload(), &[5, 6, 7]);
        assert_eq!(ip.src(), Ipv6Addr::LOCALHOST);
    }

    #[test]
    fn core_ipv6_hop_by_hop_skip() {
        // hop-by-hop ext header (8 bytes) followed by one payload byte
        let mut ext = vec![IP_PROTO_UDP, 0, 0, 0, 0, 0, 0, 0];
        ext.push(0xbb);
        let h = header(EXT_HOP_BY_HOP, &ext);
        let ip = Ipv6::parse(&h).unwrap();
        assert_eq!(ip.protocol(), IP_PROTO_UDP);
        assert_eq!(ip.payload(), &[0xbb]);
    }

    #[test]
    fn core_ipv6_fragment_rejected() {
        let ext = vec![IP_PROTO_UDP, 0, 0, 0, 0, 0, 0, 0];
        let h = header(EXT_FRAGMENT, &ext);
        assert!(Ipv6::parse(&h).is_err());
    }
}
