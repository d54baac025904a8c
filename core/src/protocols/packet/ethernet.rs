//! Ethernet II frame header.

use byteorder::{ByteOrder, NetworkEndian};

use super::DecodeError;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_ARP: u16 = 0x0806;

const HDR_LEN: usize = 14;
const VLAN_LEN: usize = 4;

/// A parsed Ethernet II header, with at most one 802.1Q VLAN tag unwrapped.
pub struct Ethernet<'a> {
    ethertype: u16,
    payload: &'a [u8],
}

impl<'a> Ethernet<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Ethernet<'a>, DecodeError> {
        if data.len() < HDR_LEN {
            return Err(DecodeError::Truncated("ethernet"));
        }
        let mut ethertype = NetworkEndian::read_u16(&data[12..14]);
        let mut offset = HDR_LEN;
        if ethertype == ETHERTYPE_VLAN {
            if data.len() < HDR_LEN + VLAN_LEN {
                return Err(DecodeError::Truncated("vlan"));
            }
            ethertype = NetworkEndian::read_u16(&data[16..18]);
            offset += VLAN_LEN;
        }
        Ok(Ethernet {
            ethertype,
            payload: &data[offset..],
        })
    }

    #[inline]
    pub fn ethertype(&self) -> u16 {
        self.ethertype
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; 12];
        f.extend_from_slice(&ethertype.to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    #[test]
    fn core_ethernet_parse() {
        let f = frame(ETHERTYPE_IPV4, &[1, 2, 3]);
        let eth = Ethernet::parse(&f).unwrap();
        assert_eq!(eth.ethertype(), ETHERTYPE_IPV4);
        assert_eq!(eth.payload(), &[1, 2, 3]);
    }

    #[test]
    fn core_ethernet_vlan_unwrap() {
        let mut f = vec![0u8; 12];
        f.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        f.extend_from_slice(&[0x00, 0x64]); // VLAN id 100
        f.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
        f.push(0xaa);
        let eth = Ethernet::parse(&f).unwrap();
        assert_eq!(eth.ethertype(), ETHERTYPE_IPV6);
        assert_eq!(eth.payload(), &[0xaa]);
    }

    #[test]
    fn core_ethernet_truncated() {
        assert!(Ethernet::parse(&[0u8; 10]).is_err());
    }
}
