//! UDP header.

use byteorder::{ByteOrder, NetworkEndian};

use super::DecodeError;

const HDR_LEN: usize = 8;

pub struct Udp<'a> {
    header: &'a [u8],
    payload: &'a [u8],
}

impl<'a> Udp<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Udp<'a>, DecodeError> {
        if data.len() < HDR_LEN {
            return Err(DecodeError::Truncated("udp"));
        }
        let length = NetworkEndian::read_u16(&data[4..6]) as usize;
        if length < HDR_LEN {
            return Err(DecodeError::Invalid("udp length"));
        }
        let end = length.min(data.len());
        Ok(Udp {
            header: &data[..HDR_LEN],
            payload: &data[HDR_LEN..end],
        })
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.header[0..2])
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.header[2..4])
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut d = vec![0u8; HDR_LEN];
        d[0..2].copy_from_slice(&src_port.to_be_bytes());
        d[2..4].copy_from_slice(&dst_port.to_be_bytes());
        d[4..6].copy_from_slice(&((HDR_LEN + payload.len()) as u16).to_be_bytes());
        d.extend_from_slice(payload);
        d
    }

    #[test]
    fn core_udp_parse() {
        let d = datagram(5353, 53, b"abc");
        let udp = Udp::parse(&d).unwrap();
        assert_eq!(udp.src_port(), 5353);
        assert_eq!(udp.dst_port(), 53);
        assert_eq!(udp.payload(), b"abc");
    }

    #[test]
    fn core_udp_truncated() {
        assert!(Udp::parse(&[0u8; 4]).is_err());
    }
}
