//! TCP header.

use byteorder::{ByteOrder, NetworkEndian};

use super::DecodeError;

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;
pub const URG: u8 = 0x20;

const MIN_HDR_LEN: usize = 20;

pub struct Tcp<'a> {
    header: &'a [u8],
    payload: &'a [u8],
}

impl<'a> Tcp<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Tcp<'a>, DecodeError> {
        if data.len() < MIN_HDR_LEN {
            return Err(DecodeError::Truncated("tcp"));
        }
        let data_offset = ((data[12] >> 4) as usize) * 4;
        if data_offset < MIN_HDR_LEN || data.len() < data_offset {
            return Err(DecodeError::Truncated("tcp options"));
        }
        Ok(Tcp {
            header: &data[..data_offset],
            payload: &data[data_offset..],
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
    pub fn seq_no(&self) -> u32 {
        NetworkEndian::read_u32(&self.header[4..8])
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.header[13]
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn segment(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut s = vec![0u8; MIN_HDR_LEN];
        s[0..2].copy_from_slice(&src_port.to_be_bytes());
        s[2..4].copy_from_slice(&dst_port.to_be_bytes());
        s[4..8].copy_from_slice(&seq.to_be_bytes());
        s[12] = 5 << 4; // data offset
        s[13] = flags;
        s.extend_from_slice(payload);
        s
    }

    #[test]
    fn core_tcp_parse() {
        let s = segment(1234, 80, 42, SYN | ACK, b"hi");
        let tcp = Tcp::parse(&s).unwrap();
        assert_eq!(tcp.src_port(), 1234);
        assert_eq!(tcp.dst_port(), 80);
        assert_eq!(tcp.seq_no(), 42);
        assert_eq!(tcp.flags(), SYN | ACK);
        assert_eq!(tcp.payload(), b"hi");
    }

    #[test]
    fn core_tcp_bad_offset() {
        let mut s = segment(1, 2, 0, 0, &[]);
        s[12] = 15 << 4; // claims 60-byte header in a 20-byte segment
        assert!(Tcp::parse(&s).is_err());
    }
}
