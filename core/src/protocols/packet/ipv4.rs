//! IPv4 header.

use std::net::Ipv4Addr;

use byteorder::{ByteOrder, NetworkEndian};

use super::DecodeError;

pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

const MIN_HDR_LEN: usize = 20;

pub struct Ipv4<'a> {
    header: &'a [u8],
    payload: &'a [u8],
}

impl<'a> Ipv4<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Ipv4<'a>, DecodeError> {
        if data.len() < MIN_HDR_LEN {
            return Err(DecodeError::Truncated("ipv4"));
        }
        if data[0] >> 4 != 4 {
            return Err(DecodeError::Invalid("ipv4 version"));
        }
        let ihl = ((data[0] & 0x0f) as usize) * 4;
        if ihl < MIN_HDR_LEN || data.len() < ihl {
            return Err(DecodeError::Truncated("ipv4 options"));
        }
        let total_len = NetworkEndian::read_u16(&data[2..4]) as usize;
        if total_len < ihl {
            return Err(DecodeError::Invalid("ipv4 total length"));
        }
        // trim link-layer padding; tolerate captures shorter than total_len
        let end = total_len.min(data.len());
        Ok(Ipv4 {
            header: &data[..ihl],
            payload: &data[ihl..end],
        })
    }

    #[inline]
    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.header[12],
            self.header[13],
            self.header[14],
            self.header[15],
        )
    }

    #[inline]
    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.header[16],
            self.header[17],
            self.header[18],
            self.header[19],
        )
    }

    #[inline]
    pub fn protocol(&self) -> u8 {
        self.header[9]
    }

    /// True for any fragment (offset != 0 or more-fragments set). The capture
    /// layer is expected to deliver reassembled datagrams; fragments that
    /// reach us anyway are dropped.
    #[inline]
    pub fn is_fragment(&self) -> bool {
        let flags_frag = NetworkEndian::read_u16(&self.header[6..8]);
        flags_frag & 0x2000 != 0 || flags_frag & 0x1fff != 0
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}
