//! Layer-4 protocol data units handed from the decoder to the flow router.

use std::fmt;
use std::net::SocketAddr;

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Parsed L2-L4 metadata for one captured packet.
#[derive(Debug, Clone, Copy)]
pub struct L4Context {
    /// Capture timestamp, milliseconds UTC.
    pub ts: u64,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub proto: Transport,
    /// TCP sequence number; 0 for UDP.
    pub seq_no: u32,
    /// TCP flags byte; 0 for UDP.
    pub flags: u8,
}

/// One decoded packet: metadata plus owned application payload.
///
/// Payload bytes are owned so PDUs can cross the worker channel without
/// borrowing from the capture buffer.
#[derive(Debug)]
pub struct L4Pdu {
    pub ctxt: L4Context,
    pub payload: Vec<u8>,
}

impl L4Pdu {
    #[inline]
    pub fn length(&self) -> usize {
        self.payload.len()
    }
}
