//! Connection identifiers.

use crate::conntrack::pdu::{L4Context, Transport};

use std::fmt;
use std::net::SocketAddr;

/// Direction of a packet relative to the flow's first observed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// Same direction as the first packet (originator to responder).
    Orig,
    /// Reverse direction.
    Resp,
}

impl Dir {
    #[inline]
    pub fn flip(self) -> Dir {
        match self {
            Dir::Orig => Dir::Resp,
            Dir::Resp => Dir::Orig,
        }
    }

    /// Index into per-direction state arrays.
    #[inline]
    pub fn idx(self) -> usize {
        match self {
            Dir::Orig => 0,
            Dir::Resp => 1,
        }
    }
}

/// The oriented connection 5-tuple: `orig` is the endpoint that sent the
/// first observed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub orig: SocketAddr,
    pub resp: SocketAddr,
    pub proto: Transport,
}

impl FiveTuple {
    pub fn from_ctxt(ctxt: &L4Context) -> Self {
        FiveTuple {
            orig: ctxt.src,
            resp: ctxt.dst,
            proto: ctxt.proto,
        }
    }

    /// Order-independent key for the flow table: both directions of a
    /// connection map to the same `ConnId`.
    pub fn conn_id(&self) -> ConnId {
        ConnId::new(self.orig, self.resp, self.proto)
    }

    /// Direction of a packet sent from `src`.
    #[inline]
    pub fn dir_of(&self, src: &SocketAddr) -> Dir {
        if *src == self.orig {
            Dir::Orig
        } else {
            Dir::Resp
        }
    }

    /// Endpoint on the given side.
    #[inline]
    pub fn endpoint(&self, dir: Dir) -> SocketAddr {
        match dir {
            Dir::Orig => self.orig,
            Dir::Resp => self.resp,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} > {}", self.proto, self.orig, self.resp)
    }
}

/// Canonical (unordered) connection key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    lo: SocketAddr,
    hi: SocketAddr,
    proto: Transport,
}

impl ConnId {
    pub fn new(a: SocketAddr, b: SocketAddr, proto: Transport) -> Self {
        if a <= b {
            ConnId {
                lo: a,
                hi: b,
                proto,
            }
        } else {
            ConnId {
                lo: b,
                hi: a,
                proto,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn core_conn_id_symmetric() {
        let a = sa("10.0.0.1:1234");
        let b = sa("10.0.0.2:80");
        assert_eq!(
            ConnId::new(a, b, Transport::Tcp),
            ConnId::new(b, a, Transport::Tcp)
        );
        assert_ne!(
            ConnId::new(a, b, Transport::Tcp),
            ConnId::new(a, b, Transport::Udp)
        );
    }

    #[test]
    fn core_five_tuple_dir() {
        let ft = FiveTuple {
            orig: sa("10.0.0.1:1234"),
            resp: sa("10.0.0.2:80"),
            proto: Transport::Tcp,
        };
        assert_eq!(ft.dir_of(&sa("10.0.0.1:1234")), Dir::Orig);
        assert_eq!(ft.dir_of(&sa("10.0.0.2:80")), Dir::Resp);
        assert_eq!(ft.endpoint(Dir::Resp), sa("10.0.0.2:80"));
    }
}
