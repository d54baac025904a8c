//! Per-flow state and TCP stream reassembly.
//!
//! One [`Conn`] exists per tracked flow and owns the protocol parser state.
//! TCP payload is stitched into per-direction stream buffers: in-sequence
//! bytes are appended and fed to the parser, sequence jumps become gap
//! callbacks (the parser decides whether the flow survives), and overlapping
//! retransmissions are trimmed. All callbacks for one flow run on one worker,
//! strictly in capture order.

use crate::conntrack::conn_id::{Dir, FiveTuple};
use crate::conntrack::pdu::L4Pdu;
use crate::conntrack::stream_buf::StreamBuf;
use crate::protocols::packet::tcp::{FIN, RST, SYN};
use crate::protocols::stream::{FlowParser, ParseCtx, ParseVerdict};
use crate::protocols::ProtocolId;
use crate::publish::Publisher;
use crate::stats::STATS;

/// `true` if `lhs` precedes `rhs` in sequence space.
#[inline]
pub(crate) fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    (lhs.wrapping_sub(rhs) as i32) < 0
}

#[derive(Debug)]
struct TcpHalf {
    next_seq: Option<u32>,
    fin: bool,
    buf: StreamBuf,
}

impl TcpHalf {
    fn new(cap: usize) -> Self {
        TcpHalf {
            next_seq: None,
            fin: false,
            buf: StreamBuf::new(cap),
        }
    }
}

#[derive(Debug)]
pub(crate) struct TcpConn {
    halves: [TcpHalf; 2],
}

impl TcpConn {
    fn new(cap: usize) -> Self {
        TcpConn {
            halves: [TcpHalf::new(cap), TcpHalf::new(cap)],
        }
    }
}

#[derive(Debug)]
pub(crate) enum L4Conn {
    Tcp(TcpConn),
    Udp,
}

#[derive(Debug)]
pub(crate) struct Conn {
    pub(crate) five_tuple: FiveTuple,
    pub(crate) proto: ProtocolId,
    /// Timestamp of the most recent packet, packet time.
    pub(crate) last_seen: u64,
    l4: L4Conn,
    parser: FlowParser,
}

impl Conn {
    pub(crate) fn new_tcp(
        five_tuple: FiveTuple,
        proto: ProtocolId,
        parser: FlowParser,
        stream_cap: usize,
        ts: u64,
    ) -> Self {
        Conn {
            five_tuple,
            proto,
            last_seen: ts,
            l4: L4Conn::Tcp(TcpConn::new(stream_cap)),
            parser,
        }
    }

    pub(crate) fn new_udp(
        five_tuple: FiveTuple,
        proto: ProtocolId,
        parser: FlowParser,
        ts: u64,
    ) -> Self {
        Conn {
            five_tuple,
            proto,
            last_seen: ts,
            l4: L4Conn::Udp,
            parser,
        }
    }

    /// Feeds one packet through reassembly and parsing. Returns true when
    /// the flow should be removed from the table.
    pub(crate) fn update(&mut self, pdu: L4Pdu, out: &Publisher) -> bool {
        self.last_seen = pdu.ctxt.ts;
        let five_tuple = self.five_tuple;
        let ctx = ParseCtx {
            five_tuple: &five_tuple,
            ts: pdu.ctxt.ts,
            out,
        };
        match self.l4 {
            L4Conn::Tcp(_) => self.handle_tcp(&ctx, pdu),
            L4Conn::Udp => {
                let dir = self.five_tuple.dir_of(&pdu.ctxt.src);
                self.parser.parse_udp(&ctx, dir, &pdu.payload);
                false
            }
        }
    }

    fn handle_tcp(&mut self, ctx: &ParseCtx, pdu: L4Pdu) -> bool {
        let dir = self.five_tuple.dir_of(&pdu.ctxt.src);
        let flags = pdu.ctxt.flags;

        if flags & RST != 0 {
            self.parser.fin(ctx, Dir::Orig);
            self.parser.fin(ctx, Dir::Resp);
            return true;
        }

        let tcp = match &mut self.l4 {
            L4Conn::Tcp(tcp) => tcp,
            L4Conn::Udp => return false,
        };
        let half = &mut tcp.halves[dir.idx()];
        let mut seq = pdu.ctxt.seq_no;

        if flags & SYN != 0 {
            half.next_seq = Some(seq.wrapping_add(1));
        }

        let mut payload: &[u8] = &pdu.payload;
        if !payload.is_empty() {
            match half.next_seq {
                None => {
                    // picked up mid-stream; anchor here
                    half.next_seq = Some(seq);
                }
                Some(expected) if seq == expected => {}
                Some(expected) if wrapping_lt(expected, seq) => {
                    // hole in the sequence space
                    let nbytes = seq.wrapping_sub(expected);
                    if self.parser.gap(ctx, dir, nbytes) {
                        return true;
                    }
                    half.next_seq = Some(seq);
                }
                Some(expected) => {
                    // retransmission or overlap: trim the replayed prefix
                    let overlap = expected.wrapping_sub(seq) as usize;
                    if overlap >= payload.len() {
                        payload = &[];
                    } else {
                        payload = &payload[overlap..];
                        seq = expected;
                    }
                }
            }

            if !payload.is_empty() {
                if !half.buf.push(payload) {
                    // stream buffer cap exceeded; the flow is unparseable
                    STATS.protocol(self.proto).parse_errors.inc();
                    log::debug!("{}: stream buffer overflow", self.five_tuple);
                    return true;
                }
                half.next_seq = Some(seq.wrapping_add(payload.len() as u32));

                loop {
                    match self.parser.parse(ctx, dir, &mut half.buf) {
                        ParseVerdict::Progress => continue,
                        ParseVerdict::NeedMore => break,
                        ParseVerdict::Drop => return true,
                    }
                }
            }
        }

        if flags & FIN != 0 && !half.fin {
            // bytes lost right before the FIN still count as a gap
            let end_seq = pdu.ctxt.seq_no.wrapping_add(pdu.payload.len() as u32);
            if let Some(expected) = half.next_seq {
                if wrapping_lt(expected, end_seq) {
                    let nbytes = end_seq.wrapping_sub(expected);
                    if self.parser.gap(ctx, dir, nbytes) {
                        return true;
                    }
                    half.next_seq = Some(end_seq);
                }
            }
            half.fin = true;
            if let Some(next) = half.next_seq {
                half.next_seq = Some(next.wrapping_add(1));
            }
            self.parser.fin(ctx, dir);
            if tcp.halves[0].fin && tcp.halves[1].fin {
                return true;
            }
        }
        false
    }

    /// Flushes timed-out pending transactions without tearing the flow down.
    pub(crate) fn expire_pending(&mut self, now: u64, out: &Publisher) {
        let five_tuple = self.five_tuple;
        let ctx = ParseCtx {
            five_tuple: &five_tuple,
            ts: now,
            out,
        };
        self.parser.expire(&ctx, now);
    }

    /// Connection teardown: fin both directions so parsers can emit whatever
    /// is still in flight.
    pub(crate) fn terminate(&mut self, now: u64, out: &Publisher) {
        let five_tuple = self.five_tuple;
        let ctx = ParseCtx {
            five_tuple: &five_tuple,
            ts: now,
            out,
        };
        self.parser.fin(&ctx, Dir::Orig);
        self.parser.fin(&ctx, Dir::Resp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_wrapping_lt() {
        assert!(wrapping_lt(1, 2));
        assert!(!wrapping_lt(2, 1));
        assert!(wrapping_lt(u32::MAX, 1)); // across the wrap point
        assert!(!wrapping_lt(1, u32::MAX));
    }
}
