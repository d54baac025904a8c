//! Flow tracking.
//!
//! Routes decoded packets to per-flow state, creating flows from the port
//! registry on first sight. The table is kept in recency order so both the
//! flow cap (evict oldest) and the idle sweep work from the front. All flows
//! for a given `ConnId` land on the same worker, so the tracker itself needs
//! no synchronization.

pub mod conn;
pub mod conn_id;
pub mod pdu;
pub mod stream_buf;

use self::conn::Conn;
use self::conn_id::{ConnId, Dir, FiveTuple};
use self::pdu::{L4Pdu, Transport};
use crate::config::RuntimeConfig;
use crate::protocols::stream::ParserRegistry;
use crate::publish::Publisher;
use crate::stats::STATS;

use std::sync::Arc;

use hashlink::LinkedHashMap;

pub(crate) struct ConnTracker {
    table: LinkedHashMap<ConnId, Conn>,
    registry: Arc<ParserRegistry>,
    max_flows: usize,
    stream_buffer: usize,
    sweep_interval: u64,
    last_sweep: u64,
}

impl ConnTracker {
    pub(crate) fn new(registry: Arc<ParserRegistry>, config: &RuntimeConfig) -> Self {
        ConnTracker {
            table: LinkedHashMap::new(),
            registry,
            max_flows: config.max_flows,
            stream_buffer: config.stream_buffer,
            sweep_interval: config.sweep_interval,
            last_sweep: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    /// Routes one packet: existing flow, new flow, or drop.
    pub(crate) fn process(&mut self, pdu: L4Pdu, out: &Publisher) {
        let ts = pdu.ctxt.ts;
        if ts.saturating_sub(self.last_sweep) >= self.sweep_interval {
            self.sweep(ts, out);
        }

        let conn_id = ConnId::new(pdu.ctxt.src, pdu.ctxt.dst, pdu.ctxt.proto);
        // take the entry out of the table while processing; re-inserting at
        // the back keeps the table ordered by recency
        let mut conn = match self.table.remove(&conn_id) {
            Some(conn) => conn,
            None => match self.new_conn(&pdu) {
                Some(conn) => conn,
                None => {
                    STATS.pkts_dropped_noflow.inc();
                    return;
                }
            },
        };

        let remove = conn.update(pdu, out);
        if !remove {
            if self.table.len() >= self.max_flows {
                if let Some((_, mut oldest)) = self.table.pop_front() {
                    STATS.flows_evicted.inc();
                    oldest.terminate(ts, out);
                }
            }
            self.table.insert(conn_id, conn);
        }
    }

    /// Binds a new flow from the port table: destination port first, then
    /// source port with reversed orientation.
    fn new_conn(&self, pdu: &L4Pdu) -> Option<Conn> {
        let transport = pdu.ctxt.proto;
        let (proto, client_dir) =
            if let Some(p) = self.registry.lookup(transport, pdu.ctxt.dst.port()) {
                (p, Dir::Orig)
            } else if let Some(p) = self.registry.lookup(transport, pdu.ctxt.src.port()) {
                (p, Dir::Resp)
            } else {
                return None;
            };

        let five_tuple = FiveTuple::from_ctxt(&pdu.ctxt);
        let parser = self.registry.new_flow(proto, client_dir);
        let conn = match transport {
            Transport::Tcp => Conn::new_tcp(
                five_tuple,
                proto,
                parser,
                self.stream_buffer,
                pdu.ctxt.ts,
            ),
            Transport::Udp => Conn::new_udp(five_tuple, proto, parser, pdu.ctxt.ts),
        };
        Some(conn)
    }

    /// Expires idle flows and flushes per-flow pending transactions.
    pub(crate) fn sweep(&mut self, now: u64, out: &Publisher) {
        self.last_sweep = now;

        let expired: Vec<ConnId> = self
            .table
            .iter()
            .filter(|(_, conn)| {
                now.saturating_sub(conn.last_seen) >= self.registry.connection_timeout(conn.proto)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(mut conn) = self.table.remove(&id) {
                STATS.flows_timeout.inc();
                conn.terminate(now, out);
            }
        }

        for (_, conn) in self.table.iter_mut() {
            conn.expire_pending(now, out);
        }
    }

    /// Shutdown drain: fin every live flow in both directions.
    pub(crate) fn drain(&mut self, now: u64, out: &Publisher) {
        while let Some((_, mut conn)) = self.table.pop_front() {
            conn.terminate(now, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::conntrack::pdu::L4Context;
    use crate::protocols::packet::tcp::{ACK, FIN, SYN};

    use crossbeam_channel::Receiver;
    use serde_json::Value;

    fn setup(config: Config) -> (ConnTracker, Publisher, Receiver<Value>) {
        let registry = Arc::new(ParserRegistry::new(&config).unwrap());
        let tracker = ConnTracker::new(registry, &config.runtime);
        let (tx, rx) = crossbeam_channel::bounded(1024);
        (tracker, Publisher::new(tx, 1), rx)
    }

    fn tcp_pdu(src: &str, dst: &str, seq: u32, flags: u8, ts: u64, payload: &[u8]) -> L4Pdu {
        L4Pdu {
            ctxt: L4Context {
                ts,
                src: src.parse().unwrap(),
                dst: dst.parse().unwrap(),
                proto: Transport::Tcp,
                seq_no: seq,
                flags,
            },
            payload: payload.to_vec(),
        }
    }

    const CLIENT: &str = "10.0.0.1:50000";
    const SERVER: &str = "10.0.0.2:80";

    #[test]
    fn core_tracker_http_flow_lifecycle() {
        let (mut tracker, publisher, rx) = setup(Config::default());

        tracker.process(tcp_pdu(CLIENT, SERVER, 100, SYN, 1, b""), &publisher);
        assert_eq!(tracker.len(), 1);
        tracker.process(
            tcp_pdu(SERVER, CLIENT, 500, SYN | ACK, 2, b""),
            &publisher,
        );
        tracker.process(
            tcp_pdu(CLIENT, SERVER, 101, ACK, 3, b"GET /x HTTP/1.1\r\n\r\n"),
            &publisher,
        );
        tracker.process(
            tcp_pdu(
                SERVER,
                CLIENT,
                501,
                ACK,
                10,
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            ),
            &publisher,
        );

        let events: Vec<Value> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "http");
        assert_eq!(events[0]["path"], "/x");
        assert_eq!(events[0]["responsetime"], 7);

        // both FINs destroy the flow
        tracker.process(tcp_pdu(CLIENT, SERVER, 120, FIN | ACK, 20, b""), &publisher);
        assert_eq!(tracker.len(), 1);
        tracker.process(tcp_pdu(SERVER, CLIENT, 540, FIN | ACK, 21, b""), &publisher);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn core_tracker_drops_unknown_port() {
        let (mut tracker, publisher, _rx) = setup(Config::default());
        let before = STATS.pkts_dropped_noflow.get();
        tracker.process(
            tcp_pdu("10.0.0.1:50000", "10.0.0.2:4444", 1, SYN, 1, b""),
            &publisher,
        );
        assert_eq!(tracker.len(), 0);
        assert_eq!(STATS.pkts_dropped_noflow.get(), before + 1);
    }

    #[test]
    fn core_tracker_source_port_binding_reversed() {
        let (mut tracker, publisher, rx) = setup(Config::default());

        // first observed packet is the server's (e.g. capture started
        // mid-connection); source port matches, binding reversed
        tracker.process(
            tcp_pdu(
                SERVER,
                CLIENT,
                500,
                ACK,
                1,
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            ),
            &publisher,
        );
        tracker.process(
            tcp_pdu(CLIENT, SERVER, 100, ACK, 2, b"GET /late HTTP/1.1\r\n\r\n"),
            &publisher,
        );
        // the response arrived before its request; the flow exists, bound
        // reversed, and survives for the next exchange
        tracker.process(
            tcp_pdu(
                SERVER,
                CLIENT,
                538,
                ACK,
                3,
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
            ),
            &publisher,
        );

        let events: Vec<Value> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["direction"], "out");
        assert_eq!(events[0]["path"], "/late");
    }

    #[test]
    fn core_tracker_gap_drops_mysql_flow() {
        let (mut tracker, publisher, _rx) = setup(Config::default());
        let server = "10.0.0.2:3306";

        tracker.process(tcp_pdu(CLIENT, server, 100, SYN, 1, b""), &publisher);
        // frame: COM_QUERY "SELECT 1"
        let mut q = vec![9, 0, 0, 0, 3];
        q.extend_from_slice(b"SELECT 1");
        tracker.process(tcp_pdu(CLIENT, server, 101, ACK, 2, &q), &publisher);
        assert_eq!(tracker.len(), 1);

        // jump far ahead in sequence space: gap, mysql drops the flow
        tracker.process(tcp_pdu(CLIENT, server, 500, ACK, 3, b"garbage"), &publisher);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn core_tracker_retransmission_trimmed() {
        let (mut tracker, publisher, rx) = setup(Config::default());

        tracker.process(tcp_pdu(CLIENT, SERVER, 100, SYN, 1, b""), &publisher);
        tracker.process(
            tcp_pdu(CLIENT, SERVER, 101, ACK, 2, b"GET /r HTTP/1.1\r\n"),
            &publisher,
        );
        // retransmit the same segment plus the terminating blank line
        tracker.process(
            tcp_pdu(CLIENT, SERVER, 101, ACK, 3, b"GET /r HTTP/1.1\r\n\r\n"),
            &publisher,
        );
        tracker.process(
            tcp_pdu(
                SERVER,
                CLIENT,
                1,
                ACK,
                4,
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            ),
            &publisher,
        );

        let events: Vec<Value> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["path"], "/r");
    }

    #[test]
    fn core_tracker_flow_cap_evicts_oldest() {
        let mut config = Config::default();
        config.runtime.max_flows = 2;
        let (mut tracker, publisher, _rx) = setup(config);

        for i in 0..3u32 {
            let src = format!("10.0.0.1:{}", 50000 + i);
            tracker.process(tcp_pdu(&src, SERVER, 100, SYN, i as u64 + 1, b""), &publisher);
        }
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn core_tracker_idle_sweep_expires_flow() {
        let mut config = Config::default();
        config.protocols.dns.as_mut().unwrap().transaction_timeout = 2_000;
        let (mut tracker, publisher, rx) = setup(config);

        let query = {
            // minimal dns query, id 1
            let mut m = vec![0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
            m.extend_from_slice(&[1, b'x', 0x00, 0x00, 0x01, 0x00, 0x01]);
            m
        };
        let pdu = L4Pdu {
            ctxt: L4Context {
                ts: 1_000,
                src: CLIENT.parse().unwrap(),
                dst: "10.0.0.2:53".parse().unwrap(),
                proto: Transport::Udp,
                seq_no: 0,
                flags: 0,
            },
            payload: query,
        };
        tracker.process(pdu, &publisher);
        assert_eq!(tracker.len(), 1);

        tracker.sweep(10_000, &publisher);
        assert_eq!(tracker.len(), 0);

        let events: Vec<Value> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "dns");
        assert_eq!(events[0]["status"], "Error");
        assert_eq!(events[0]["notes"][0], "no response");
    }
}
