//! DNS parser and query/response correlator.
//!
//! Over UDP each datagram is one message; over TCP messages carry a 2-byte
//! length prefix. Queries and responses are paired by `(flow, dns.id)`. A
//! query that never sees its response is published on expiry with status
//! Error and a `no response` note.

use crate::config::DnsConfig;
use crate::conntrack::conn_id::Dir;
use crate::conntrack::stream_buf::StreamBuf;
use crate::protocols::stream::{L7Parser, ParseCtx, ParseVerdict};
use crate::protocols::ProtocolId;
use crate::publish::{Record, Status};
use crate::stats::STATS;
use crate::transactions::PendingMap;

use std::sync::Arc;

use dns_parser::{Opcode, Packet, RData, ResponseCode};
use serde_json::{json, Map, Value};

const NOTE_NO_RESPONSE: &str = "no response";
const NOTE_NO_REQUEST: &str = "no request seen for this response";
const NOTE_DROPPED_OVERFLOW: &str = "dropped (overflow)";

/// Parsed summary of one DNS message, enough to build a record from.
#[derive(Debug)]
struct DnsMessage {
    ts: u64,
    qname: String,
    query: String,
    opcode: String,
    rcode: Option<String>,
    is_response: bool,
    size: u64,
    sub: Map<String, Value>,
}

#[derive(Debug)]
pub(crate) struct DnsFlow {
    cfg: Arc<DnsConfig>,
    client_dir: Dir,
    pending: PendingMap<u16, DnsMessage>,
    fins: [bool; 2],
}

impl DnsFlow {
    pub(crate) fn new(cfg: Arc<DnsConfig>, client_dir: Dir) -> Self {
        let max_pending = cfg.max_pending;
        DnsFlow {
            cfg,
            client_dir,
            pending: PendingMap::new(max_pending),
            fins: [false, false],
        }
    }

    pub(crate) fn parse_udp(&mut self, ctx: &ParseCtx, _dir: Dir, payload: &[u8]) {
        self.handle_message(ctx, payload);
    }

    fn handle_message(&mut self, ctx: &ParseCtx, payload: &[u8]) {
        let pkt = match Packet::parse(payload) {
            Ok(pkt) => pkt,
            Err(e) => {
                STATS.protocol(ProtocolId::Dns).parse_errors.inc();
                log::debug!("{}: bad dns message: {}", ctx.five_tuple, e);
                return;
            }
        };
        let id = pkt.header.id;
        let msg = summarize(&self.cfg, ctx.ts, payload.len() as u64, &pkt);

        if msg.is_response {
            match self.pending.remove(&id) {
                Some((_, req)) => self.emit(ctx, Some(req), Some(msg), None),
                None => self.emit(ctx, None, Some(msg), Some(NOTE_NO_REQUEST)),
            }
        } else if let Some((_, _, evicted)) = self.pending.insert(id, ctx.ts, msg) {
            STATS.protocol(ProtocolId::Dns).overflows.inc();
            self.emit(ctx, Some(evicted), None, Some(NOTE_DROPPED_OVERFLOW));
        }
    }

    /// Builds and publishes one record from a request, a response, or both.
    fn emit(
        &self,
        ctx: &ParseCtx,
        req: Option<DnsMessage>,
        resp: Option<DnsMessage>,
        note: Option<&str>,
    ) {
        let ts = req.as_ref().or(resp.as_ref()).map(|m| m.ts).unwrap_or(ctx.ts);
        let mut rec = Record::new(ProtocolId::Dns, ts);
        rec.endpoints(ctx.five_tuple, self.client_dir);

        // the response carries the richer detail; fall back to the request
        let detail = resp.as_ref().or(req.as_ref()).unwrap();
        rec.path(&detail.qname);
        rec.set("method", detail.opcode.as_str());
        rec.set("query", detail.query.as_str());
        rec.set("resource", detail.qname.as_str());
        rec.sub(detail.sub.clone());

        if let Some(req) = &req {
            rec.set("bytes_in", req.size);
        }
        match &resp {
            Some(resp) => {
                rec.set("bytes_out", resp.size);
                let ok = resp.rcode.as_deref() == Some("NOERROR");
                rec.status(if ok { Status::Ok } else { Status::Error });
                if let Some(req) = &req {
                    rec.responsetime(req.ts, resp.ts);
                }
            }
            None => rec.status(Status::Error),
        }
        if let Some(n) = note {
            rec.note(n);
        }
        if self.cfg.send_request {
            if let Some(req) = &req {
                rec.set("request", req.query.as_str());
            }
        }
        if self.cfg.send_response {
            if let Some(resp) = &resp {
                rec.set("response", resp.query.as_str());
            }
        }
        ctx.out.publish(rec);
    }

    fn flush(&mut self, ctx: &ParseCtx) {
        for (_, _, req) in self.pending.drain() {
            STATS.protocol(ProtocolId::Dns).timeouts.inc();
            self.emit(ctx, Some(req), None, Some(NOTE_NO_RESPONSE));
        }
    }
}

fn opcode_str(op: Opcode) -> String {
    match op {
        Opcode::StandardQuery => "QUERY".into(),
        Opcode::InverseQuery => "IQUERY".into(),
        Opcode::ServerStatusRequest => "STATUS".into(),
        Opcode::Reserved(n) => n.to_string(),
    }
}

fn rcode_str(rc: ResponseCode) -> String {
    match rc {
        ResponseCode::NoError => "NOERROR".into(),
        ResponseCode::FormatError => "FORMERR".into(),
        ResponseCode::ServerFailure => "SERVFAIL".into(),
        ResponseCode::NameError => "NXDOMAIN".into(),
        ResponseCode::NotImplemented => "NOTIMP".into(),
        ResponseCode::Refused => "REFUSED".into(),
        ResponseCode::Reserved(n) => n.to_string(),
    }
}

fn rdata_fields(data: &RData) -> (&'static str, String) {
    match data {
        RData::A(a) => ("A", a.0.to_string()),
        RData::AAAA(a) => ("AAAA", a.0.to_string()),
        RData::CNAME(c) => ("CNAME", c.0.to_string()),
        RData::MX(m) => ("MX", format!("{} {}", m.preference, m.exchange)),
        RData::NS(n) => ("NS", n.0.to_string()),
        RData::PTR(p) => ("PTR", p.0.to_string()),
        RData::SOA(s) => ("SOA", format!("{} {} {}", s.primary_ns, s.mailbox, s.serial)),
        RData::SRV(s) => (
            "SRV",
            format!("{} {} {} {}", s.priority, s.weight, s.port, s.target),
        ),
        RData::TXT(_) => ("TXT", String::new()),
        _ => ("UNKNOWN", String::new()),
    }
}

fn rr_array(records: &[dns_parser::ResourceRecord]) -> Vec<Value> {
    records
        .iter()
        .map(|rr| {
            let (rtype, data) = rdata_fields(&rr.data);
            json!({
                "name": rr.name.to_string(),
                "type": rtype,
                "class": format!("{:?}", rr.cls),
                "ttl": rr.ttl,
                "data": data,
            })
        })
        .collect()
}

fn summarize(cfg: &DnsConfig, ts: u64, size: u64, pkt: &Packet) -> DnsMessage {
    let header = &pkt.header;
    let mut sub = Map::new();
    sub.insert("id".into(), json!(header.id));
    sub.insert("op_code".into(), Value::String(opcode_str(header.opcode)));
    sub.insert(
        "flags".into(),
        json!({
            "authoritative": header.authoritative,
            "truncated_response": header.truncated,
            "recursion_desired": header.recursion_desired,
            "recursion_available": header.recursion_available,
            "authentic_data": header.authenticated_data,
            "checking_disabled": header.checking_disabled,
        }),
    );

    let (qname, query) = match pkt.questions.first() {
        Some(q) => {
            let name = q.qname.to_string();
            sub.insert(
                "question".into(),
                json!({
                    "name": name,
                    "type": format!("{:?}", q.qtype),
                    "class": format!("{:?}", q.qclass),
                }),
            );
            let query = format!("class {:?}, type {:?}, {}", q.qclass, q.qtype, name);
            (name, query)
        }
        None => (String::new(), String::new()),
    };

    let is_response = !header.query;
    let mut rcode = None;
    if is_response {
        let rc = rcode_str(header.response_code);
        sub.insert("response_code".into(), Value::String(rc.clone()));
        rcode = Some(rc);
        sub.insert("answers_count".into(), json!(pkt.answers.len()));
        if !pkt.answers.is_empty() {
            sub.insert("answers".into(), Value::Array(rr_array(&pkt.answers)));
        }
        if cfg.include_authorities {
            sub.insert("authorities_count".into(), json!(pkt.nameservers.len()));
            if !pkt.nameservers.is_empty() {
                sub.insert("authorities".into(), Value::Array(rr_array(&pkt.nameservers)));
            }
        }
        if cfg.include_additionals {
            sub.insert("additionals_count".into(), json!(pkt.additional.len()));
            if !pkt.additional.is_empty() {
                sub.insert("additionals".into(), Value::Array(rr_array(&pkt.additional)));
            }
        }
    }

    DnsMessage {
        ts,
        qname,
        query,
        opcode: opcode_str(header.opcode),
        rcode,
        is_response,
        size,
        sub,
    }
}

impl L7Parser for DnsFlow {
    /// TCP transport: each message is preceded by a 2-byte length.
    fn parse(&mut self, ctx: &ParseCtx, dir: Dir, buf: &mut StreamBuf) -> ParseVerdict {
        let _ = dir;
        let len = match buf.read_u16_be(0) {
            Some(len) => len as usize,
            None => return ParseVerdict::NeedMore,
        };
        if len > self.cfg.max_message_size {
            STATS.protocol(ProtocolId::Dns).parse_errors.inc();
            return ParseVerdict::Drop;
        }
        if buf.len() < 2 + len {
            return ParseVerdict::NeedMore;
        }
        let payload = buf.data()[2..2 + len].to_vec();
        buf.consume(2 + len);
        self.handle_message(ctx, &payload);
        ParseVerdict::Progress
    }

    fn fin(&mut self, ctx: &ParseCtx, dir: Dir) {
        self.fins[dir.idx()] = true;
        if self.fins[0] && self.fins[1] {
            self.flush(ctx);
        }
    }

    fn gap(&mut self, _ctx: &ParseCtx, _dir: Dir, _nbytes: u32) -> bool {
        STATS.protocol(ProtocolId::Dns).gaps.inc();
        true
    }

    fn expire(&mut self, ctx: &ParseCtx, now: u64) {
        let timeout = self.cfg.transaction_timeout;
        for (_, _, req) in self.pending.expire(now, timeout) {
            STATS.protocol(ProtocolId::Dns).timeouts.inc();
            self.emit(ctx, Some(req), None, Some(NOTE_NO_RESPONSE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::stream::testutil::Harness;

    /// Hand-built query for `www.google.com A`, id 0x1234.
    fn query_bytes() -> Vec<u8> {
        let mut m = vec![
            0x12, 0x34, // id
            0x01, 0x00, // flags: rd
            0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in ["www", "google", "com"] {
            m.push(label.len() as u8);
            m.extend_from_slice(label.as_bytes());
        }
        m.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01]); // root, A, IN
        m
    }

    /// Matching response with one A record 1.2.3.4.
    fn response_bytes() -> Vec<u8> {
        let mut m = vec![
            0x12, 0x34, // id
            0x81, 0x80, // qr, rd, ra, rcode 0
            0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in ["www", "google", "com"] {
            m.push(label.len() as u8);
            m.extend_from_slice(label.as_bytes());
        }
        m.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01]);
        // answer: pointer to offset 12, A IN ttl 300 rdlen 4
        m.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01, 0x2c]);
        m.extend_from_slice(&[0x00, 0x04, 1, 2, 3, 4]);
        m
    }

    fn flow() -> DnsFlow {
        DnsFlow::new(Arc::new(DnsConfig::default()), Dir::Orig)
    }

    #[test]
    fn core_dns_query_response() {
        let h = Harness::new(53);
        let mut f = flow();

        f.parse_udp(&h.ctx(1_000), Dir::Orig, &query_bytes());
        assert!(h.events().is_empty());
        f.parse_udp(&h.ctx(1_040), Dir::Resp, &response_bytes());

        let events = h.events();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e["type"], "dns");
        assert_eq!(e["status"], "OK");
        assert_eq!(e["method"], "QUERY");
        assert_eq!(e["path"], "www.google.com");
        assert_eq!(e["dns"]["id"], 0x1234);
        assert_eq!(e["dns"]["question"]["name"], "www.google.com");
        assert_eq!(e["dns"]["answers_count"], 1);
        assert_eq!(e["dns"]["answers"][0]["data"], "1.2.3.4");
        assert_eq!(e["responsetime"], 40);
    }

    #[test]
    fn core_dns_orphan_request_times_out() {
        let h = Harness::new(53);
        let mut f = flow();

        f.parse_udp(&h.ctx(1_000), Dir::Orig, &query_bytes());
        f.expire(&h.ctx(12_000), 12_000);

        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["status"], "Error");
        assert_eq!(events[0]["notes"][0], NOTE_NO_RESPONSE);
        assert_eq!(events[0]["dns"]["id"], 0x1234);
    }

    #[test]
    fn core_dns_orphan_response_noted() {
        let h = Harness::new(53);
        let mut f = flow();
        f.parse_udp(&h.ctx(500), Dir::Resp, &response_bytes());
        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["notes"][0], NOTE_NO_REQUEST);
    }

    #[test]
    fn core_dns_tcp_length_framing() {
        let h = Harness::new(53);
        let mut f = flow();
        let mut buf = StreamBuf::new(64 * 1024);

        let q = query_bytes();
        let mut framed = (q.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&q);
        // deliver split to exercise restartability
        assert!(buf.push(&framed[..3]));
        assert_eq!(
            f.parse(&h.ctx(1), Dir::Orig, &mut buf),
            ParseVerdict::NeedMore
        );
        assert!(buf.push(&framed[3..]));
        assert_eq!(
            f.parse(&h.ctx(1), Dir::Orig, &mut buf),
            ParseVerdict::Progress
        );
        assert!(buf.is_empty());
        assert_eq!(f.pending.len(), 1);
    }

    #[test]
    fn core_dns_flush_on_close() {
        let h = Harness::new(53);
        let mut f = flow();
        f.parse_udp(&h.ctx(1_000), Dir::Orig, &query_bytes());
        f.fin(&h.ctx(2_000), Dir::Orig);
        assert!(h.events().is_empty());
        f.fin(&h.ctx(2_000), Dir::Resp);
        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["notes"][0], NOTE_NO_RESPONSE);
    }
}
