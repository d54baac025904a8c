//! PostgreSQL frontend/backend protocol parser.
//!
//! Messages are 1-byte type + 4-byte big-endian length (length includes
//! itself). The untyped startup phase (StartupMessage, SSLRequest) is walked
//! but produces no transactions; an SSL-accepting server makes the rest of
//! the flow unparseable and drops it. A transaction opens on `Q` (simple
//! query) or `P` (extended-protocol parse) and closes on ReadyForQuery.

use crate::config::PgsqlConfig;
use crate::conntrack::conn_id::Dir;
use crate::conntrack::stream_buf::StreamBuf;
use crate::protocols::stream::{L7Parser, ParseCtx, ParseVerdict};
use crate::protocols::ProtocolId;
use crate::publish::{Record, Status};
use crate::stats::STATS;
use crate::transactions::PendingQueue;

use std::sync::Arc;

use byteorder::{ByteOrder, NetworkEndian};
use serde_json::{json, Map};

const NOTE_NO_RESPONSE: &str = "no response";
const NOTE_DROPPED_OVERFLOW: &str = "dropped (overflow)";

const SSL_REQUEST_CODE: u32 = 80877103;
const PROTOCOL_V3: u32 = 196608;

const FRONTEND_TYPES: &[u8] = b"QPBEDSCHFXpfdc";

#[derive(Debug)]
struct PgsqlRequest {
    ts: u64,
    method: String,
    query: String,
    size: u64,
}

#[derive(Debug, Default)]
struct PgsqlResponse {
    size: u64,
    num_fields: u64,
    num_rows: u64,
    is_error: bool,
    error_severity: String,
    error_code: String,
    error_message: String,
    command_tag: String,
    rows: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct PgsqlFlow {
    cfg: Arc<PgsqlConfig>,
    client_dir: Dir,
    pending: PendingQueue<PgsqlRequest>,
    resp: Option<PgsqlResponse>,
    startup_done: bool,
    ssl_requested: bool,
    ssl_answered: bool,
    fins: [bool; 2],
}

impl PgsqlFlow {
    pub(crate) fn new(cfg: Arc<PgsqlConfig>, client_dir: Dir) -> Self {
        let max_pending = cfg.max_pending;
        PgsqlFlow {
            cfg,
            client_dir,
            pending: PendingQueue::new(max_pending),
            resp: None,
            startup_done: false,
            ssl_requested: false,
            ssl_answered: false,
            fins: [false, false],
        }
    }

    /// Handles the untyped startup phase. Returns the verdict, or None when
    /// the startup phase is over and typed parsing should proceed.
    fn parse_startup(&mut self, buf: &mut StreamBuf, from_client: bool) -> Option<ParseVerdict> {
        if self.startup_done {
            return None;
        }
        if from_client {
            // attached mid-stream: a typed frontend byte means no startup
            if let Some(first) = buf.peek_u8(0) {
                if FRONTEND_TYPES.contains(&first) {
                    self.startup_done = true;
                    return None;
                }
            }
            let len = match buf.read_u32_be(0) {
                Some(len) => len as usize,
                None => return Some(ParseVerdict::NeedMore),
            };
            if len < 8 || len > self.cfg.max_message_size {
                STATS.protocol(ProtocolId::Pgsql).parse_errors.inc();
                return Some(ParseVerdict::Drop);
            }
            if buf.len() < len {
                return Some(ParseVerdict::NeedMore);
            }
            let code = match buf.read_u32_be(4) {
                Some(code) => code,
                None => return Some(ParseVerdict::NeedMore),
            };
            buf.consume(len);
            match code {
                SSL_REQUEST_CODE => self.ssl_requested = true,
                PROTOCOL_V3 => self.startup_done = true,
                _ => self.startup_done = true,
            }
            Some(ParseVerdict::Progress)
        } else {
            if self.ssl_requested && !self.ssl_answered {
                let answer = match buf.peek_u8(0) {
                    Some(b) => b,
                    None => return Some(ParseVerdict::NeedMore),
                };
                buf.consume(1);
                self.ssl_answered = true;
                if answer == b'S' {
                    // connection upgrades to TLS; nothing more to parse
                    return Some(ParseVerdict::Drop);
                }
                return Some(ParseVerdict::Progress);
            }
            // backend messages are typed from the first byte
            self.startup_done = true;
            None
        }
    }

    fn handle_frontend(&mut self, ctx: &ParseCtx, msg_type: u8, payload: &[u8], size: u64) {
        match msg_type {
            b'Q' => {
                let query = cstring_at(payload, 0);
                self.push_request(ctx, query, size);
            }
            b'P' => {
                // Parse: statement name, then query
                let name = cstring_at(payload, 0);
                let query = cstring_at(payload, name.len() + 1);
                self.push_request(ctx, query, size);
            }
            // bind/execute/sync/describe and the copy sub-protocol carry no
            // query text of their own
            _ => {}
        }
    }

    fn push_request(&mut self, ctx: &ParseCtx, query: String, size: u64) {
        let req = PgsqlRequest {
            ts: ctx.ts,
            method: query
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_ascii_uppercase(),
            query,
            size,
        };
        if let Some((_, evicted)) = self.pending.push(ctx.ts, req) {
            STATS.protocol(ProtocolId::Pgsql).overflows.inc();
            self.emit(ctx, evicted, None, Some(NOTE_DROPPED_OVERFLOW));
        }
    }

    fn handle_backend(&mut self, ctx: &ParseCtx, msg_type: u8, payload: &[u8], size: u64) {
        if self.pending.is_empty() {
            // authentication phase or async notice
            return;
        }
        let max_rows = self.cfg.max_rows;
        let max_row_length = self.cfg.max_row_length;
        let resp = self.resp.get_or_insert_with(PgsqlResponse::default);
        resp.size += size;

        match msg_type {
            b'T' => {
                if payload.len() >= 2 {
                    resp.num_fields = NetworkEndian::read_u16(&payload[..2]) as u64;
                }
            }
            b'D' => {
                resp.num_rows += 1;
                if resp.rows.len() < max_rows {
                    resp.rows.push(render_data_row(payload, max_row_length));
                }
            }
            b'C' => {
                resp.command_tag = cstring_at(payload, 0);
            }
            b'E' => {
                resp.is_error = true;
                let mut offset = 0;
                while offset < payload.len() && payload[offset] != 0 {
                    let field = payload[offset];
                    let rest = &payload[offset + 1..];
                    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                    let value = String::from_utf8_lossy(&rest[..end]).into_owned();
                    offset += 1 + end + 1;
                    match field {
                        b'S' => resp.error_severity = value,
                        b'C' => resp.error_code = value,
                        b'M' => resp.error_message = value,
                        _ => {}
                    }
                }
            }
            b'Z' => {
                // ReadyForQuery closes the transaction
                let resp = self.resp.take();
                if let Some((_, req)) = self.pending.pop() {
                    self.emit(ctx, req, resp, None);
                }
            }
            _ => {}
        }
    }

    fn emit(
        &self,
        ctx: &ParseCtx,
        req: PgsqlRequest,
        resp: Option<PgsqlResponse>,
        note: Option<&str>,
    ) {
        let mut rec = Record::new(ProtocolId::Pgsql, req.ts);
        rec.endpoints(ctx.five_tuple, self.client_dir);
        rec.set("method", req.method.as_str());
        if !req.query.is_empty() {
            rec.set("query", req.query.as_str());
        }
        rec.set("bytes_in", req.size);

        let mut sub = Map::new();
        match &resp {
            Some(resp) => {
                rec.responsetime(req.ts, ctx.ts);
                rec.set("bytes_out", resp.size);
                sub.insert("iserror".into(), json!(resp.is_error));
                if resp.is_error {
                    rec.status(Status::Error);
                    sub.insert("error_severity".into(), json!(resp.error_severity.clone()));
                    sub.insert("error_code".into(), json!(resp.error_code.clone()));
                    sub.insert("error_message".into(), json!(resp.error_message.clone()));
                } else {
                    if resp.num_fields > 0 {
                        sub.insert("num_fields".into(), json!(resp.num_fields));
                        sub.insert("num_rows".into(), json!(resp.num_rows));
                    }
                    if !resp.command_tag.is_empty() {
                        sub.insert("command_tag".into(), json!(resp.command_tag.clone()));
                    }
                    if self.cfg.send_response && !resp.rows.is_empty() {
                        rec.set("response", resp.rows.join("\n"));
                    }
                }
            }
            None => rec.status(Status::Error),
        }
        rec.sub(sub);

        if self.cfg.send_request && !req.query.is_empty() {
            rec.set("request", req.query.as_str());
        }
        if let Some(n) = note {
            rec.note(n);
        }
        ctx.out.publish(rec);
    }

    fn flush(&mut self, ctx: &ParseCtx) {
        self.resp = None;
        for (_, req) in self.pending.drain() {
            STATS.protocol(ProtocolId::Pgsql).timeouts.inc();
            self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
        }
    }
}

fn cstring_at(payload: &[u8], offset: usize) -> String {
    let slice = payload.get(offset..).unwrap_or(&[]);
    let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    String::from_utf8_lossy(&slice[..end]).into_owned()
}

/// Renders a DataRow message as a tab-joined preview.
fn render_data_row(payload: &[u8], max_len: usize) -> String {
    if payload.len() < 2 {
        return String::new();
    }
    let cols = NetworkEndian::read_u16(&payload[..2]) as usize;
    let mut out = String::new();
    let mut offset = 2;
    for i in 0..cols {
        if payload.len() < offset + 4 {
            break;
        }
        let len = NetworkEndian::read_u32(&payload[offset..offset + 4]) as i32;
        offset += 4;
        if i > 0 {
            out.push('\t');
        }
        if len < 0 {
            out.push_str("NULL");
        } else {
            let len = len as usize;
            if payload.len() < offset + len {
                break;
            }
            out.push_str(&String::from_utf8_lossy(&payload[offset..offset + len]));
            offset += len;
        }
        if out.len() >= max_len {
            out.truncate(max_len);
            break;
        }
    }
    out
}

impl L7Parser for PgsqlFlow {
    fn parse(&mut self, ctx: &ParseCtx, dir: Dir, buf: &mut StreamBuf) -> ParseVerdict {
        if buf.is_empty() {
            return ParseVerdict::NeedMore;
        }
        let from_client = dir == self.client_dir;
        if let Some(verdict) = self.parse_startup(buf, from_client) {
            return verdict;
        }

        // typed message: tag + u32 length (length covers itself)
        let msg_type = match buf.peek_u8(0) {
            Some(t) => t,
            None => return ParseVerdict::NeedMore,
        };
        let len = match buf.read_u32_be(1) {
            Some(len) => len as usize,
            None => return ParseVerdict::NeedMore,
        };
        if len < 4 || len > self.cfg.max_message_size {
            STATS.protocol(ProtocolId::Pgsql).parse_errors.inc();
            return ParseVerdict::Drop;
        }
        let total = 1 + len;
        if buf.len() < total {
            return ParseVerdict::NeedMore;
        }
        let payload = buf.data()[5..total].to_vec();
        buf.consume(total);

        if from_client {
            self.handle_frontend(ctx, msg_type, &payload, total as u64);
        } else {
            self.handle_backend(ctx, msg_type, &payload, total as u64);
        }
        ParseVerdict::Progress
    }

    fn fin(&mut self, ctx: &ParseCtx, dir: Dir) {
        self.fins[dir.idx()] = true;
        if self.fins[0] && self.fins[1] {
            self.flush(ctx);
        }
    }

    fn gap(&mut self, _ctx: &ParseCtx, _dir: Dir, _nbytes: u32) -> bool {
        STATS.protocol(ProtocolId::Pgsql).gaps.inc();
        true
    }

    fn expire(&mut self, ctx: &ParseCtx, now: u64) {
        let timeout = self.cfg.transaction_timeout;
        for (_, req) in self.pending.expire(now, timeout) {
            STATS.protocol(ProtocolId::Pgsql).timeouts.inc();
            self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::stream::testutil::{feed, Harness};

    fn msg(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut m = vec![tag];
        m.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
        m.extend_from_slice(payload);
        m
    }

    fn simple_query(q: &str) -> Vec<u8> {
        let mut p = q.as_bytes().to_vec();
        p.push(0);
        msg(b'Q', &p)
    }

    fn flow() -> (PgsqlFlow, StreamBuf, StreamBuf) {
        let mut f = PgsqlFlow::new(Arc::new(PgsqlConfig::default()), Dir::Orig);
        f.startup_done = true;
        (f, StreamBuf::new(64 * 1024), StreamBuf::new(64 * 1024))
    }

    fn data_row(values: &[&str]) -> Vec<u8> {
        let mut p = (values.len() as u16).to_be_bytes().to_vec();
        for v in values {
            p.extend_from_slice(&(v.len() as u32).to_be_bytes());
            p.extend_from_slice(v.as_bytes());
        }
        msg(b'D', &p)
    }

    #[test]
    fn core_pgsql_select_transaction() {
        let h = Harness::new(5432);
        let (mut f, mut req_buf, mut resp_buf) = flow();

        let ctx = h.ctx(100);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, &simple_query("SELECT * FROM users"));

        let mut resp = Vec::new();
        resp.extend_from_slice(&msg(b'T', &2u16.to_be_bytes())); // 2 fields
        resp.extend_from_slice(&data_row(&["1", "alice"]));
        resp.extend_from_slice(&data_row(&["2", "bob"]));
        resp.extend_from_slice(&msg(b'C', b"SELECT 2\0"));
        resp.extend_from_slice(&msg(b'Z', b"I"));
        let ctx = h.ctx(130);
        feed(&mut f, &ctx, Dir::Resp, &mut resp_buf, &resp);

        let events = h.events();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e["type"], "pgsql");
        assert_eq!(e["status"], "OK");
        assert_eq!(e["method"], "SELECT");
        assert_eq!(e["query"], "SELECT * FROM users");
        assert_eq!(e["pgsql"]["num_fields"], 2);
        assert_eq!(e["pgsql"]["num_rows"], 2);
        assert_eq!(e["pgsql"]["command_tag"], "SELECT 2");
        assert_eq!(e["responsetime"], 30);
    }

    #[test]
    fn core_pgsql_error_response() {
        let h = Harness::new(5432);
        let (mut f, mut req_buf, mut resp_buf) = flow();

        let ctx = h.ctx(1);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, &simple_query("SELECT broken"));

        let mut err = Vec::new();
        err.extend_from_slice(b"SERROR\0");
        err.extend_from_slice(b"C42703\0");
        err.extend_from_slice(b"Mcolumn \"broken\" does not exist\0");
        err.push(0);
        let mut resp = msg(b'E', &err);
        resp.extend_from_slice(&msg(b'Z', b"I"));
        let ctx = h.ctx(2);
        feed(&mut f, &ctx, Dir::Resp, &mut resp_buf, &resp);

        let events = h.events();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e["status"], "Error");
        assert_eq!(e["pgsql"]["iserror"], true);
        assert_eq!(e["pgsql"]["error_severity"], "ERROR");
        assert_eq!(e["pgsql"]["error_code"], "42703");
        assert_eq!(e["pgsql"]["error_message"], "column \"broken\" does not exist");
    }

    #[test]
    fn core_pgsql_startup_skipped() {
        let h = Harness::new(5432);
        let mut f = PgsqlFlow::new(Arc::new(PgsqlConfig::default()), Dir::Orig);
        let mut req_buf = StreamBuf::new(64 * 1024);

        // StartupMessage: len, protocol 3.0, "user\0postgres\0\0"
        let mut startup = Vec::new();
        let body = b"user\0postgres\0\0";
        startup.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
        startup.extend_from_slice(&PROTOCOL_V3.to_be_bytes());
        startup.extend_from_slice(body);

        let ctx = h.ctx(1);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, &startup);
        assert!(f.startup_done);
        assert!(h.events().is_empty());
    }

    #[test]
    fn core_pgsql_ssl_accepted_drops_flow() {
        let h = Harness::new(5432);
        let mut f = PgsqlFlow::new(Arc::new(PgsqlConfig::default()), Dir::Orig);
        let mut req_buf = StreamBuf::new(64 * 1024);
        let mut resp_buf = StreamBuf::new(64 * 1024);

        let mut ssl_req = 8u32.to_be_bytes().to_vec();
        ssl_req.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        let ctx = h.ctx(1);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, &ssl_req);
        assert!(f.ssl_requested);

        assert!(resp_buf.push(b"S"));
        assert_eq!(
            f.parse(&h.ctx(2), Dir::Resp, &mut resp_buf),
            ParseVerdict::Drop
        );
    }
}
