//! MySQL client/server protocol parser.
//!
//! Frames are 3-byte little-endian length + 1-byte sequence id + payload.
//! A client frame with sequence 0 starts a command; everything else on the
//! client side (handshake, auth continuation) is skipped. Server frames are
//! interpreted against the oldest outstanding command: OK / ERR terminate it
//! immediately, otherwise a result set (column definitions, EOF, rows, EOF)
//! is walked to completion.

use crate::config::MysqlConfig;
use crate::conntrack::conn_id::Dir;
use crate::conntrack::stream_buf::StreamBuf;
use crate::protocols::stream::{L7Parser, ParseCtx, ParseVerdict};
use crate::protocols::ProtocolId;
use crate::publish::{Record, Status};
use crate::stats::STATS;
use crate::transactions::PendingQueue;

use std::sync::Arc;

use nom::bytes::streaming::take;
use nom::number::streaming::{le_u16, le_u24, le_u64, u8 as nom_u8};
use nom::IResult;
use serde_json::{json, Map};

const NOTE_NO_RESPONSE: &str = "no response";
const NOTE_DROPPED_OVERFLOW: &str = "dropped (overflow)";

const COM_QUIT: u8 = 0x01;
const COM_INIT_DB: u8 = 0x02;
const COM_QUERY: u8 = 0x03;
const COM_FIELD_LIST: u8 = 0x04;
const COM_PING: u8 = 0x0e;
const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;
const COM_STMT_CLOSE: u8 = 0x19;

fn frame(i: &[u8]) -> IResult<&[u8], (u8, &[u8])> {
    let (i, len) = le_u24(i)?;
    let (i, seq) = nom_u8(i)?;
    let (i, payload) = take(len)(i)?;
    Ok((i, (seq, payload)))
}

/// Length-encoded integer. 0xfb (NULL marker) parses as None.
fn lenenc_int(i: &[u8]) -> IResult<&[u8], Option<u64>> {
    let (i, first) = nom_u8(i)?;
    match first {
        0xfb => Ok((i, None)),
        0xfc => {
            let (i, v) = le_u16(i)?;
            Ok((i, Some(v as u64)))
        }
        0xfd => {
            let (i, v) = le_u24(i)?;
            Ok((i, Some(v as u64)))
        }
        0xfe => {
            let (i, v) = le_u64(i)?;
            Ok((i, Some(v)))
        }
        n => Ok((i, Some(n as u64))),
    }
}

fn lenenc_str(i: &[u8]) -> IResult<&[u8], Option<&[u8]>> {
    let (i, len) = lenenc_int(i)?;
    match len {
        None => Ok((i, None)),
        Some(len) => {
            let (i, s) = take(len)(i)?;
            Ok((i, Some(s)))
        }
    }
}

fn command_name(code: u8) -> &'static str {
    match code {
        COM_QUIT => "QUIT",
        COM_INIT_DB => "INIT_DB",
        COM_QUERY => "QUERY",
        COM_FIELD_LIST => "FIELD_LIST",
        COM_PING => "PING",
        COM_STMT_PREPARE => "STMT_PREPARE",
        COM_STMT_EXECUTE => "STMT_EXECUTE",
        COM_STMT_CLOSE => "STMT_CLOSE",
        _ => "UNKNOWN",
    }
}

/// First keyword of a query, uppercased; the record `method`.
fn query_method(query: &str) -> String {
    query
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

fn is_eof(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0xfe && payload.len() < 9
}

#[derive(Debug)]
struct MysqlRequest {
    ts: u64,
    command: u8,
    method: String,
    query: String,
    size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RespPhase {
    /// Expecting OK, ERR or a result-set header.
    Initial,
    /// Reading column definitions until EOF.
    Columns,
    /// Reading rows until EOF.
    Rows,
}

#[derive(Debug)]
struct MysqlResponse {
    size: u64,
    phase: RespPhase,
    num_fields: u64,
    num_rows: u64,
    affected_rows: Option<u64>,
    insert_id: Option<u64>,
    is_error: bool,
    error_code: u16,
    error_message: String,
    rows: Vec<String>,
}

impl MysqlResponse {
    fn new() -> Self {
        MysqlResponse {
            size: 0,
            phase: RespPhase::Initial,
            num_fields: 0,
            num_rows: 0,
            affected_rows: None,
            insert_id: None,
            is_error: false,
            error_code: 0,
            error_message: String::new(),
            rows: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct MysqlFlow {
    cfg: Arc<MysqlConfig>,
    client_dir: Dir,
    pending: PendingQueue<MysqlRequest>,
    resp: Option<MysqlResponse>,
    fins: [bool; 2],
}

impl MysqlFlow {
    pub(crate) fn new(cfg: Arc<MysqlConfig>, client_dir: Dir) -> Self {
        let max_pending = cfg.max_pending;
        MysqlFlow {
            cfg,
            client_dir,
            pending: PendingQueue::new(max_pending),
            resp: None,
            fins: [false, false],
        }
    }

    fn handle_command(&mut self, ctx: &ParseCtx, payload: &[u8], frame_size: u64) {
        let command = payload[0];
        if command == COM_QUIT || command == COM_STMT_CLOSE {
            // fire-and-forget commands never see a response
            return;
        }
        let (method, query) = match command {
            COM_QUERY | COM_STMT_PREPARE => {
                let q = String::from_utf8_lossy(&payload[1..]).into_owned();
                (query_method(&q), q)
            }
            COM_INIT_DB => {
                let db = String::from_utf8_lossy(&payload[1..]).into_owned();
                ("INIT_DB".to_string(), db)
            }
            COM_STMT_EXECUTE => ("EXECUTE".to_string(), String::new()),
            other => (command_name(other).to_string(), String::new()),
        };
        let req = MysqlRequest {
            ts: ctx.ts,
            command,
            method,
            query,
            size: frame_size,
        };
        if let Some((_, evicted)) = self.pending.push(ctx.ts, req) {
            STATS.protocol(ProtocolId::Mysql).overflows.inc();
            self.emit(ctx, evicted, None, Some(NOTE_DROPPED_OVERFLOW));
        }
    }

    fn handle_response_frame(&mut self, ctx: &ParseCtx, payload: &[u8], frame_size: u64) {
        if self.pending.is_empty() {
            // server greeting or auth exchange
            return;
        }
        let max_rows = self.cfg.max_rows;
        let max_row_length = self.cfg.max_row_length;
        let resp = self.resp.get_or_insert_with(MysqlResponse::new);
        resp.size += frame_size;
        if payload.is_empty() {
            return;
        }

        match resp.phase {
            RespPhase::Initial => match payload[0] {
                0x00 => {
                    // OK packet
                    let parsed = (|| -> IResult<&[u8], (Option<u64>, Option<u64>)> {
                        let (i, _) = nom_u8(&payload[..])?;
                        let (i, affected) = lenenc_int(i)?;
                        let (i, insert_id) = lenenc_int(i)?;
                        Ok((i, (affected, insert_id)))
                    })();
                    if let Ok((_, (affected, insert_id))) = parsed {
                        resp.affected_rows = affected;
                        resp.insert_id = insert_id;
                    }
                    self.finish(ctx);
                }
                0xff => {
                    // ERR packet
                    if payload.len() >= 3 {
                        resp.error_code = u16::from_le_bytes([payload[1], payload[2]]);
                    }
                    let msg = &payload[3..];
                    // skip the '#' sql-state marker when present
                    let msg = if msg.first() == Some(&b'#') && msg.len() >= 6 {
                        &msg[6..]
                    } else {
                        msg
                    };
                    resp.error_message = String::from_utf8_lossy(msg).into_owned();
                    resp.is_error = true;
                    self.finish(ctx);
                }
                _ => {
                    // result-set header: column count
                    if let Ok((_, Some(count))) = lenenc_int(payload) {
                        resp.num_fields = count;
                    }
                    resp.phase = RespPhase::Columns;
                }
            },
            RespPhase::Columns => {
                if is_eof(payload) {
                    resp.phase = RespPhase::Rows;
                }
            }
            RespPhase::Rows => {
                if is_eof(payload) {
                    self.finish(ctx);
                } else {
                    resp.num_rows += 1;
                    if resp.rows.len() < max_rows {
                        resp.rows
                            .push(render_row(payload, resp.num_fields, max_row_length));
                    }
                }
            }
        }
    }

    fn finish(&mut self, ctx: &ParseCtx) {
        let resp = self.resp.take();
        if let Some((_, req)) = self.pending.pop() {
            self.emit(ctx, req, resp, None);
        }
    }

    fn emit(
        &self,
        ctx: &ParseCtx,
        req: MysqlRequest,
        resp: Option<MysqlResponse>,
        note: Option<&str>,
    ) {
        let mut rec = Record::new(ProtocolId::Mysql, req.ts);
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
                    sub.insert("error_code".into(), json!(resp.error_code));
                    sub.insert(
                        "error_message".into(),
                        json!(resp.error_message.clone()),
                    );
                } else {
                    if let Some(n) = resp.affected_rows {
                        sub.insert("affected_rows".into(), json!(n));
                    }
                    if let Some(n) = resp.insert_id {
                        sub.insert("insert_id".into(), json!(n));
                    }
                    if resp.num_fields > 0 {
                        sub.insert("num_fields".into(), json!(resp.num_fields));
                        sub.insert("num_rows".into(), json!(resp.num_rows));
                    }
                    if self.cfg.send_response && !resp.rows.is_empty() {
                        rec.set("response", resp.rows.join("\n"));
                    }
                }
            }
            None => rec.status(Status::Error),
        }
        sub.insert("command".into(), json!(command_name(req.command)));
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
            STATS.protocol(ProtocolId::Mysql).timeouts.inc();
            self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
        }
    }
}

/// Renders one text-protocol row as a tab-joined preview string.
fn render_row(payload: &[u8], num_fields: u64, max_len: usize) -> String {
    let mut out = String::new();
    let mut rest = payload;
    for i in 0..num_fields {
        match lenenc_str(rest) {
            Ok((next, value)) => {
                if i > 0 {
                    out.push('\t');
                }
                match value {
                    Some(v) => out.push_str(&String::from_utf8_lossy(v)),
                    None => out.push_str("NULL"),
                }
                rest = next;
            }
            Err(_) => break,
        }
        if out.len() >= max_len {
            out.truncate(max_len);
            break;
        }
    }
    out
}

impl L7Parser for MysqlFlow {
    fn parse(&mut self, ctx: &ParseCtx, dir: Dir, buf: &mut StreamBuf) -> ParseVerdict {
        let (consumed, seq, payload) = {
            let data = buf.data();
            match frame(data) {
                Ok((rest, (seq, payload))) => {
                    (data.len() - rest.len(), seq, payload.to_vec())
                }
                Err(nom::Err::Incomplete(_)) => {
                    if buf.len() > self.cfg.max_message_size {
                        STATS.protocol(ProtocolId::Mysql).parse_errors.inc();
                        return ParseVerdict::Drop;
                    }
                    return ParseVerdict::NeedMore;
                }
                Err(_) => {
                    STATS.protocol(ProtocolId::Mysql).parse_errors.inc();
                    return ParseVerdict::Drop;
                }
            }
        };
        buf.consume(consumed);

        if dir == self.client_dir {
            if seq == 0 && !payload.is_empty() {
                self.handle_command(ctx, &payload, consumed as u64);
            }
            // sequence > 0 on the client side is handshake/auth data
        } else {
            self.handle_response_frame(ctx, &payload, consumed as u64);
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
        // response framing cannot be recovered after loss
        STATS.protocol(ProtocolId::Mysql).gaps.inc();
        true
    }

    fn expire(&mut self, ctx: &ParseCtx, now: u64) {
        let timeout = self.cfg.transaction_timeout;
        for (_, req) in self.pending.expire(now, timeout) {
            STATS.protocol(ProtocolId::Mysql).timeouts.inc();
            self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::stream::testutil::{feed, Harness};

    fn mysql_frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = (payload.len() as u32).to_le_bytes()[..3].to_vec();
        f.push(seq);
        f.extend_from_slice(payload);
        f
    }

    fn com_query(query: &str) -> Vec<u8> {
        let mut p = vec![COM_QUERY];
        p.extend_from_slice(query.as_bytes());
        mysql_frame(0, &p)
    }

    fn flow() -> (MysqlFlow, StreamBuf, StreamBuf) {
        (
            MysqlFlow::new(Arc::new(MysqlConfig::default()), Dir::Orig),
            StreamBuf::new(64 * 1024),
            StreamBuf::new(64 * 1024),
        )
    }

    #[test]
    fn core_mysql_lenenc_int() {
        assert_eq!(lenenc_int(&[0x0a]).unwrap().1, Some(10));
        assert_eq!(lenenc_int(&[0xfc, 0x34, 0x12]).unwrap().1, Some(0x1234));
        assert_eq!(lenenc_int(&[0xfb]).unwrap().1, None);
        assert!(lenenc_int(&[0xfc, 0x34]).is_err()); // incomplete
    }

    #[test]
    fn core_mysql_error_response() {
        let h = Harness::new(3306);
        let (mut f, mut req_buf, mut resp_buf) = flow();

        let ctx = h.ctx(100);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, &com_query("SELECT * FROM bad"));

        // ERR 1146 with sql-state marker
        let mut err = vec![0xff];
        err.extend_from_slice(&1146u16.to_le_bytes());
        err.extend_from_slice(b"#42S02Table 'test.bad' doesn't exist");
        let ctx = h.ctx(110);
        feed(&mut f, &ctx, Dir::Resp, &mut resp_buf, &mysql_frame(1, &err));

        let events = h.events();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e["type"], "mysql");
        assert_eq!(e["status"], "Error");
        assert_eq!(e["method"], "SELECT");
        assert_eq!(e["mysql"]["iserror"], true);
        assert_eq!(e["mysql"]["error_code"], 1146);
        assert_eq!(e["mysql"]["error_message"], "Table 'test.bad' doesn't exist");
    }

    #[test]
    fn core_mysql_err_packet_bytes() {
        // ERR 1045 frame as seen on the wire, sql-state "#28000"
        let frame_bytes =
            hex::decode("16000001ff15042332383030304163636573732064656e696564").unwrap();
        let h = Harness::new(3306);
        let (mut f, mut req_buf, mut resp_buf) = flow();

        let ctx = h.ctx(1);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, &com_query("SELECT 1"));
        let ctx = h.ctx(2);
        feed(&mut f, &ctx, Dir::Resp, &mut resp_buf, &frame_bytes);

        let events = h.events();
        assert_eq!(events[0]["mysql"]["error_code"], 1045);
        assert_eq!(events[0]["mysql"]["error_message"], "Access denied");
    }

    #[test]
    fn core_mysql_ok_response() {
        let h = Harness::new(3306);
        let (mut f, mut req_buf, mut resp_buf) = flow();

        let ctx = h.ctx(100);
        feed(
            &mut f,
            &ctx,
            Dir::Orig,
            &mut req_buf,
            &com_query("INSERT INTO t VALUES (1)"),
        );

        // OK: affected_rows=1, insert_id=7, status flags
        let ok = vec![0x00, 0x01, 0x07, 0x02, 0x00, 0x00, 0x00];
        let ctx = h.ctx(105);
        feed(&mut f, &ctx, Dir::Resp, &mut resp_buf, &mysql_frame(1, &ok));

        let events = h.events();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e["status"], "OK");
        assert_eq!(e["method"], "INSERT");
        assert_eq!(e["mysql"]["affected_rows"], 1);
        assert_eq!(e["mysql"]["insert_id"], 7);
        assert_eq!(e["responsetime"], 5);
    }

    #[test]
    fn core_mysql_result_set() {
        let h = Harness::new(3306);
        let (mut f, mut req_buf, mut resp_buf) = flow();

        let ctx = h.ctx(1);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, &com_query("SELECT a, b FROM t"));

        let mut resp = Vec::new();
        resp.extend_from_slice(&mysql_frame(1, &[0x02])); // 2 columns
        resp.extend_from_slice(&mysql_frame(2, b"coldef-a"));
        resp.extend_from_slice(&mysql_frame(3, b"coldef-b"));
        resp.extend_from_slice(&mysql_frame(4, &[0xfe, 0x00, 0x00, 0x02, 0x00])); // EOF
        resp.extend_from_slice(&mysql_frame(5, &[0x01, b'x', 0x02, b'y', b'z'])); // row: "x", "yz"
        resp.extend_from_slice(&mysql_frame(6, &[0x01, b'q', 0xfb])); // row: "q", NULL
        resp.extend_from_slice(&mysql_frame(7, &[0xfe, 0x00, 0x00, 0x02, 0x00])); // EOF
        let ctx = h.ctx(2);
        feed(&mut f, &ctx, Dir::Resp, &mut resp_buf, &resp);

        let events = h.events();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e["mysql"]["num_fields"], 2);
        assert_eq!(e["mysql"]["num_rows"], 2);
        assert_eq!(e["status"], "OK");
    }

    #[test]
    fn core_mysql_skips_handshake() {
        let h = Harness::new(3306);
        let (mut f, _, mut resp_buf) = flow();

        // server greeting before any request
        let ctx = h.ctx(1);
        feed(
            &mut f,
            &ctx,
            Dir::Resp,
            &mut resp_buf,
            &mysql_frame(0, b"\x0a5.7.0-greeting"),
        );
        assert!(h.events().is_empty());
        assert!(f.resp.is_none());
    }

    #[test]
    fn core_mysql_flush_on_close() {
        let h = Harness::new(3306);
        let (mut f, mut req_buf, _) = flow();
        let ctx = h.ctx(1);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, &com_query("SELECT 1"));
        f.fin(&h.ctx(2), Dir::Orig);
        f.fin(&h.ctx(2), Dir::Resp);
        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["status"], "Error");
        assert_eq!(events[0]["notes"][0], NOTE_NO_RESPONSE);
    }
}
