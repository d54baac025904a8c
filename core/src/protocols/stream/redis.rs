//! Redis (RESP) parser and FIFO correlator.
//!
//! Both directions speak the same typed wire format (`+ - : $ *` prefixes,
//! CRLF terminated). Requests are command arrays (or legacy inline
//! commands); replies are any RESP value. Pipelining is correlated purely by
//! order within the flow.

use crate::config::RedisConfig;
use crate::conntrack::conn_id::Dir;
use crate::conntrack::stream_buf::StreamBuf;
use crate::protocols::stream::{L7Parser, ParseCtx, ParseVerdict};
use crate::protocols::ProtocolId;
use crate::publish::{Record, Status};
use crate::stats::STATS;
use crate::transactions::PendingQueue;

use std::sync::Arc;

use serde_json::Map;

const NOTE_NO_RESPONSE: &str = "no response";
const NOTE_DROPPED_OVERFLOW: &str = "dropped (overflow)";
/// Rendered-value cap for replies embedded in records.
const RENDER_MAX: usize = 1024;

#[derive(Debug, PartialEq)]
enum Resp {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Resp>>),
}

/// Attempts to parse one complete RESP value. `Ok(None)` means the buffer
/// does not yet hold a full value.
fn parse_resp(data: &[u8]) -> Result<Option<(usize, Resp)>, ()> {
    let (line_len, line) = match read_line(data) {
        Some(v) => v,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(());
    }
    match line[0] {
        b'+' => Ok(Some((line_len, Resp::Simple(lossy(&line[1..]))))),
        b'-' => Ok(Some((line_len, Resp::Error(lossy(&line[1..]))))),
        b':' => {
            let n = parse_int(&line[1..])?;
            Ok(Some((line_len, Resp::Integer(n))))
        }
        b'$' => {
            let len = parse_int(&line[1..])?;
            if len < 0 {
                return Ok(Some((line_len, Resp::Bulk(None))));
            }
            let need = line_len + len as usize + 2;
            if data.len() < need {
                return Ok(None);
            }
            let body = data[line_len..line_len + len as usize].to_vec();
            if &data[need - 2..need] != b"\r\n" {
                return Err(());
            }
            Ok(Some((need, Resp::Bulk(Some(body)))))
        }
        b'*' => {
            let count = parse_int(&line[1..])?;
            if count < 0 {
                return Ok(Some((line_len, Resp::Array(None))));
            }
            let mut items = Vec::with_capacity(count.min(64) as usize);
            let mut offset = line_len;
            for _ in 0..count {
                match parse_resp(&data[offset..])? {
                    Some((n, item)) => {
                        offset += n;
                        items.push(item);
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((offset, Resp::Array(Some(items)))))
        }
        // legacy inline command: a bare line of arguments
        _ => Ok(Some((line_len, Resp::Bulk(Some(line.to_vec()))))),
    }
}

fn read_line(data: &[u8]) -> Option<(usize, &[u8])> {
    data.windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| (i + 2, &data[..i]))
}

fn parse_int(digits: &[u8]) -> Result<i64, ()> {
    std::str::from_utf8(digits)
        .map_err(|_| ())?
        .trim()
        .parse()
        .map_err(|_| ())
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Renders a reply value into a bounded human-readable string.
fn render(value: &Resp, out: &mut String) {
    if out.len() >= RENDER_MAX {
        return;
    }
    match value {
        Resp::Simple(s) | Resp::Error(s) => out.push_str(s),
        Resp::Integer(n) => out.push_str(&n.to_string()),
        Resp::Bulk(Some(b)) => out.push_str(&lossy(b)),
        Resp::Bulk(None) | Resp::Array(None) => out.push_str("nil"),
        Resp::Array(Some(items)) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render(item, out);
                if out.len() >= RENDER_MAX {
                    break;
                }
            }
            out.push(']');
        }
    }
    out.truncate(RENDER_MAX);
}

#[derive(Debug)]
struct RedisMessage {
    ts: u64,
    /// Uppercased command name.
    command: String,
    /// First argument, usually the key.
    key: String,
    /// Full command vector, space joined.
    query: String,
    size: u64,
    raw: Option<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) struct RedisFlow {
    cfg: Arc<RedisConfig>,
    client_dir: Dir,
    requests: PendingQueue<RedisMessage>,
    fins: [bool; 2],
}

impl RedisFlow {
    pub(crate) fn new(cfg: Arc<RedisConfig>, client_dir: Dir) -> Self {
        let max_pending = cfg.max_pending;
        RedisFlow {
            cfg,
            client_dir,
            requests: PendingQueue::new(max_pending),
            fins: [false, false],
        }
    }

    fn handle_request(&mut self, ctx: &ParseCtx, value: Resp, raw: &[u8]) {
        let args: Vec<String> = match value {
            Resp::Array(Some(items)) => items
                .iter()
                .map(|i| match i {
                    Resp::Bulk(Some(b)) => lossy(b),
                    other => {
                        let mut s = String::new();
                        render(other, &mut s);
                        s
                    }
                })
                .collect(),
            Resp::Bulk(Some(line)) => lossy(&line)
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            _ => {
                STATS.protocol(ProtocolId::Redis).parse_errors.inc();
                return;
            }
        };
        if args.is_empty() {
            STATS.protocol(ProtocolId::Redis).parse_errors.inc();
            return;
        }
        let msg = RedisMessage {
            ts: ctx.ts,
            command: args[0].to_ascii_uppercase(),
            key: args.get(1).cloned().unwrap_or_default(),
            query: args.join(" "),
            size: raw.len() as u64,
            raw: self.cfg.send_request.then(|| raw.to_vec()),
        };
        if let Some((_, evicted)) = self.requests.push(ctx.ts, msg) {
            STATS.protocol(ProtocolId::Redis).overflows.inc();
            self.emit(ctx, evicted, None, Some(NOTE_DROPPED_OVERFLOW));
        }
    }

    fn handle_response(&mut self, ctx: &ParseCtx, value: Resp, raw: &[u8]) {
        match self.requests.pop() {
            Some((_, req)) => self.emit(ctx, req, Some((value, raw.to_vec())), None),
            None => {
                STATS.protocol(ProtocolId::Redis).parse_errors.inc();
                log::debug!("{}: redis reply without command", ctx.five_tuple);
            }
        }
    }

    fn emit(
        &self,
        ctx: &ParseCtx,
        req: RedisMessage,
        resp: Option<(Resp, Vec<u8>)>,
        note: Option<&str>,
    ) {
        let mut rec = Record::new(ProtocolId::Redis, req.ts);
        rec.endpoints(ctx.five_tuple, self.client_dir);
        rec.path(&req.key);
        rec.set("method", req.command.as_str());
        rec.set("query", req.query.as_str());
        rec.set("resource", req.key.as_str());
        rec.set("bytes_in", req.size);

        let mut sub = Map::new();
        match &resp {
            Some((value, raw)) => {
                rec.responsetime(req.ts, ctx.ts);
                rec.set("bytes_out", raw.len() as u64);
                let mut rendered = String::new();
                render(value, &mut rendered);
                if let Resp::Error(_) = value {
                    rec.status(Status::Error);
                    sub.insert("error".into(), rendered.into());
                } else {
                    sub.insert("return_value".into(), rendered.into());
                }
                if self.cfg.send_response {
                    rec.set("response", lossy(raw));
                }
            }
            None => rec.status(Status::Error),
        }
        rec.sub(sub);

        if let Some(raw) = &req.raw {
            rec.set("request", lossy(raw));
        }
        if let Some(n) = note {
            rec.note(n);
        }
        ctx.out.publish(rec);
    }

    fn flush(&mut self, ctx: &ParseCtx) {
        for (_, req) in self.requests.drain() {
            STATS.protocol(ProtocolId::Redis).timeouts.inc();
            self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
        }
    }
}

impl L7Parser for RedisFlow {
    fn parse(&mut self, ctx: &ParseCtx, dir: Dir, buf: &mut StreamBuf) -> ParseVerdict {
        if buf.is_empty() {
            return ParseVerdict::NeedMore;
        }
        let parsed = match parse_resp(buf.data()) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                if buf.len() > self.cfg.max_message_size {
                    STATS.protocol(ProtocolId::Redis).parse_errors.inc();
                    return ParseVerdict::Drop;
                }
                return ParseVerdict::NeedMore;
            }
            Err(()) => {
                STATS.protocol(ProtocolId::Redis).parse_errors.inc();
                return ParseVerdict::Drop;
            }
        };
        let (consumed, value) = parsed;
        let raw = buf.data()[..consumed].to_vec();
        buf.consume(consumed);

        if dir == self.client_dir {
            self.handle_request(ctx, value, &raw);
        } else {
            self.handle_response(ctx, value, &raw);
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
        STATS.protocol(ProtocolId::Redis).gaps.inc();
        true
    }

    fn expire(&mut self, ctx: &ParseCtx, now: u64) {
        let timeout = self.cfg.transaction_timeout;
        for (_, req) in self.requests.expire(now, timeout) {
            STATS.protocol(ProtocolId::Redis).timeouts.inc();
            self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
        }
    }
}
