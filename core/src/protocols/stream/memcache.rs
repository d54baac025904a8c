//! Memcache parser for the text and binary protocol variants.
//!
//! The variant is detected from the first byte of each message: `0x80`/`0x81`
//! magic means binary, a printable ASCII command line means text. Text
//! correlation is FIFO with `noreply` requests publishing immediately; binary
//! correlation uses the opaque token, and quiet ops (GETQ and friends) that
//! never see a response are flushed in request order by the next non-quiet
//! response or at flow close.

use crate::config::MemcacheConfig;
use crate::conntrack::conn_id::Dir;
use crate::conntrack::stream_buf::StreamBuf;
use crate::protocols::stream::{L7Parser, ParseCtx, ParseVerdict};
use crate::protocols::ProtocolId;
use crate::publish::{Record, Status};
use crate::stats::STATS;
use crate::transactions::{PendingMap, PendingQueue};

use std::sync::Arc;

use byteorder::{ByteOrder, NetworkEndian};
use serde_json::{json, Map};

const NOTE_NO_RESPONSE: &str = "no response";
const NOTE_DROPPED_OVERFLOW: &str = "dropped (overflow)";

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;
const BIN_HEADER_LEN: usize = 24;

/// Command classification shared by both protocol variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandClass {
    Load,
    Store,
    Delete,
    Counter,
    Info,
    SlabCtrl,
    LruCrawler,
    Stats,
    Success,
    Fail,
    Auth,
    Unknown,
}

impl CommandClass {
    fn as_str(&self) -> &'static str {
        match self {
            CommandClass::Load => "Load",
            CommandClass::Store => "Store",
            CommandClass::Delete => "Delete",
            CommandClass::Counter => "Counter",
            CommandClass::Info => "Info",
            CommandClass::SlabCtrl => "SlabCtrl",
            CommandClass::LruCrawler => "LRUCrawler",
            CommandClass::Stats => "Stats",
            CommandClass::Success => "Success",
            CommandClass::Fail => "Fail",
            CommandClass::Auth => "Auth",
            CommandClass::Unknown => "UNKNOWN",
        }
    }
}

fn classify_text(command: &str) -> CommandClass {
    match command {
        "get" | "gets" | "gat" | "gats" => CommandClass::Load,
        "set" | "add" | "replace" | "append" | "prepend" | "cas" | "touch" => CommandClass::Store,
        "delete" => CommandClass::Delete,
        "incr" | "decr" => CommandClass::Counter,
        "version" | "verbosity" | "quit" => CommandClass::Info,
        "flush_all" | "slabs" => CommandClass::SlabCtrl,
        "lru_crawler" | "lru" => CommandClass::LruCrawler,
        "stats" => CommandClass::Stats,
        _ => CommandClass::Unknown,
    }
}

/// Binary opcode table: name, class, quiet flag.
fn binary_opcode(op: u8) -> (&'static str, CommandClass, bool) {
    match op {
        0x00 => ("get", CommandClass::Load, false),
        0x01 => ("set", CommandClass::Store, false),
        0x02 => ("add", CommandClass::Store, false),
        0x03 => ("replace", CommandClass::Store, false),
        0x04 => ("delete", CommandClass::Delete, false),
        0x05 => ("incr", CommandClass::Counter, false),
        0x06 => ("decr", CommandClass::Counter, false),
        0x07 => ("quit", CommandClass::Info, false),
        0x08 => ("flush", CommandClass::SlabCtrl, false),
        0x09 => ("getq", CommandClass::Load, true),
        0x0a => ("noop", CommandClass::Info, false),
        0x0b => ("version", CommandClass::Info, false),
        0x0c => ("getk", CommandClass::Load, false),
        0x0d => ("getkq", CommandClass::Load, true),
        0x0e => ("append", CommandClass::Store, false),
        0x0f => ("prepend", CommandClass::Store, false),
        0x10 => ("stat", CommandClass::Stats, false),
        0x11 => ("setq", CommandClass::Store, true),
        0x12 => ("addq", CommandClass::Store, true),
        0x13 => ("replaceq", CommandClass::Store, true),
        0x14 => ("deleteq", CommandClass::Delete, true),
        0x15 => ("incrq", CommandClass::Counter, true),
        0x16 => ("decrq", CommandClass::Counter, true),
        0x17 => ("quitq", CommandClass::Info, true),
        0x18 => ("flushq", CommandClass::SlabCtrl, true),
        0x19 => ("appendq", CommandClass::Store, true),
        0x1a => ("prependq", CommandClass::Store, true),
        0x1c => ("touch", CommandClass::Store, false),
        0x1d => ("gat", CommandClass::Load, false),
        0x1e => ("gatq", CommandClass::Load, true),
        0x20 => ("sasl_list_mechs", CommandClass::Auth, false),
        0x21 => ("sasl_auth", CommandClass::Auth, false),
        0x22 => ("sasl_step", CommandClass::Auth, false),
        _ => ("unknown", CommandClass::Unknown, false),
    }
}

fn binary_status_name(status: u16) -> &'static str {
    match status {
        0x00 => "Success",
        0x01 => "KeyNotFound",
        0x02 => "KeyExists",
        0x03 => "ValueTooLarge",
        0x04 => "InvalidArguments",
        0x05 => "ItemNotStored",
        0x06 => "NonNumericValue",
        0x20 => "AuthError",
        0x21 => "AuthContinue",
        0x81 => "UnknownCommand",
        0x82 => "OutOfMemory",
        _ => "UnknownStatus",
    }
}

#[derive(Debug)]
struct McRequest {
    ts: u64,
    command: String,
    class: CommandClass,
    keys: Vec<String>,
    flags: Option<u32>,
    exptime: Option<u32>,
    bytes: Option<u64>,
    /// Text `noreply` or binary quiet opcode.
    quiet: bool,
    opaque: Option<u32>,
    cas: Option<u64>,
    size: u64,
    raw: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct McResponse {
    /// Text status line or binary status name.
    status: String,
    class: CommandClass,
    value_count: u64,
    value_bytes: u64,
    values: Vec<String>,
    cas: Option<u64>,
    size: u64,
    error: Option<Status>,
}

impl McResponse {
    fn new() -> Self {
        McResponse {
            class: CommandClass::Success,
            ..Default::default()
        }
    }
}

impl Default for CommandClass {
    fn default() -> Self {
        CommandClass::Success
    }
}

/// Text-side response accumulation state.
#[derive(Debug)]
enum TextRespState {
    /// Between responses.
    Idle,
    /// Accumulating a multi-line response (VALUE/STAT blocks) until END.
    Lines(McResponse),
    /// Reading a value data block of n bytes plus CRLF.
    Data(McResponse, usize),
}

#[derive(Debug)]
pub(crate) struct MemcacheFlow {
    cfg: Arc<MemcacheConfig>,
    client_dir: Dir,
    text_pending: PendingQueue<McRequest>,
    bin_pending: PendingMap<u32, McRequest>,
    text_resp: TextRespState,
    /// Data block bytes (plus CRLF) still owed by a text request.
    text_req_data: Option<usize>,
    fins: [bool; 2],
}

impl MemcacheFlow {
    pub(crate) fn new(cfg: Arc<MemcacheConfig>, client_dir: Dir) -> Self {
        let max_pending = cfg.max_pending;
        MemcacheFlow {
            cfg,
            client_dir,
            text_pending: PendingQueue::new(max_pending),
            bin_pending: PendingMap::new(max_pending),
            text_resp: TextRespState::Idle,
            text_req_data: None,
            fins: [false, false],
        }
    }

    // ---- binary variant ----

    fn parse_binary(
        &mut self,
        ctx: &ParseCtx,
        is_request: bool,
        buf: &mut StreamBuf,
    ) -> ParseVerdict {
        if buf.len() < BIN_HEADER_LEN {
            return ParseVerdict::NeedMore;
        }
        let data = buf.data();
        let opcode = data[1];
        let key_len = NetworkEndian::read_u16(&data[2..4]) as usize;
        let extras_len = data[4] as usize;
        let status = NetworkEndian::read_u16(&data[6..8]);
        let body_len = NetworkEndian::read_u32(&data[8..12]) as usize;
        let opaque = NetworkEndian::read_u32(&data[12..16]);
        let cas = NetworkEndian::read_u64(&data[16..24]);
        let total = BIN_HEADER_LEN + body_len;
        if total > self.cfg.max_message_size {
            STATS.protocol(ProtocolId::Memcache).parse_errors.inc();
            return ParseVerdict::Drop;
        }
        if buf.len() < total {
            return ParseVerdict::NeedMore;
        }
        if body_len < key_len + extras_len {
            STATS.protocol(ProtocolId::Memcache).parse_errors.inc();
            return ParseVerdict::Drop;
        }

        let body = data[BIN_HEADER_LEN..total].to_vec();
        buf.consume(total);
        let key = String::from_utf8_lossy(&body[extras_len..extras_len + key_len]).into_owned();
        let value_len = body_len - key_len - extras_len;

        if is_request {
            let (name, class, quiet) = binary_opcode(opcode);
            let mut flags = None;
            let mut exptime = None;
            if extras_len >= 8 {
                flags = Some(NetworkEndian::read_u32(&body[0..4]));
                exptime = Some(NetworkEndian::read_u32(&body[4..8]));
            } else if extras_len >= 4 {
                exptime = Some(NetworkEndian::read_u32(&body[0..4]));
            }
            let req = McRequest {
                ts: ctx.ts,
                command: name.to_string(),
                class,
                keys: if key.is_empty() { vec![] } else { vec![key] },
                flags,
                exptime,
                bytes: Some(value_len as u64),
                quiet,
                opaque: Some(opaque),
                cas: (cas != 0).then(|| cas),
                size: total as u64,
                raw: None,
            };
            if let Some((_, _, evicted)) = self.bin_pending.insert(opaque, ctx.ts, req) {
                STATS.protocol(ProtocolId::Memcache).overflows.inc();
                self.emit(ctx, evicted, None, Some(NOTE_DROPPED_OVERFLOW));
            }
        } else {
            // flush quiet requests older than the one being answered, in
            // request order
            loop {
                let front = match self.bin_pending.front() {
                    Some((k, _)) => *k,
                    None => break,
                };
                if front == opaque {
                    break;
                }
                let (_, _, stale) = match self.bin_pending.pop_front() {
                    Some(entry) => entry,
                    None => break,
                };
                if stale.quiet {
                    self.emit(ctx, stale, None, None);
                } else {
                    STATS.protocol(ProtocolId::Memcache).timeouts.inc();
                    self.emit(ctx, stale, None, Some(NOTE_NO_RESPONSE));
                }
            }

            let mut resp = McResponse::new();
            resp.size = total as u64;
            resp.status = binary_status_name(status).to_string();
            resp.class = if status == 0 {
                CommandClass::Success
            } else {
                CommandClass::Fail
            };
            if status != 0 {
                resp.error = Some(Status::Error);
            }
            if value_len > 0 {
                resp.value_count = 1;
                resp.value_bytes = value_len as u64;
                if self.cfg.maxvalues > 0 {
                    let cap = self.cfg.maxbytespervalue.min(value_len);
                    let start = extras_len + key_len;
                    resp.values
                        .push(String::from_utf8_lossy(&body[start..start + cap]).into_owned());
                }
            }
            resp.cas = (cas != 0).then(|| cas);

            match self.bin_pending.remove(&opaque) {
                Some((_, req)) => self.emit(ctx, req, Some(resp), None),
                None => {
                    STATS.protocol(ProtocolId::Memcache).parse_errors.inc();
                    log::debug!("{}: memcache response with unknown opaque", ctx.five_tuple);
                }
            }
        }
        ParseVerdict::Progress
    }

    // ---- text variant ----

    fn parse_text_request(&mut self, ctx: &ParseCtx, buf: &mut StreamBuf) -> ParseVerdict {
        // finish a pending data block first
        if let Some(need) = self.text_req_data {
            if buf.len() < need {
                return ParseVerdict::NeedMore;
            }
            let block = buf.data()[..need].to_vec();
            buf.consume(need);
            self.text_req_data = None;
            let mut quiet = false;
            if let Some((_, req)) = self.text_pending.back_mut() {
                req.size += need as u64;
                if let Some(raw) = &mut req.raw {
                    raw.extend_from_slice(&block);
                }
                quiet = req.quiet;
            }
            // a noreply storage request is complete once its data arrived
            if quiet {
                if let Some((_, req)) = self.text_pending.pop_back() {
                    self.emit(ctx, req, None, None);
                }
            }
            return ParseVerdict::Progress;
        }

        let (line_len, line) = match read_line(buf.data()) {
            Some(v) => v,
            None => {
                if buf.len() > self.cfg.max_message_size {
                    STATS.protocol(ProtocolId::Memcache).parse_errors.inc();
                    return ParseVerdict::Drop;
                }
                return ParseVerdict::NeedMore;
            }
        };
        let text = String::from_utf8_lossy(&line).into_owned();
        buf.consume(line_len);

        let mut parts = text.split_whitespace();
        let command = parts.next().unwrap_or("").to_ascii_lowercase();
        let args: Vec<&str> = parts.collect();
        let class = classify_text(&command);
        if class == CommandClass::Unknown && !self.cfg.parseunknown {
            STATS.protocol(ProtocolId::Memcache).parse_errors.inc();
            return ParseVerdict::Drop;
        }
        let noreply = args.last() == Some(&"noreply");

        let mut req = McRequest {
            ts: ctx.ts,
            command: command.clone(),
            class,
            keys: vec![],
            flags: None,
            exptime: None,
            bytes: None,
            quiet: noreply,
            opaque: None,
            cas: None,
            size: line_len as u64,
            raw: self.cfg.send_request.then(|| {
                let mut raw = line.clone();
                raw.extend_from_slice(b"\r\n");
                raw
            }),
        };

        let mut data_block = None;
        match command.as_str() {
            "get" | "gets" => {
                req.keys = args.iter().map(|s| s.to_string()).collect();
            }
            "set" | "add" | "replace" | "append" | "prepend" | "cas" => {
                if args.len() < 4 {
                    STATS.protocol(ProtocolId::Memcache).parse_errors.inc();
                    return ParseVerdict::Drop;
                }
                req.keys = vec![args[0].to_string()];
                req.flags = args[1].parse().ok();
                req.exptime = args[2].parse().ok();
                req.bytes = args[3].parse().ok();
                if command == "cas" {
                    req.cas = args.get(4).and_then(|s| s.parse().ok());
                }
                data_block = req.bytes.map(|b| b as usize + 2);
            }
            "delete" | "touch" | "incr" | "decr" => {
                if let Some(key) = args.first() {
                    req.keys = vec![key.to_string()];
                }
            }
            _ => {}
        }

        if noreply && data_block.is_none() {
            // complete immediately; no response will ever come
            self.emit(ctx, req, None, None);
        } else {
            if let Some((_, evicted)) = self.text_pending.push(ctx.ts, req) {
                STATS.protocol(ProtocolId::Memcache).overflows.inc();
                self.emit(ctx, evicted, None, Some(NOTE_DROPPED_OVERFLOW));
            }
            self.text_req_data = data_block;
        }
        ParseVerdict::Progress
    }

    fn parse_text_response(&mut self, ctx: &ParseCtx, buf: &mut StreamBuf) -> ParseVerdict {
        // value data block in progress
        if let TextRespState::Data(_, need) = &self.text_resp {
            let need = *need;
            if buf.len() < need {
                return ParseVerdict::NeedMore;
            }
            let block = buf.data()[..need.saturating_sub(2)].to_vec();
            buf.consume(need);
            if let TextRespState::Data(mut resp, _) =
                std::mem::replace(&mut self.text_resp, TextRespState::Idle)
            {
                if self.cfg.maxvalues > 0 && resp.values.len() < self.cfg.maxvalues {
                    let cap = self.cfg.maxbytespervalue.min(block.len());
                    resp.values
                        .push(String::from_utf8_lossy(&block[..cap]).into_owned());
                }
                resp.size += need as u64;
                self.text_resp = TextRespState::Lines(resp);
            }
            return ParseVerdict::Progress;
        }

        let (line_len, line) = match read_line(buf.data()) {
            Some(v) => v,
            None => {
                if buf.len() > self.cfg.max_message_size {
                    STATS.protocol(ProtocolId::Memcache).parse_errors.inc();
                    return ParseVerdict::Drop;
                }
                return ParseVerdict::NeedMore;
            }
        };
        let text = String::from_utf8_lossy(&line).into_owned();
        buf.consume(line_len);

        let mut resp = match std::mem::replace(&mut self.text_resp, TextRespState::Idle) {
            TextRespState::Lines(resp) => resp,
            _ => McResponse::new(),
        };
        resp.size += line_len as u64;

        let mut parts = text.split_whitespace();
        let word = parts.next().unwrap_or("");
        match word {
            "VALUE" => {
                // VALUE <key> <flags> <bytes> [cas]
                let bytes: usize = parts.nth(2).and_then(|s| s.parse().ok()).unwrap_or(0);
                resp.value_count += 1;
                resp.value_bytes += bytes as u64;
                self.text_resp = TextRespState::Data(resp, bytes + 2);
                return ParseVerdict::Progress;
            }
            "STAT" => {
                resp.value_count += 1;
                self.text_resp = TextRespState::Lines(resp);
                return ParseVerdict::Progress;
            }
            "END" => {
                resp.status = "END".into();
            }
            "ERROR" => {
                resp.status = text.clone();
                resp.error = Some(Status::Error);
                resp.class = CommandClass::Fail;
            }
            "CLIENT_ERROR" => {
                resp.status = text.clone();
                resp.error = Some(Status::ClientError);
                resp.class = CommandClass::Fail;
            }
            "SERVER_ERROR" => {
                resp.status = text.clone();
                resp.error = Some(Status::ServerError);
                resp.class = CommandClass::Fail;
            }
            "NOT_STORED" | "NOT_FOUND" | "EXISTS" => {
                resp.status = word.to_string();
                resp.class = CommandClass::Fail;
            }
            _ => {
                // STORED, DELETED, TOUCHED, OK, VERSION, numeric counters
                resp.status = text.clone();
            }
        }

        match self.text_pending.pop() {
            Some((_, req)) => self.emit(ctx, req, Some(resp), None),
            None => {
                STATS.protocol(ProtocolId::Memcache).parse_errors.inc();
                log::debug!("{}: memcache response without request", ctx.five_tuple);
            }
        }
        ParseVerdict::Progress
    }

    fn emit(
        &self,
        ctx: &ParseCtx,
        req: McRequest,
        resp: Option<McResponse>,
        note: Option<&str>,
    ) {
        let mut rec = Record::new(ProtocolId::Memcache, req.ts);
        rec.endpoints(ctx.five_tuple, self.client_dir);
        rec.set("method", req.command.as_str());
        if let Some(key) = req.keys.first() {
            rec.path(key);
            rec.set("resource", key.as_str());
        }
        rec.set(
            "query",
            format!("{} {}", req.command, req.keys.join(" "))
                .trim_end()
                .to_string(),
        );
        rec.set("bytes_in", req.size);

        let mut request_sub = Map::new();
        request_sub.insert("command".into(), json!(req.command.clone()));
        request_sub.insert("command_class".into(), json!(req.class.as_str()));
        if !req.keys.is_empty() {
            request_sub.insert("keys".into(), json!(req.keys.clone()));
        }
        if let Some(f) = req.flags {
            request_sub.insert("flags".into(), json!(f));
        }
        if let Some(e) = req.exptime {
            request_sub.insert("exptime".into(), json!(e));
        }
        if let Some(b) = req.bytes {
            request_sub.insert("bytes".into(), json!(b));
        }
        if let Some(o) = req.opaque {
            request_sub.insert("opaque".into(), json!(o));
        }
        if let Some(c) = req.cas {
            request_sub.insert("cas_unique".into(), json!(c));
        }
        request_sub.insert("quiet".into(), json!(req.quiet));
        if self.cfg.send_request {
            if let Some(raw) = &req.raw {
                rec.set("request", String::from_utf8_lossy(raw).into_owned());
            }
        }

        let mut sub = Map::new();
        sub.insert(
            "protocol_type".into(),
            json!(if req.opaque.is_some() { "binary" } else { "text" }),
        );
        sub.insert("request".into(), serde_json::Value::Object(request_sub));

        match &resp {
            Some(resp) => {
                rec.responsetime(req.ts, ctx.ts);
                rec.set("bytes_out", resp.size);
                let mut response_sub = Map::new();
                response_sub.insert("status".into(), json!(resp.status.clone()));
                response_sub.insert("command_class".into(), json!(resp.class.as_str()));
                if resp.value_count > 0 {
                    response_sub.insert("count_values".into(), json!(resp.value_count));
                    response_sub.insert("bytes".into(), json!(resp.value_bytes));
                }
                if let Some(c) = resp.cas {
                    response_sub.insert("cas_unique".into(), json!(c));
                }
                if self.cfg.send_response && !resp.values.is_empty() {
                    rec.set("response", resp.values.join("\n"));
                }
                sub.insert("response".into(), serde_json::Value::Object(response_sub));
                if let Some(status) = resp.error {
                    rec.status(status);
                }
            }
            None => {
                if note == Some(NOTE_NO_RESPONSE) {
                    rec.status(Status::Error);
                }
            }
        }
        rec.sub(sub);
        if let Some(n) = note {
            rec.note(n);
        }
        ctx.out.publish(rec);
    }

    fn flush(&mut self, ctx: &ParseCtx) {
        for (_, req) in self.text_pending.drain() {
            if req.quiet {
                self.emit(ctx, req, None, None);
            } else {
                STATS.protocol(ProtocolId::Memcache).timeouts.inc();
                self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
            }
        }
        for (_, _, req) in self.bin_pending.drain() {
            if req.quiet {
                self.emit(ctx, req, None, None);
            } else {
                STATS.protocol(ProtocolId::Memcache).timeouts.inc();
                self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
            }
        }
    }
}

fn read_line(data: &[u8]) -> Option<(usize, Vec<u8>)> {
    data.windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| (i + 2, data[..i].to_vec()))
}

impl L7Parser for MemcacheFlow {
    fn parse(&mut self, ctx: &ParseCtx, dir: Dir, buf: &mut StreamBuf) -> ParseVerdict {
        if buf.is_empty() {
            return ParseVerdict::NeedMore;
        }
        let is_request = dir == self.client_dir;

        // request-side data blocks and response accumulation keep their own
        // state; only consult the magic byte between messages
        if is_request && self.text_req_data.is_some() {
            return self.parse_text_request(ctx, buf);
        }
        if !is_request && !matches!(self.text_resp, TextRespState::Idle) {
            return self.parse_text_response(ctx, buf);
        }

        match buf.peek_u8(0) {
            Some(MAGIC_REQUEST) | Some(MAGIC_RESPONSE) => {
                self.parse_binary(ctx, is_request, buf)
            }
            Some(b) if b.is_ascii_graphic() || b == b' ' => {
                if is_request {
                    self.parse_text_request(ctx, buf)
                } else {
                    self.parse_text_response(ctx, buf)
                }
            }
            Some(_) => {
                STATS.protocol(ProtocolId::Memcache).parse_errors.inc();
                ParseVerdict::Drop
            }
            None => ParseVerdict::NeedMore,
        }
    }

    fn fin(&mut self, ctx: &ParseCtx, dir: Dir) {
        self.fins[dir.idx()] = true;
        if self.fins[0] && self.fins[1] {
            self.flush(ctx);
        }
    }

    fn gap(&mut self, _ctx: &ParseCtx, _dir: Dir, _nbytes: u32) -> bool {
        STATS.protocol(ProtocolId::Memcache).gaps.inc();
        true
    }

    fn expire(&mut self, ctx: &ParseCtx, now: u64) {
        let timeout = self.cfg.transaction_timeout;
        for (_, req) in self.text_pending.expire(now, timeout) {
            STATS.protocol(ProtocolId::Memcache).timeouts.inc();
            self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
        }
        for (_, _, req) in self.bin_pending.expire(now, timeout) {
            if req.quiet {
                self.emit(ctx, req, None, None);
            } else {
                STATS.protocol(ProtocolId::Memcache).timeouts.inc();
                self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
            }
        }
    }
}
