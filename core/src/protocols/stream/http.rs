//! HTTP/1.x parser and transaction correlator.
//!
//! Request/status lines and headers go through `httparse`; body framing
//! (Content-Length, chunked, read-until-close) is handled here because it has
//! to survive arbitrary packet boundaries. Requests and responses are matched
//! FIFO within a flow, which is correct for HTTP/1.x pipelining as long as
//! the reassembler never reorders across direction boundaries.

use crate::config::HttpConfig;
use crate::conntrack::conn_id::Dir;
use crate::conntrack::stream_buf::StreamBuf;
use crate::protocols::stream::{L7Parser, ParseCtx, ParseVerdict};
use crate::protocols::ProtocolId;
use crate::publish::{Record, Status};
use crate::stats::STATS;
use crate::transactions::PendingQueue;

use std::sync::Arc;

use serde_json::{json, Map, Value};

const MAX_HEADERS: usize = 64;
const REDACTED: &str = "*";

const NOTE_GAP_REQUEST: &str = "Packet loss while capturing the request";
const NOTE_GAP_RESPONSE: &str = "Packet loss while capturing the response";
const NOTE_NO_RESPONSE: &str = "no response";
const NOTE_DROPPED_OVERFLOW: &str = "dropped (overflow)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    /// Waiting for (more of) a request/status line and headers.
    Headers,
    /// Fixed-size body, bytes remaining.
    Sized(u64),
    /// Chunked body, next chunk-size line expected.
    ChunkSize,
    /// Inside a chunk, data bytes remaining.
    ChunkData(u64),
    /// Consuming the CRLF that terminates a chunk.
    ChunkCrlf(u8),
    /// Trailer section after the last chunk.
    ChunkTrailer,
    /// HTTP/1.0-style body delimited by connection close.
    UntilClose,
}

/// One HTTP message being assembled or completed.
#[derive(Debug)]
struct HttpMessage {
    start_ts: u64,
    end_ts: u64,
    is_request: bool,
    method: String,
    path: String,
    params: String,
    code: u16,
    phrase: String,
    content_length: Option<u64>,
    headers: Map<String, Value>,
    body: Vec<u8>,
    capture_body: bool,
    raw: Vec<u8>,
    capture_raw: bool,
    /// Application payload bytes consumed by this message.
    size: u64,
    notes: Vec<String>,
}

impl HttpMessage {
    fn new(ts: u64, is_request: bool) -> Self {
        HttpMessage {
            start_ts: ts,
            end_ts: ts,
            is_request,
            method: String::new(),
            path: String::new(),
            params: String::new(),
            code: 0,
            phrase: String::new(),
            content_length: None,
            headers: Map::new(),
            body: Vec::new(),
            capture_body: false,
            raw: Vec::new(),
            capture_raw: false,
            size: 0,
            notes: Vec::new(),
        }
    }

    fn append(&mut self, data: &[u8], max: usize) {
        self.size += data.len() as u64;
        if self.capture_raw && self.raw.len() < max {
            let room = max - self.raw.len();
            self.raw.extend_from_slice(&data[..data.len().min(room)]);
        }
    }

    fn append_body(&mut self, data: &[u8], max: usize) {
        if self.capture_body && self.body.len() < max {
            let room = max - self.body.len();
            self.body.extend_from_slice(&data[..data.len().min(room)]);
        }
    }
}

#[derive(Debug)]
struct HttpHalf {
    state: BodyState,
    msg: Option<HttpMessage>,
    /// Timestamp of the first packet of the message being assembled, kept
    /// while its head still spans packets.
    started: Option<u64>,
    fin: bool,
}

impl HttpHalf {
    fn new() -> Self {
        HttpHalf {
            state: BodyState::Headers,
            msg: None,
            started: None,
            fin: false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct HttpFlow {
    cfg: Arc<HttpConfig>,
    client_dir: Dir,
    halves: [HttpHalf; 2],
    requests: PendingQueue<HttpMessage>,
}

impl HttpFlow {
    pub(crate) fn new(cfg: Arc<HttpConfig>, client_dir: Dir) -> Self {
        let max_pending = cfg.max_pending;
        HttpFlow {
            cfg,
            client_dir,
            halves: [HttpHalf::new(), HttpHalf::new()],
            requests: PendingQueue::new(max_pending),
        }
    }

    fn is_request_dir(&self, dir: Dir) -> bool {
        dir == self.client_dir
    }

    /// Parses the head of one message. Returns bytes consumed when complete.
    fn parse_head(
        &mut self,
        ctx: &ParseCtx,
        dir: Dir,
        data: &[u8],
        start_ts: u64,
    ) -> Result<Option<usize>, ()> {
        let is_request = self.is_request_dir(dir);
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];

        let mut msg = HttpMessage::new(start_ts, is_request);
        msg.capture_raw = if is_request {
            self.cfg.send_request
        } else {
            self.cfg.send_response
        };

        let head_len;
        let mut head_version = 1;
        if is_request {
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(data) {
                Ok(httparse::Status::Complete(n)) => {
                    head_len = n;
                    head_version = req.version.unwrap_or(1);
                    msg.method = req.method.unwrap_or("").to_string();
                    let target = req.path.unwrap_or("");
                    match target.split_once('?') {
                        Some((p, q)) => {
                            msg.path = p.to_string();
                            msg.params = q.to_string();
                        }
                        None => msg.path = target.to_string(),
                    }
                }
                Ok(httparse::Status::Partial) => return Ok(None),
                Err(e) => {
                    log::debug!("{}: bad http request: {}", ctx.five_tuple, e);
                    return Err(());
                }
            }
        } else {
            let mut resp = httparse::Response::new(&mut headers);
            match resp.parse(data) {
                Ok(httparse::Status::Complete(n)) => {
                    head_len = n;
                    head_version = resp.version.unwrap_or(1);
                    msg.code = resp.code.unwrap_or(0);
                    msg.phrase = resp.reason.unwrap_or("").to_string();
                }
                Ok(httparse::Status::Partial) => return Ok(None),
                Err(e) => {
                    log::debug!("{}: bad http response: {}", ctx.five_tuple, e);
                    return Err(());
                }
            }
        }

        let mut chunked = false;
        let mut connection_close = head_version == 0;
        let mut content_type_match = false;
        for header in headers.iter().take_while(|h| !h.name.is_empty()) {
            let value = String::from_utf8_lossy(header.value);
            let name = header.name.to_ascii_lowercase();
            match name.as_str() {
                "content-length" => msg.content_length = value.trim().parse().ok(),
                "transfer-encoding" => {
                    chunked = value.to_ascii_lowercase().contains("chunked");
                }
                "connection" => {
                    let v = value.to_ascii_lowercase();
                    if v.contains("close") {
                        connection_close = true;
                    } else if v.contains("keep-alive") {
                        connection_close = false;
                    }
                }
                "content-type" => {
                    content_type_match = self
                        .cfg
                        .include_body_for
                        .iter()
                        .any(|t| value.to_ascii_lowercase().starts_with(&t.to_ascii_lowercase()));
                }
                _ => {}
            }
            if self.cfg.send_all_headers
                || self.cfg.send_headers.iter().any(|h| h.eq_ignore_ascii_case(&name))
            {
                let rendered = if self.cfg.redact_authorization
                    && (name == "authorization" || name == "proxy-authorization")
                {
                    REDACTED.to_string()
                } else {
                    value.to_string()
                };
                // duplicates are comma-joined
                match msg.headers.get_mut(&name) {
                    Some(Value::String(existing)) => {
                        existing.push_str(", ");
                        existing.push_str(&rendered);
                    }
                    _ => {
                        msg.headers.insert(name.clone(), Value::String(rendered));
                    }
                }
            }
        }
        msg.capture_body = content_type_match;

        // body framing
        let head_method = if is_request {
            msg.method.clone()
        } else {
            self.requests
                .front()
                .map(|(_, m)| m.method.clone())
                .unwrap_or_default()
        };
        let bodyless_response = !is_request
            && (head_method == "HEAD"
                || msg.code / 100 == 1
                || msg.code == 204
                || msg.code == 304);

        self.state_for(dir).state = if chunked && !bodyless_response {
            BodyState::ChunkSize
        } else if let Some(len) = msg.content_length.filter(|_| !bodyless_response) {
            if len == 0 {
                BodyState::Headers
            } else {
                BodyState::Sized(len)
            }
        } else if is_request || bodyless_response {
            // requests without a length have no body
            BodyState::Headers
        } else if connection_close {
            BodyState::UntilClose
        } else {
            // keep-alive response without length: nothing to read
            BodyState::Headers
        };

        self.halves[dir.idx()].msg = Some(msg);
        Ok(Some(head_len))
    }

    fn state_for(&mut self, dir: Dir) -> &mut HttpHalf {
        &mut self.halves[dir.idx()]
    }

    /// Routes a completed message: requests queue up, responses pair FIFO.
    fn complete(&mut self, ctx: &ParseCtx, dir: Dir) {
        let half = &mut self.halves[dir.idx()];
        half.state = BodyState::Headers;
        let mut msg = match half.msg.take() {
            Some(m) => m,
            None => return,
        };
        msg.end_ts = ctx.ts;

        if msg.is_request {
            if let Some((_, evicted)) = self.requests.push(msg.start_ts, msg) {
                STATS.protocol(ProtocolId::Http).overflows.inc();
                self.emit(ctx, evicted, None, Some(NOTE_DROPPED_OVERFLOW));
            }
        } else {
            if msg.code == 100 {
                // interim 100 Continue; the real response follows
                return;
            }
            match self.requests.pop() {
                Some((_, req)) => self.emit(ctx, req, Some(msg), None),
                None => {
                    STATS.protocol(ProtocolId::Http).parse_errors.inc();
                    log::debug!("{}: http response without request", ctx.five_tuple);
                }
            }
        }
    }

    fn emit(
        &self,
        ctx: &ParseCtx,
        req: HttpMessage,
        resp: Option<HttpMessage>,
        note: Option<&str>,
    ) {
        let mut rec = Record::new(ProtocolId::Http, req.start_ts);
        rec.endpoints(ctx.five_tuple, self.client_dir);
        rec.path(&req.path);
        rec.set("method", req.method.as_str());
        rec.set("resource", resource_of(&req.path));
        rec.set("query", format!("{} {}", req.method, req.path));
        if !req.params.is_empty() {
            rec.set("params", req.params.as_str());
        }
        rec.set("bytes_in", req.size);

        let mut sub = Map::new();
        if !req.headers.is_empty() {
            sub.insert("request_headers".into(), Value::Object(req.headers.clone()));
        }
        if req.capture_body && !req.body.is_empty() {
            sub.insert(
                "request_body".into(),
                Value::String(String::from_utf8_lossy(&req.body).into_owned()),
            );
        }

        for n in &req.notes {
            rec.note(n);
        }
        if let Some(n) = note {
            rec.note(n);
        }

        match &resp {
            Some(resp) => {
                rec.status(status_for(resp.code));
                rec.responsetime(req.start_ts, resp.end_ts);
                rec.set("bytes_out", resp.size);
                sub.insert("code".into(), json!(resp.code));
                sub.insert("phrase".into(), Value::String(resp.phrase.clone()));
                if let Some(len) = resp.content_length {
                    sub.insert("content_length".into(), json!(len));
                }
                if !resp.headers.is_empty() {
                    sub.insert(
                        "response_headers".into(),
                        Value::Object(resp.headers.clone()),
                    );
                }
                if resp.capture_body && !resp.body.is_empty() {
                    sub.insert(
                        "response_body".into(),
                        Value::String(String::from_utf8_lossy(&resp.body).into_owned()),
                    );
                }
                for n in &resp.notes {
                    rec.note(n);
                }
            }
            None => {
                rec.status(Status::Error);
            }
        }
        rec.sub(sub);

        if req.capture_raw {
            rec.set("request", String::from_utf8_lossy(&req.raw).into_owned());
        }
        if let Some(resp) = &resp {
            if resp.capture_raw {
                rec.set("response", String::from_utf8_lossy(&resp.raw).into_owned());
            }
        }

        ctx.out.publish(rec);
    }

    fn flush_requests(&mut self, ctx: &ParseCtx, note: &str) {
        for (_, req) in self.requests.drain() {
            STATS.protocol(ProtocolId::Http).timeouts.inc();
            self.emit(ctx, req, None, Some(note));
        }
    }
}

fn status_for(code: u16) -> Status {
    match code / 100 {
        1 | 2 | 3 => Status::Ok,
        4 => Status::ClientError,
        _ => Status::ServerError,
    }
}

/// The resource is the path with its last segment removed: the collection a
/// request addresses (`/users/1` -> `/users`).
fn resource_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Parses one chunk-size line, tolerating chunk extensions.
fn parse_chunk_size(data: &[u8]) -> Result<Option<(usize, u64)>, ()> {
    let line_end = match data.windows(2).position(|w| w == b"\r\n") {
        Some(i) => i,
        None => {
            // an unterminated chunk-size line cannot be longer than this
            return if data.len() > 1024 { Err(()) } else { Ok(None) };
        }
    };
    let line = &data[..line_end];
    let digits = match line.iter().position(|&b| b == b';') {
        Some(i) => &line[..i],
        None => line,
    };
    let s = std::str::from_utf8(digits).map_err(|_| ())?;
    let size = u64::from_str_radix(s.trim(), 16).map_err(|_| ())?;
    Ok(Some((line_end + 2, size)))
}

impl L7Parser for HttpFlow {
    fn parse(&mut self, ctx: &ParseCtx, dir: Dir, buf: &mut StreamBuf) -> ParseVerdict {
        if buf.is_empty() {
            return ParseVerdict::NeedMore;
        }
        let max = self.cfg.max_message_size;

        match self.halves[dir.idx()].state {
            BodyState::Headers if self.halves[dir.idx()].msg.is_none() => {
                let start_ts = *self.halves[dir.idx()].started.get_or_insert(ctx.ts);
                let consumed = {
                    let data = buf.data();
                    match self.parse_head(ctx, dir, data, start_ts) {
                        Ok(Some(n)) => n,
                        Ok(None) => {
                            if buf.len() > max {
                                STATS.protocol(ProtocolId::Http).parse_errors.inc();
                                return ParseVerdict::Drop;
                            }
                            return ParseVerdict::NeedMore;
                        }
                        Err(()) => {
                            STATS.protocol(ProtocolId::Http).parse_errors.inc();
                            return ParseVerdict::Drop;
                        }
                    }
                };
                self.halves[dir.idx()].started = None;
                let head = buf.data()[..consumed].to_vec();
                if let Some(msg) = &mut self.halves[dir.idx()].msg {
                    msg.append(&head, max);
                }
                buf.consume(consumed);
                if self.halves[dir.idx()].state == BodyState::Headers {
                    // no body expected
                    self.complete(ctx, dir);
                }
                ParseVerdict::Progress
            }
            BodyState::Headers => {
                // message complete but not yet routed; nothing buffered for us
                ParseVerdict::NeedMore
            }
            BodyState::Sized(remaining) => {
                let take = (remaining as usize).min(buf.len());
                let chunk = buf.data()[..take].to_vec();
                if let Some(msg) = &mut self.halves[dir.idx()].msg {
                    msg.append(&chunk, max);
                    msg.append_body(&chunk, max);
                }
                buf.consume(take);
                let left = remaining - take as u64;
                if left == 0 {
                    self.complete(ctx, dir);
                } else {
                    self.halves[dir.idx()].state = BodyState::Sized(left);
                }
                ParseVerdict::Progress
            }
            BodyState::ChunkSize => {
                let parsed = {
                    let data = buf.data();
                    match parse_chunk_size(data) {
                        Ok(p) => p,
                        Err(()) => {
                            STATS.protocol(ProtocolId::Http).parse_errors.inc();
                            return ParseVerdict::Drop;
                        }
                    }
                };
                match parsed {
                    Some((line_len, size)) => {
                        let line = buf.data()[..line_len].to_vec();
                        if let Some(msg) = &mut self.halves[dir.idx()].msg {
                            msg.append(&line, max);
                        }
                        buf.consume(line_len);
                        self.halves[dir.idx()].state = if size == 0 {
                            BodyState::ChunkTrailer
                        } else {
                            BodyState::ChunkData(size)
                        };
                        ParseVerdict::Progress
                    }
                    None => ParseVerdict::NeedMore,
                }
            }
            BodyState::ChunkData(remaining) => {
                let take = (remaining as usize).min(buf.len());
                let chunk = buf.data()[..take].to_vec();
                if let Some(msg) = &mut self.halves[dir.idx()].msg {
                    msg.append(&chunk, max);
                    msg.append_body(&chunk, max);
                }
                buf.consume(take);
                let left = remaining - take as u64;
                self.halves[dir.idx()].state = if left == 0 {
                    BodyState::ChunkCrlf(2)
                } else {
                    BodyState::ChunkData(left)
                };
                ParseVerdict::Progress
            }
            BodyState::ChunkCrlf(remaining) => {
                let take = (remaining as usize).min(buf.len());
                let crlf = buf.data()[..take].to_vec();
                if let Some(msg) = &mut self.halves[dir.idx()].msg {
                    msg.append(&crlf, max);
                }
                buf.consume(take);
                let left = remaining - take as u8;
                self.halves[dir.idx()].state = if left == 0 {
                    BodyState::ChunkSize
                } else {
                    BodyState::ChunkCrlf(left)
                };
                ParseVerdict::Progress
            }
            BodyState::ChunkTrailer => {
                let data = buf.data();
                let end = if data.starts_with(b"\r\n") {
                    Some(2)
                } else {
                    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
                };
                match end {
                    Some(n) => {
                        let trailer = buf.data()[..n].to_vec();
                        if let Some(msg) = &mut self.halves[dir.idx()].msg {
                            msg.append(&trailer, max);
                        }
                        buf.consume(n);
                        self.complete(ctx, dir);
                        ParseVerdict::Progress
                    }
                    None => ParseVerdict::NeedMore,
                }
            }
            BodyState::UntilClose => {
                let chunk = buf.data().to_vec();
                if let Some(msg) = &mut self.halves[dir.idx()].msg {
                    msg.append(&chunk, max);
                    msg.append_body(&chunk, max);
                }
                buf.consume(chunk.len());
                ParseVerdict::NeedMore
            }
        }
    }

    fn fin(&mut self, ctx: &ParseCtx, dir: Dir) {
        if self.halves[dir.idx()].fin {
            return;
        }
        self.halves[dir.idx()].fin = true;

        if self.halves[dir.idx()].state == BodyState::UntilClose {
            self.complete(ctx, dir);
        } else {
            // a partial message at close is unrecoverable; discard it
            self.halves[dir.idx()].msg = None;
            self.halves[dir.idx()].state = BodyState::Headers;
        }

        if self.halves[0].fin && self.halves[1].fin {
            self.flush_requests(ctx, NOTE_NO_RESPONSE);
        }
    }

    fn gap(&mut self, ctx: &ParseCtx, dir: Dir, nbytes: u32) -> bool {
        STATS.protocol(ProtocolId::Http).gaps.inc();
        let note = if self.is_request_dir(dir) {
            NOTE_GAP_REQUEST
        } else {
            NOTE_GAP_RESPONSE
        };
        let half = &mut self.halves[dir.idx()];
        match half.state {
            BodyState::Sized(remaining) => {
                let msg = match &mut half.msg {
                    Some(m) => m,
                    None => return true,
                };
                msg.size += (nbytes as u64).min(remaining);
                msg.notes.push(note.to_string());
                if nbytes as u64 >= remaining {
                    self.complete(ctx, dir);
                } else {
                    half.state = BodyState::Sized(remaining - nbytes as u64);
                }
                false
            }
            BodyState::UntilClose => {
                if let Some(msg) = &mut half.msg {
                    msg.size += nbytes as u64;
                    if !msg.notes.iter().any(|n| n == note) {
                        msg.notes.push(note.to_string());
                    }
                }
                false
            }
            // loss inside headers or chunked framing cannot be resynchronized
            _ => true,
        }
    }

    fn expire(&mut self, ctx: &ParseCtx, now: u64) {
        let timeout = self.cfg.transaction_timeout;
        for (_, req) in self.requests.expire(now, timeout) {
            STATS.protocol(ProtocolId::Http).timeouts.inc();
            self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::stream::testutil::{feed, Harness};

    fn flow(cfg: HttpConfig) -> (HttpFlow, StreamBuf, StreamBuf) {
        (
            HttpFlow::new(Arc::new(cfg), Dir::Orig),
            StreamBuf::new(64 * 1024),
            StreamBuf::new(64 * 1024),
        )
    }

    #[test]
    fn core_http_basic_transaction() {
        let h = Harness::new(80);
        let (mut f, mut req_buf, mut resp_buf) = flow(HttpConfig::default());

        let ctx = h.ctx(1_000);
        feed(
            &mut f,
            &ctx,
            Dir::Orig,
            &mut req_buf,
            b"GET /users/1 HTTP/1.1\r\nHost: a\r\n\r\n",
        );
        let ctx = h.ctx(1_025);
        feed(
            &mut f,
            &ctx,
            Dir::Resp,
            &mut resp_buf,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        );

        let events = h.events();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e["type"], "http");
        assert_eq!(e["method"], "GET");
        assert_eq!(e["path"], "/users/1");
        assert_eq!(e["resource"], "/users");
        assert_eq!(e["status"], "OK");
        assert_eq!(e["http"]["code"], 200);
        assert_eq!(e["http"]["phrase"], "OK");
        assert_eq!(e["responsetime"], 25);
        assert_eq!(e["bytes_in"], 34);
        assert_eq!(e["bytes_out"], 40);
        assert_eq!(e["direction"], "in");
    }

    #[test]
    fn core_http_head_split_across_packets() {
        let h = Harness::new(80);
        let (mut f, mut req_buf, mut resp_buf) = flow(HttpConfig::default());

        let ctx = h.ctx(10);
        let verdict = feed(
            &mut f,
            &ctx,
            Dir::Orig,
            &mut req_buf,
            b"GET /users/1 HTTP/1.1\r\nHost: ",
        );
        assert_eq!(verdict, ParseVerdict::NeedMore);
        assert!(h.events().is_empty());

        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, b"a\r\n\r\n");
        let ctx = h.ctx(20);
        feed(
            &mut f,
            &ctx,
            Dir::Resp,
            &mut resp_buf,
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
        );

        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["status"], "Client Error");
        assert_eq!(events[0]["http"]["code"], 404);
    }

    #[test]
    fn core_http_pipelined_fifo() {
        let h = Harness::new(80);
        let (mut f, mut req_buf, mut resp_buf) = flow(HttpConfig::default());

        let ctx = h.ctx(1);
        feed(
            &mut f,
            &ctx,
            Dir::Orig,
            &mut req_buf,
            b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n",
        );
        let ctx = h.ctx(2);
        feed(
            &mut f,
            &ctx,
            Dir::Resp,
            &mut resp_buf,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\nHTTP/1.1 500 Oops\r\nContent-Length: 0\r\n\r\n",
        );

        let events = h.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["path"], "/a");
        assert_eq!(events[0]["status"], "OK");
        assert_eq!(events[1]["path"], "/b");
        assert_eq!(events[1]["status"], "Server Error");
    }

    #[test]
    fn core_http_chunked_response() {
        let h = Harness::new(80);
        let mut cfg = HttpConfig::default();
        cfg.include_body_for = vec!["text/plain".into()];
        let (mut f, mut req_buf, mut resp_buf) = flow(cfg);

        let ctx = h.ctx(1);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, b"GET /c HTTP/1.1\r\n\r\n");
        let ctx = h.ctx(2);
        feed(
            &mut f,
            &ctx,
            Dir::Resp,
            &mut resp_buf,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
        );

        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["http"]["response_body"], "wikipedia");
    }

    #[test]
    fn core_http_until_close_completes_on_fin() {
        let h = Harness::new(80);
        let (mut f, mut req_buf, mut resp_buf) = flow(HttpConfig::default());

        let ctx = h.ctx(1);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, b"GET / HTTP/1.0\r\n\r\n");
        let ctx = h.ctx(2);
        feed(
            &mut f,
            &ctx,
            Dir::Resp,
            &mut resp_buf,
            b"HTTP/1.0 200 OK\r\n\r\nsome body bytes",
        );
        assert!(h.events().is_empty());

        let ctx = h.ctx(3);
        f.fin(&ctx, Dir::Resp);
        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["status"], "OK");
    }

    #[test]
    fn core_http_gap_in_body_noted() {
        let h = Harness::new(80);
        let (mut f, mut req_buf, mut resp_buf) = flow(HttpConfig::default());

        let ctx = h.ctx(1);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, b"GET / HTTP/1.0\r\n\r\n");
        let ctx = h.ctx(2);
        feed(
            &mut f,
            &ctx,
            Dir::Resp,
            &mut resp_buf,
            b"HTTP/1.0 200 OK\r\n\r\n01234567890123456789",
        );
        let drop = f.gap(&h.ctx(3), Dir::Resp, 10);
        assert!(!drop);
        f.fin(&h.ctx(4), Dir::Resp);

        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["status"], "OK");
        assert_eq!(events[0]["notes"][0], NOTE_GAP_RESPONSE);
    }

    #[test]
    fn core_http_gap_in_headers_drops() {
        let h = Harness::new(80);
        let (mut f, mut req_buf, _) = flow(HttpConfig::default());
        let ctx = h.ctx(1);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, b"GET / HT");
        assert!(f.gap(&ctx, Dir::Orig, 5));
    }

    #[test]
    fn core_http_send_request_raw_roundtrip() {
        let h = Harness::new(80);
        let mut cfg = HttpConfig::default();
        cfg.send_request = true;
        let (mut f, mut req_buf, mut resp_buf) = flow(cfg);

        let raw = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let ctx = h.ctx(1);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, raw);
        let ctx = h.ctx(2);
        feed(
            &mut f,
            &ctx,
            Dir::Resp,
            &mut resp_buf,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );

        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0]["request"].as_str().unwrap().as_bytes(),
            raw.as_slice()
        );
    }

    #[test]
    fn core_http_headers_captured_and_redacted() {
        let h = Harness::new(80);
        let mut cfg = HttpConfig::default();
        cfg.send_all_headers = true;
        cfg.redact_authorization = true;
        let (mut f, mut req_buf, mut resp_buf) = flow(cfg);

        let ctx = h.ctx(1);
        feed(
            &mut f,
            &ctx,
            Dir::Orig,
            &mut req_buf,
            b"GET / HTTP/1.1\r\nHost: x\r\nAuthorization: Basic abc\r\nX-Tag: a\r\nX-Tag: b\r\n\r\n",
        );
        let ctx = h.ctx(2);
        feed(
            &mut f,
            &ctx,
            Dir::Resp,
            &mut resp_buf,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );

        let events = h.events();
        let headers = &events[0]["http"]["request_headers"];
        assert_eq!(headers["host"], "x");
        assert_eq!(headers["authorization"], REDACTED);
        assert_eq!(headers["x-tag"], "a, b");
    }

    #[test]
    fn core_http_expire_emits_no_response() {
        let h = Harness::new(80);
        let (mut f, mut req_buf, _) = flow(HttpConfig::default());

        let ctx = h.ctx(1_000);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, b"GET /slow HTTP/1.1\r\n\r\n");
        assert!(h.events().is_empty());

        let ctx = h.ctx(20_000);
        f.expire(&ctx, 20_000);
        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["status"], "Error");
        assert_eq!(events[0]["notes"][0], NOTE_NO_RESPONSE);
        assert!(events[0].get("responsetime").is_none());
    }

    #[test]
    fn core_http_resource_of() {
        assert_eq!(resource_of("/users/1"), "/users");
        assert_eq!(resource_of("/users"), "/");
        assert_eq!(resource_of("/"), "/");
        assert_eq!(resource_of(""), "/");
    }
}
