//! MongoDB wire-protocol parser.
//!
//! Every message starts with a 16-byte little-endian header (length,
//! requestID, responseTo, opCode). Requests and responses are paired by
//! `responseTo == requestID`; legacy fire-and-forget writes (OP_INSERT,
//! OP_UPDATE, OP_DELETE) publish a request-only record immediately. BSON
//! documents are rendered to JSON with a bounded renderer.

use crate::config::MongodbConfig;
use crate::conntrack::conn_id::Dir;
use crate::conntrack::stream_buf::StreamBuf;
use crate::protocols::stream::{L7Parser, ParseCtx, ParseVerdict};
use crate::protocols::ProtocolId;
use crate::publish::{Record, Status};
use crate::stats::STATS;
use crate::transactions::PendingMap;

use std::sync::Arc;

use nom::number::streaming::le_i32;
use nom::IResult;
use serde_json::{json, Map, Value};

const NOTE_NO_RESPONSE: &str = "no response";
const NOTE_DROPPED_OVERFLOW: &str = "dropped (overflow)";

const OP_REPLY: i32 = 1;
const OP_UPDATE: i32 = 2001;
const OP_INSERT: i32 = 2002;
const OP_QUERY: i32 = 2004;
const OP_GET_MORE: i32 = 2005;
const OP_DELETE: i32 = 2006;
const OP_MSG: i32 = 2013;

const HEADER_LEN: usize = 16;

fn header(i: &[u8]) -> IResult<&[u8], (i32, i32, i32, i32)> {
    let (i, message_length) = le_i32(i)?;
    let (i, request_id) = le_i32(i)?;
    let (i, response_to) = le_i32(i)?;
    let (i, op_code) = le_i32(i)?;
    Ok((i, (message_length, request_id, response_to, op_code)))
}

fn op_name(op: i32) -> &'static str {
    match op {
        OP_REPLY => "reply",
        OP_UPDATE => "update",
        OP_INSERT => "insert",
        OP_QUERY => "query",
        OP_GET_MORE => "getmore",
        OP_DELETE => "delete",
        OP_MSG => "msg",
        _ => "unknown",
    }
}

// ---- bounded BSON decoding ----

/// Decodes one BSON document. Returns the document length and its JSON
/// rendition, or an error on malformed input.
fn bson_doc(data: &[u8]) -> Result<(usize, Value), ()> {
    if data.len() < 5 {
        return Err(());
    }
    let len = i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len < 5 || len > data.len() {
        return Err(());
    }
    let mut map = Map::new();
    let mut offset = 4;
    while offset < len - 1 {
        let etype = data[offset];
        offset += 1;
        let name_end = data[offset..len]
            .iter()
            .position(|&b| b == 0)
            .ok_or(())?
            + offset;
        let name = String::from_utf8_lossy(&data[offset..name_end]).into_owned();
        offset = name_end + 1;
        let (consumed, value) = bson_element(etype, &data[offset..len])?;
        offset += consumed;
        map.insert(name, value);
    }
    Ok((len, Value::Object(map)))
}

fn bson_element(etype: u8, data: &[u8]) -> Result<(usize, Value), ()> {
    match etype {
        0x01 => {
            // double
            let b: [u8; 8] = data.get(..8).ok_or(())?.try_into().map_err(|_| ())?;
            Ok((8, json!(f64::from_le_bytes(b))))
        }
        0x02 | 0x0d => {
            // string / js code
            let len = i32::from_le_bytes(data.get(..4).ok_or(())?.try_into().map_err(|_| ())?);
            if len <= 0 {
                return Err(());
            }
            let len = len as usize;
            let bytes = data.get(4..4 + len).ok_or(())?;
            let s = String::from_utf8_lossy(&bytes[..len - 1]).into_owned();
            Ok((4 + len, Value::String(s)))
        }
        0x03 => {
            let (len, doc) = bson_doc(data)?;
            Ok((len, doc))
        }
        0x04 => {
            // array: a document with numeric keys
            let (len, doc) = bson_doc(data)?;
            let items = match doc {
                Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
                _ => vec![],
            };
            Ok((len, Value::Array(items)))
        }
        0x05 => {
            // binary
            let len = i32::from_le_bytes(data.get(..4).ok_or(())?.try_into().map_err(|_| ())?);
            if len < 0 {
                return Err(());
            }
            let len = len as usize;
            data.get(5..5 + len).ok_or(())?;
            Ok((5 + len, Value::String(format!("<binary of {} bytes>", len))))
        }
        0x07 => {
            // objectid
            let bytes = data.get(..12).ok_or(())?;
            let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            Ok((12, Value::String(hex)))
        }
        0x08 => {
            let b = *data.first().ok_or(())?;
            Ok((1, json!(b != 0)))
        }
        0x09 | 0x11 | 0x12 => {
            // datetime / timestamp / int64
            let b: [u8; 8] = data.get(..8).ok_or(())?.try_into().map_err(|_| ())?;
            Ok((8, json!(i64::from_le_bytes(b))))
        }
        0x0a | 0x06 => Ok((0, Value::Null)),
        0x0b => {
            // regex: two cstrings
            let first = data.iter().position(|&b| b == 0).ok_or(())?;
            let second = data
                .get(first + 1..)
                .ok_or(())?
                .iter()
                .position(|&b| b == 0)
                .ok_or(())?;
            let pattern = String::from_utf8_lossy(&data[..first]).into_owned();
            Ok((first + second + 2, Value::String(format!("/{}/", pattern))))
        }
        0x10 => {
            let b: [u8; 4] = data.get(..4).ok_or(())?.try_into().map_err(|_| ())?;
            Ok((4, json!(i32::from_le_bytes(b))))
        }
        0x13 => {
            data.get(..16).ok_or(())?;
            Ok((16, Value::String("<decimal128>".into())))
        }
        0xff | 0x7f => Ok((0, Value::Null)),
        _ => Err(()),
    }
}

fn cstring(data: &[u8]) -> Result<(usize, String), ()> {
    let end = data.iter().position(|&b| b == 0).ok_or(())?;
    Ok((
        end + 1,
        String::from_utf8_lossy(&data[..end]).into_owned(),
    ))
}

fn render_doc(value: &Value, max_len: usize) -> String {
    let mut s = value.to_string();
    if s.len() > max_len {
        s.truncate(max_len);
        s.push_str("...");
    }
    s
}

#[derive(Debug)]
struct MongoRequest {
    ts: u64,
    method: String,
    collection: String,
    query: Option<String>,
    number_to_return: Option<i32>,
    size: u64,
}

#[derive(Debug)]
pub(crate) struct MongodbFlow {
    cfg: Arc<MongodbConfig>,
    client_dir: Dir,
    pending: PendingMap<i32, MongoRequest>,
    fins: [bool; 2],
}

impl MongodbFlow {
    pub(crate) fn new(cfg: Arc<MongodbConfig>, client_dir: Dir) -> Self {
        let max_pending = cfg.max_pending;
        MongodbFlow {
            cfg,
            client_dir,
            pending: PendingMap::new(max_pending),
            fins: [false, false],
        }
    }

    fn handle_request(
        &mut self,
        ctx: &ParseCtx,
        request_id: i32,
        op: i32,
        body: &[u8],
        size: u64,
    ) -> Result<(), ()> {
        let mut method = op_name(op).to_string();
        let mut collection = String::new();
        let mut query = None;
        let mut number_to_return = None;
        let mut awaits_reply = matches!(op, OP_QUERY | OP_GET_MORE | OP_MSG);

        match op {
            OP_QUERY => {
                let rest = body.get(4..).ok_or(())?;
                let (n, name) = cstring(rest)?;
                collection = name;
                let rest = rest.get(n + 4..).ok_or(())?; // skip numberToSkip
                let ntr = i32::from_le_bytes(rest.get(..4).ok_or(())?.try_into().map_err(|_| ())?);
                number_to_return = Some(ntr);
                if let Ok((_, doc)) = bson_doc(rest.get(4..).ok_or(())?) {
                    query = Some(render_doc(&doc, self.cfg.max_doc_length));
                }
            }
            OP_GET_MORE => {
                let rest = body.get(4..).ok_or(())?;
                let (n, name) = cstring(rest)?;
                collection = name;
                let ntr = i32::from_le_bytes(
                    rest.get(n..n + 4).ok_or(())?.try_into().map_err(|_| ())?,
                );
                number_to_return = Some(ntr);
            }
            OP_INSERT | OP_DELETE => {
                let rest = body.get(4..).ok_or(())?;
                let (_, name) = cstring(rest)?;
                collection = name;
            }
            OP_UPDATE => {
                let rest = body.get(4..).ok_or(())?;
                let (n, name) = cstring(rest)?;
                collection = name;
                if let Ok((_, doc)) = bson_doc(rest.get(n + 4..).ok_or(())?) {
                    query = Some(render_doc(&doc, self.cfg.max_doc_length));
                }
            }
            OP_MSG => {
                // section kind 0 carries the command document
                let sections = body.get(4..).ok_or(())?;
                if sections.first() == Some(&0) {
                    let (_, doc) = bson_doc(sections.get(1..).ok_or(())?)?;
                    if let Value::Object(map) = &doc {
                        if let Some((cmd, value)) = map.iter().next() {
                            method = cmd.clone();
                            let db = map
                                .get("$db")
                                .and_then(Value::as_str)
                                .unwrap_or_default();
                            if let Some(coll) = value.as_str() {
                                collection = if db.is_empty() {
                                    coll.to_string()
                                } else {
                                    format!("{}.{}", db, coll)
                                };
                            } else {
                                collection = db.to_string();
                            }
                        }
                    }
                    query = Some(render_doc(&doc, self.cfg.max_doc_length));
                }
                // moreToCome set means no reply will follow
                let flags = u32::from_le_bytes(body.get(..4).ok_or(())?.try_into().map_err(|_| ())?);
                if flags & 0x2 != 0 {
                    awaits_reply = false;
                }
            }
            _ => return Err(()),
        }

        let req = MongoRequest {
            ts: ctx.ts,
            method,
            collection,
            query,
            number_to_return,
            size,
        };
        if awaits_reply {
            if let Some((_, _, evicted)) = self.pending.insert(request_id, ctx.ts, req) {
                STATS.protocol(ProtocolId::Mongodb).overflows.inc();
                self.emit(ctx, evicted, None, Some(NOTE_DROPPED_OVERFLOW));
            }
        } else {
            // fire-and-forget write: request-only record
            self.emit(ctx, req, None, None);
        }
        Ok(())
    }

    fn handle_response(
        &mut self,
        ctx: &ParseCtx,
        response_to: i32,
        op: i32,
        body: &[u8],
        size: u64,
    ) -> Result<(), ()> {
        let resp = match op {
            OP_REPLY => {
                let flags =
                    i32::from_le_bytes(body.get(..4).ok_or(())?.try_into().map_err(|_| ())?);
                let cursor_id =
                    i64::from_le_bytes(body.get(4..12).ok_or(())?.try_into().map_err(|_| ())?);
                let number_returned =
                    i32::from_le_bytes(body.get(16..20).ok_or(())?.try_into().map_err(|_| ())?);
                let mut docs = Vec::new();
                let mut rest = body.get(20..).ok_or(())?;
                while !rest.is_empty() && docs.len() < self.cfg.max_docs {
                    match bson_doc(rest) {
                        Ok((n, doc)) => {
                            docs.push(doc);
                            rest = &rest[n..];
                        }
                        Err(()) => break,
                    }
                }
                let query_failure = flags & 0x2 != 0;
                MongoResponse {
                    cursor_id: Some(cursor_id),
                    number_returned: Some(number_returned),
                    docs,
                    is_error: query_failure,
                    size,
                }
            }
            OP_MSG => {
                let mut docs = Vec::new();
                let sections = body.get(4..).ok_or(())?;
                if sections.first() == Some(&0) {
                    if let Ok((_, doc)) = bson_doc(sections.get(1..).ok_or(())?) {
                        docs.push(doc);
                    }
                }
                let is_error = docs
                    .first()
                    .and_then(|d| d.get("ok"))
                    .and_then(Value::as_f64)
                    .map(|ok| ok == 0.0)
                    .unwrap_or(false);
                MongoResponse {
                    cursor_id: None,
                    number_returned: None,
                    docs,
                    is_error,
                    size,
                }
            }
            _ => return Err(()),
        };

        match self.pending.remove(&response_to) {
            Some((_, req)) => self.emit(ctx, req, Some(resp), None),
            None => {
                STATS.protocol(ProtocolId::Mongodb).parse_errors.inc();
                log::debug!("{}: mongodb reply with unknown responseTo", ctx.five_tuple);
            }
        }
        Ok(())
    }

    fn emit(
        &self,
        ctx: &ParseCtx,
        req: MongoRequest,
        resp: Option<MongoResponse>,
        note: Option<&str>,
    ) {
        let mut rec = Record::new(ProtocolId::Mongodb, req.ts);
        rec.endpoints(ctx.five_tuple, self.client_dir);
        rec.path(&req.collection);
        rec.set("method", req.method.as_str());
        rec.set("resource", req.collection.as_str());
        if let Some(q) = &req.query {
            rec.set("query", q.as_str());
        }
        rec.set("bytes_in", req.size);

        let mut sub = Map::new();
        if !req.collection.is_empty() {
            sub.insert("fullCollectionName".into(), json!(req.collection.clone()));
        }
        if let Some(n) = req.number_to_return {
            sub.insert("numberToReturn".into(), json!(n));
        }
        match &resp {
            Some(resp) => {
                rec.responsetime(req.ts, ctx.ts);
                rec.set("bytes_out", resp.size);
                if let Some(n) = resp.number_returned {
                    sub.insert("numberReturned".into(), json!(n));
                }
                if let Some(c) = resp.cursor_id {
                    sub.insert("cursorId".into(), json!(c));
                }
                if resp.is_error {
                    rec.status(Status::Error);
                    if let Some(errmsg) = resp
                        .docs
                        .first()
                        .and_then(|d| d.get("errmsg"))
                        .and_then(Value::as_str)
                    {
                        sub.insert("error".into(), json!(errmsg));
                    }
                }
                if self.cfg.send_response && !resp.docs.is_empty() {
                    let rendered: Vec<String> = resp
                        .docs
                        .iter()
                        .map(|d| render_doc(d, self.cfg.max_doc_length))
                        .collect();
                    rec.set("response", rendered.join("\n"));
                }
            }
            None if note.is_some() => rec.status(Status::Error),
            None => {}
        }
        rec.sub(sub);

        if self.cfg.send_request {
            if let Some(q) = &req.query {
                rec.set("request", q.as_str());
            }
        }
        if let Some(n) = note {
            rec.note(n);
        }
        ctx.out.publish(rec);
    }

    fn flush(&mut self, ctx: &ParseCtx) {
        for (_, _, req) in self.pending.drain() {
            STATS.protocol(ProtocolId::Mongodb).timeouts.inc();
            self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
        }
    }
}

#[derive(Debug)]
struct MongoResponse {
    cursor_id: Option<i64>,
    number_returned: Option<i32>,
    docs: Vec<Value>,
    is_error: bool,
    size: u64,
}

impl L7Parser for MongodbFlow {
    fn parse(&mut self, ctx: &ParseCtx, dir: Dir, buf: &mut StreamBuf) -> ParseVerdict {
        let (message_length, request_id, response_to, op_code) = {
            match header(buf.data()) {
                Ok((_, h)) => h,
                Err(nom::Err::Incomplete(_)) => return ParseVerdict::NeedMore,
                Err(_) => {
                    STATS.protocol(ProtocolId::Mongodb).parse_errors.inc();
                    return ParseVerdict::Drop;
                }
            }
        };
        let total = message_length as usize;
        if message_length < HEADER_LEN as i32 || total > self.cfg.max_message_size {
            STATS.protocol(ProtocolId::Mongodb).parse_errors.inc();
            return ParseVerdict::Drop;
        }
        if buf.len() < total {
            return ParseVerdict::NeedMore;
        }
        let body = buf.data()[HEADER_LEN..total].to_vec();
        buf.consume(total);

        let result = if dir == self.client_dir {
            self.handle_request(ctx, request_id, op_code, &body, total as u64)
        } else {
            self.handle_response(ctx, response_to, op_code, &body, total as u64)
        };
        if result.is_err() {
            STATS.protocol(ProtocolId::Mongodb).parse_errors.inc();
            log::debug!(
                "{}: unparseable mongodb op {} ({} bytes)",
                ctx.five_tuple,
                op_code,
                total
            );
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
        STATS.protocol(ProtocolId::Mongodb).gaps.inc();
        true
    }

    fn expire(&mut self, ctx: &ParseCtx, now: u64) {
        let timeout = self.cfg.transaction_timeout;
        for (_, _, req) in self.pending.expire(now, timeout) {
            STATS.protocol(ProtocolId::Mongodb).timeouts.inc();
            self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::stream::testutil::{feed, Harness};

    /// Minimal BSON document builder for tests.
    fn bson(fields: &[(&str, Value)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            match value {
                Value::String(s) => {
                    body.push(0x02);
                    body.extend_from_slice(name.as_bytes());
                    body.push(0);
                    body.extend_from_slice(&((s.len() + 1) as i32).to_le_bytes());
                    body.extend_from_slice(s.as_bytes());
                    body.push(0);
                }
                Value::Number(n) if n.is_f64() => {
                    body.push(0x01);
                    body.extend_from_slice(name.as_bytes());
                    body.push(0);
                    body.extend_from_slice(&n.as_f64().unwrap().to_le_bytes());
                }
                Value::Number(n) => {
                    body.push(0x10);
                    body.extend_from_slice(name.as_bytes());
                    body.push(0);
                    body.extend_from_slice(&(n.as_i64().unwrap() as i32).to_le_bytes());
                }
                _ => unimplemented!(),
            }
        }
        let mut doc = ((body.len() + 5) as i32).to_le_bytes().to_vec();
        doc.extend_from_slice(&body);
        doc.push(0);
        doc
    }

    fn message(request_id: i32, response_to: i32, op: i32, body: &[u8]) -> Vec<u8> {
        let mut m = ((body.len() + HEADER_LEN) as i32).to_le_bytes().to_vec();
        m.extend_from_slice(&request_id.to_le_bytes());
        m.extend_from_slice(&response_to.to_le_bytes());
        m.extend_from_slice(&op.to_le_bytes());
        m.extend_from_slice(body);
        m
    }

    fn op_query(request_id: i32, collection: &str, query: &[u8]) -> Vec<u8> {
        let mut body = 0i32.to_le_bytes().to_vec(); // flags
        body.extend_from_slice(collection.as_bytes());
        body.push(0);
        body.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
        body.extend_from_slice(&10i32.to_le_bytes()); // numberToReturn
        body.extend_from_slice(query);
        message(request_id, 0, OP_QUERY, &body)
    }

    fn op_reply(response_to: i32, docs: &[Vec<u8>]) -> Vec<u8> {
        let mut body = 0i32.to_le_bytes().to_vec(); // flags
        body.extend_from_slice(&99i64.to_le_bytes()); // cursorId
        body.extend_from_slice(&0i32.to_le_bytes()); // startingFrom
        body.extend_from_slice(&(docs.len() as i32).to_le_bytes());
        for d in docs {
            body.extend_from_slice(d);
        }
        message(7000, response_to, OP_REPLY, &body)
    }

    fn flow() -> (MongodbFlow, StreamBuf, StreamBuf) {
        (
            MongodbFlow::new(Arc::new(MongodbConfig::default()), Dir::Orig),
            StreamBuf::new(256 * 1024),
            StreamBuf::new(256 * 1024),
        )
    }

    #[test]
    fn core_mongodb_bson_roundtrip() {
        let doc = bson(&[("name", json!("alice")), ("age", json!(30))]);
        let (len, value) = bson_doc(&doc).unwrap();
        assert_eq!(len, doc.len());
        assert_eq!(value["name"], "alice");
        assert_eq!(value["age"], 30);
    }

    #[test]
    fn core_mongodb_query_reply() {
        let h = Harness::new(27017);
        let (mut f, mut req_buf, mut resp_buf) = flow();

        let query = bson(&[("name", json!("alice"))]);
        let ctx = h.ctx(1_000);
        feed(
            &mut f,
            &ctx,
            Dir::Orig,
            &mut req_buf,
            &op_query(41, "test.users", &query),
        );
        assert!(h.events().is_empty());

        let doc = bson(&[("name", json!("alice")), ("age", json!(30))]);
        let ctx = h.ctx(1_020);
        feed(&mut f, &ctx, Dir::Resp, &mut resp_buf, &op_reply(41, &[doc]));

        let events = h.events();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e["type"], "mongodb");
        assert_eq!(e["status"], "OK");
        assert_eq!(e["method"], "query");
        assert_eq!(e["path"], "test.users");
        assert_eq!(e["mongodb"]["fullCollectionName"], "test.users");
        assert_eq!(e["mongodb"]["numberToReturn"], 10);
        assert_eq!(e["mongodb"]["numberReturned"], 1);
        assert_eq!(e["mongodb"]["cursorId"], 99);
        assert_eq!(e["responsetime"], 20);
        assert!(e["query"].as_str().unwrap().contains("alice"));
    }

    #[test]
    fn core_mongodb_fire_and_forget_insert() {
        let h = Harness::new(27017);
        let (mut f, mut req_buf, _) = flow();

        let mut body = 0i32.to_le_bytes().to_vec();
        body.extend_from_slice(b"test.logs\0");
        body.extend_from_slice(&bson(&[("msg", json!("hi"))]));
        let ctx = h.ctx(5);
        feed(
            &mut f,
            &ctx,
            Dir::Orig,
            &mut req_buf,
            &message(51, 0, OP_INSERT, &body),
        );

        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["method"], "insert");
        assert_eq!(events[0]["path"], "test.logs");
        assert_eq!(events[0]["status"], "OK");
    }

    #[test]
    fn core_mongodb_op_msg_command() {
        let h = Harness::new(27017);
        let (mut f, mut req_buf, mut resp_buf) = flow();

        let cmd = bson(&[("find", json!("users")), ("$db", json!("app"))]);
        let mut body = 0u32.to_le_bytes().to_vec();
        body.push(0); // section kind 0
        body.extend_from_slice(&cmd);
        let ctx = h.ctx(1);
        feed(
            &mut f,
            &ctx,
            Dir::Orig,
            &mut req_buf,
            &message(61, 0, OP_MSG, &body),
        );

        let ok = bson(&[("ok", json!(1.0))]);
        let mut rbody = 0u32.to_le_bytes().to_vec();
        rbody.push(0);
        rbody.extend_from_slice(&ok);
        let ctx = h.ctx(2);
        feed(
            &mut f,
            &ctx,
            Dir::Resp,
            &mut resp_buf,
            &message(7100, 61, OP_MSG, &rbody),
        );

        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["method"], "find");
        assert_eq!(events[0]["path"], "app.users");
        assert_eq!(events[0]["status"], "OK");
    }

    #[test]
    fn core_mongodb_op_msg_error() {
        let h = Harness::new(27017);
        let (mut f, mut req_buf, mut resp_buf) = flow();

        let cmd = bson(&[("find", json!("users")), ("$db", json!("app"))]);
        let mut body = 0u32.to_le_bytes().to_vec();
        body.push(0);
        body.extend_from_slice(&cmd);
        let ctx = h.ctx(1);
        feed(&mut f, &ctx, Dir::Orig, &mut req_buf, &message(62, 0, OP_MSG, &body));

        let err = bson(&[("ok", json!(0.0)), ("errmsg", json!("unauthorized"))]);
        let mut rbody = 0u32.to_le_bytes().to_vec();
        rbody.push(0);
        rbody.extend_from_slice(&err);
        let ctx = h.ctx(2);
        feed(
            &mut f,
            &ctx,
            Dir::Resp,
            &mut resp_buf,
            &message(7101, 62, OP_MSG, &rbody),
        );

        let events = h.events();
        assert_eq!(events[0]["status"], "Error");
        assert_eq!(events[0]["mongodb"]["error"], "unauthorized");
    }
}
