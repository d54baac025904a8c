//! Thrift-RPC parser.
//!
//! Handles the binary protocol (strict and old-style) and the compact
//! protocol, over framed and unframed transports, auto-detected per message.
//! Calls are paired with Replies/Exceptions by sequence id within the flow.
//! Without IDL metadata, parameters and results render positionally as
//! `(field_id: value)` pairs, bounded by the configured string and
//! collection caps.

use crate::config::ThriftConfig;
use crate::conntrack::conn_id::Dir;
use crate::conntrack::stream_buf::StreamBuf;
use crate::protocols::stream::{L7Parser, ParseCtx, ParseVerdict};
use crate::protocols::ProtocolId;
use crate::publish::{Record, Status};
use crate::stats::STATS;
use crate::transactions::PendingMap;

use std::sync::Arc;

use serde_json::{json, Map};

const NOTE_NO_RESPONSE: &str = "no response";
const NOTE_DROPPED_OVERFLOW: &str = "dropped (overflow)";

const BINARY_VERSION_1: u16 = 0x8001;
const COMPACT_PROTOCOL_ID: u8 = 0x82;

const MSG_CALL: u8 = 1;
const MSG_REPLY: u8 = 2;
const MSG_EXCEPTION: u8 = 3;
const MSG_ONEWAY: u8 = 4;

// binary protocol field types
const T_STOP: u8 = 0;
const T_BOOL: u8 = 2;
const T_BYTE: u8 = 3;
const T_DOUBLE: u8 = 4;
const T_I16: u8 = 6;
const T_I32: u8 = 8;
const T_I64: u8 = 10;
const T_STRING: u8 = 11;
const T_STRUCT: u8 = 12;
const T_MAP: u8 = 13;
const T_SET: u8 = 14;
const T_LIST: u8 = 15;

const MAX_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PErr {
    /// Ran out of bytes; retry when more data arrives.
    Incomplete,
    /// Structurally invalid; drop the flow.
    Invalid,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PErr> {
        let end = self.pos.checked_add(n).ok_or(PErr::Invalid)?;
        if end > self.data.len() {
            return Err(PErr::Incomplete);
        }
        let s = &self.data[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, PErr> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, PErr> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, PErr> {
        Ok(self.u16()? as i16)
    }

    fn i32(&mut self) -> Result<i32, PErr> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, PErr> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes(b.try_into().map_err(|_| PErr::Invalid)?))
    }

    fn f64(&mut self) -> Result<f64, PErr> {
        let b = self.take(8)?;
        Ok(f64::from_be_bytes(b.try_into().map_err(|_| PErr::Invalid)?))
    }

    fn varint(&mut self) -> Result<u64, PErr> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(PErr::Invalid)
    }

    fn zigzag32(&mut self) -> Result<i32, PErr> {
        let v = self.varint()? as u32;
        Ok((v >> 1) as i32 ^ -((v & 1) as i32))
    }

    fn zigzag64(&mut self) -> Result<i64, PErr> {
        let v = self.varint()?;
        Ok((v >> 1) as i64 ^ -((v & 1) as i64))
    }
}

/// Rendering limits from the protocol configuration.
struct Limits {
    string_max: usize,
    collection_max: usize,
    obfuscate: bool,
}

fn push_string(out: &mut String, bytes: &[u8], limits: &Limits) {
    if limits.obfuscate {
        out.push_str("\"*\"");
        return;
    }
    let s = String::from_utf8_lossy(bytes);
    out.push('"');
    if s.len() > limits.string_max {
        out.push_str(&s[..limits.string_max]);
        out.push_str("...");
    } else {
        out.push_str(&s);
    }
    out.push('"');
}

// ---- binary protocol ----

fn binary_value(r: &mut Reader, ftype: u8, limits: &Limits, depth: usize, out: &mut String)
    -> Result<(), PErr> {
    if depth > MAX_DEPTH {
        return Err(PErr::Invalid);
    }
    match ftype {
        T_BOOL => {
            let v = r.u8()?;
            out.push_str(if v != 0 { "true" } else { "false" });
        }
        T_BYTE => out.push_str(&(r.u8()? as i8).to_string()),
        T_DOUBLE => out.push_str(&r.f64()?.to_string()),
        T_I16 => out.push_str(&r.i16()?.to_string()),
        T_I32 => out.push_str(&r.i32()?.to_string()),
        T_I64 => out.push_str(&r.i64()?.to_string()),
        T_STRING => {
            let len = r.i32()?;
            if len < 0 {
                return Err(PErr::Invalid);
            }
            let bytes = r.take(len as usize)?;
            push_string(out, bytes, limits);
        }
        T_STRUCT => binary_struct(r, limits, depth + 1, out)?,
        T_MAP => {
            let ktype = r.u8()?;
            let vtype = r.u8()?;
            let count = r.i32()?;
            if count < 0 {
                return Err(PErr::Invalid);
            }
            out.push('{');
            for i in 0..count as usize {
                if i >= limits.collection_max {
                    // consume the rest without rendering
                    binary_value(r, ktype, limits, depth + 1, &mut String::new())?;
                    binary_value(r, vtype, limits, depth + 1, &mut String::new())?;
                    continue;
                }
                if i > 0 {
                    out.push_str(", ");
                }
                binary_value(r, ktype, limits, depth + 1, out)?;
                out.push_str(": ");
                binary_value(r, vtype, limits, depth + 1, out)?;
            }
            if count as usize > limits.collection_max {
                out.push_str(", ...");
            }
            out.push('}');
        }
        T_SET | T_LIST => {
            let etype = r.u8()?;
            let count = r.i32()?;
            if count < 0 {
                return Err(PErr::Invalid);
            }
            out.push('[');
            for i in 0..count as usize {
                if i >= limits.collection_max {
                    binary_value(r, etype, limits, depth + 1, &mut String::new())?;
                    continue;
                }
                if i > 0 {
                    out.push_str(", ");
                }
                binary_value(r, etype, limits, depth + 1, out)?;
            }
            if count as usize > limits.collection_max {
                out.push_str(", ...");
            }
            out.push(']');
        }
        _ => return Err(PErr::Invalid),
    }
    Ok(())
}

fn binary_struct(r: &mut Reader, limits: &Limits, depth: usize, out: &mut String)
    -> Result<(), PErr> {
    out.push('(');
    let mut first = true;
    loop {
        let ftype = r.u8()?;
        if ftype == T_STOP {
            break;
        }
        let fid = r.i16()?;
        if !first {
            out.push_str(", ");
        }
        first = false;
        out.push_str(&format!("{}: ", fid));
        binary_value(r, ftype, limits, depth, out)?;
    }
    out.push(')');
    Ok(())
}

/// Parses a binary-protocol message struct, splitting field 0 (the result)
/// from the remaining fields (declared exceptions).
fn binary_fields(r: &mut Reader, limits: &Limits) -> Result<Vec<(i16, String)>, PErr> {
    let mut fields = Vec::new();
    loop {
        let ftype = r.u8()?;
        if ftype == T_STOP {
            break;
        }
        let fid = r.i16()?;
        let mut rendered = String::new();
        binary_value(r, ftype, limits, 1, &mut rendered)?;
        fields.push((fid, rendered));
    }
    Ok(fields)
}

// ---- compact protocol ----

const CT_BOOL_TRUE: u8 = 1;
const CT_BOOL_FALSE: u8 = 2;
const CT_BYTE: u8 = 3;
const CT_I16: u8 = 4;
const CT_I32: u8 = 5;
const CT_I64: u8 = 6;
const CT_DOUBLE: u8 = 7;
const CT_STRING: u8 = 8;
const CT_LIST: u8 = 9;
const CT_SET: u8 = 10;
const CT_MAP: u8 = 11;
const CT_STRUCT: u8 = 12;

fn compact_value(r: &mut Reader, ctype: u8, limits: &Limits, depth: usize, out: &mut String)
    -> Result<(), PErr> {
    if depth > MAX_DEPTH {
        return Err(PErr::Invalid);
    }
    match ctype {
        CT_BOOL_TRUE => out.push_str("true"),
        CT_BOOL_FALSE => out.push_str("false"),
        CT_BYTE => out.push_str(&(r.u8()? as i8).to_string()),
        CT_I16 => out.push_str(&(r.zigzag32()? as i16).to_string()),
        CT_I32 => out.push_str(&r.zigzag32()?.to_string()),
        CT_I64 => out.push_str(&r.zigzag64()?.to_string()),
        CT_DOUBLE => {
            let b = r.take(8)?;
            out.push_str(&f64::from_le_bytes(b.try_into().map_err(|_| PErr::Invalid)?).to_string());
        }
        CT_STRING => {
            let len = r.varint()? as usize;
            let bytes = r.take(len)?;
            push_string(out, bytes, limits);
        }
        CT_STRUCT => compact_struct(r, limits, depth + 1, out)?,
        CT_LIST | CT_SET => {
            let header = r.u8()?;
            let etype = header & 0x0f;
            let mut count = (header >> 4) as usize;
            if count == 15 {
                count = r.varint()? as usize;
            }
            out.push('[');
            for i in 0..count {
                if i >= limits.collection_max {
                    compact_value(r, etype, limits, depth + 1, &mut String::new())?;
                    continue;
                }
                if i > 0 {
                    out.push_str(", ");
                }
                compact_value(r, etype, limits, depth + 1, out)?;
            }
            if count > limits.collection_max {
                out.push_str(", ...");
            }
            out.push(']');
        }
        CT_MAP => {
            let count = r.varint()? as usize;
            let types = if count > 0 { r.u8()? } else { 0 };
            let ktype = types >> 4;
            let vtype = types & 0x0f;
            out.push('{');
            for i in 0..count {
                if i >= limits.collection_max {
                    compact_value(r, ktype, limits, depth + 1, &mut String::new())?;
                    compact_value(r, vtype, limits, depth + 1, &mut String::new())?;
                    continue;
                }
                if i > 0 {
                    out.push_str(", ");
                }
                compact_value(r, ktype, limits, depth + 1, out)?;
                out.push_str(": ");
                compact_value(r, vtype, limits, depth + 1, out)?;
            }
            if count > limits.collection_max {
                out.push_str(", ...");
            }
            out.push('}');
        }
        _ => return Err(PErr::Invalid),
    }
    Ok(())
}

fn compact_struct(r: &mut Reader, limits: &Limits, depth: usize, out: &mut String)
    -> Result<(), PErr> {
    out.push('(');
    let mut first = true;
    let mut last_id: i16 = 0;
    loop {
        let header = r.u8()?;
        if header == T_STOP {
            break;
        }
        let delta = header >> 4;
        let ctype = header & 0x0f;
        let fid = if delta == 0 {
            r.zigzag32()? as i16
        } else {
            last_id + delta as i16
        };
        last_id = fid;
        if !first {
            out.push_str(", ");
        }
        first = false;
        out.push_str(&format!("{}: ", fid));
        compact_value(r, ctype, limits, depth, out)?;
    }
    out.push(')');
    Ok(())
}

fn compact_fields(r: &mut Reader, limits: &Limits) -> Result<Vec<(i16, String)>, PErr> {
    let mut fields = Vec::new();
    let mut last_id: i16 = 0;
    loop {
        let header = r.u8()?;
        if header == T_STOP {
            break;
        }
        let delta = header >> 4;
        let ctype = header & 0x0f;
        let fid = if delta == 0 {
            r.zigzag32()? as i16
        } else {
            last_id + delta as i16
        };
        last_id = fid;
        let mut rendered = String::new();
        compact_value(r, ctype, limits, 1, &mut rendered)?;
        fields.push((fid, rendered));
    }
    Ok(fields)
}

// ---- message layer ----

#[derive(Debug)]
struct ThriftMessage {
    mtype: u8,
    name: String,
    seqid: i32,
    fields: Vec<(i16, String)>,
    size: u64,
}

/// Parses one complete message starting at the beginning of `data`,
/// unwrapping an optional frame header. Returns the total bytes consumed.
fn parse_message(data: &[u8], limits: &Limits, max_size: usize) -> Result<(usize, ThriftMessage), PErr> {
    if data.len() < 4 {
        return Err(PErr::Incomplete);
    }
    // framed transports carry a 4-byte size prefix; a strict-binary or
    // compact magic byte first means unframed
    let (framed, payload_start, payload_len) =
        if data[0] == 0x80 || data[0] == COMPACT_PROTOCOL_ID {
            (false, 0, data.len())
        } else {
            let frame_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if frame_len == 0 || frame_len > max_size {
                return Err(PErr::Invalid);
            }
            if data.len() < 4 + frame_len {
                return Err(PErr::Incomplete);
            }
            (true, 4, frame_len)
        };
    let payload = &data[payload_start..payload_start + payload_len];
    let mut r = Reader::new(payload);

    let (mtype, name, seqid) = if payload.first() == Some(&COMPACT_PROTOCOL_ID) {
        r.u8()?;
        let vertype = r.u8()?;
        if vertype & 0x1f != 1 {
            return Err(PErr::Invalid);
        }
        let mtype = (vertype >> 5) & 0x07;
        let seqid = r.varint()? as i32;
        let name_len = r.varint()? as usize;
        let name = String::from_utf8_lossy(r.take(name_len)?).into_owned();
        (mtype, name, seqid)
    } else {
        let first = r.i32()?;
        if first < 0 {
            // strict binary: version word then name
            if (first >> 16) as u16 != BINARY_VERSION_1 {
                return Err(PErr::Invalid);
            }
            let mtype = (first & 0xff) as u8;
            let name_len = r.i32()?;
            if name_len < 0 || name_len as usize > max_size {
                return Err(PErr::Invalid);
            }
            let name = String::from_utf8_lossy(r.take(name_len as usize)?).into_owned();
            let seqid = r.i32()?;
            (mtype, name, seqid)
        } else {
            // old binary: name length first
            if first as usize > max_size {
                return Err(PErr::Invalid);
            }
            let name = String::from_utf8_lossy(r.take(first as usize)?).into_owned();
            let mtype = r.u8()?;
            let seqid = r.i32()?;
            (mtype, name, seqid)
        }
    };
    if !(MSG_CALL..=MSG_ONEWAY).contains(&mtype) {
        return Err(PErr::Invalid);
    }

    let fields = if payload.first() == Some(&COMPACT_PROTOCOL_ID) {
        compact_fields(&mut r, limits)?
    } else {
        binary_fields(&mut r, limits)?
    };

    let consumed = if framed {
        4 + payload_len
    } else {
        r.pos
    };
    // an unframed message that claims more bytes than present surfaces as
    // Incomplete inside the readers, so reaching here means consistency
    Ok((
        consumed,
        ThriftMessage {
            mtype,
            name,
            seqid,
            fields,
            size: consumed as u64,
        },
    ))
}

#[derive(Debug)]
struct ThriftRequest {
    ts: u64,
    method: String,
    params: String,
    size: u64,
    oneway: bool,
}

#[derive(Debug)]
pub(crate) struct ThriftFlow {
    cfg: Arc<ThriftConfig>,
    client_dir: Dir,
    pending: PendingMap<i32, ThriftRequest>,
    fins: [bool; 2],
}

impl ThriftFlow {
    pub(crate) fn new(cfg: Arc<ThriftConfig>, client_dir: Dir) -> Self {
        let max_pending = cfg.max_pending;
        ThriftFlow {
            cfg,
            client_dir,
            pending: PendingMap::new(max_pending),
            fins: [false, false],
        }
    }

    fn limits(&self) -> Limits {
        Limits {
            string_max: self.cfg.string_max_size,
            collection_max: self.cfg.collection_max_size,
            obfuscate: self.cfg.obfuscate_strings,
        }
    }

    fn render_params(fields: &[(i16, String)]) -> String {
        let mut out = String::from("(");
        for (i, (fid, value)) in fields.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&format!("{}: {}", fid, value));
        }
        out.push(')');
        out
    }

    fn handle_request(&mut self, ctx: &ParseCtx, msg: ThriftMessage) {
        let req = ThriftRequest {
            ts: ctx.ts,
            method: msg.name,
            params: Self::render_params(&msg.fields),
            size: msg.size,
            oneway: msg.mtype == MSG_ONEWAY,
        };
        if req.oneway {
            self.emit(ctx, req, None, None);
            return;
        }
        if let Some((_, _, evicted)) = self.pending.insert(msg.seqid, ctx.ts, req) {
            STATS.protocol(ProtocolId::Thrift).overflows.inc();
            self.emit(ctx, evicted, None, Some(NOTE_DROPPED_OVERFLOW));
        }
    }

    fn handle_response(&mut self, ctx: &ParseCtx, msg: ThriftMessage) {
        match self.pending.remove(&msg.seqid) {
            Some((_, req)) => self.emit(ctx, req, Some(msg), None),
            None => {
                STATS.protocol(ProtocolId::Thrift).parse_errors.inc();
                log::debug!(
                    "{}: thrift reply with unknown seqid {}",
                    ctx.five_tuple,
                    msg.seqid
                );
            }
        }
    }

    fn emit(
        &self,
        ctx: &ParseCtx,
        req: ThriftRequest,
        resp: Option<ThriftMessage>,
        note: Option<&str>,
    ) {
        let mut rec = Record::new(ProtocolId::Thrift, req.ts);
        rec.endpoints(ctx.five_tuple, self.client_dir);
        rec.path(&req.method);
        rec.set("method", req.method.as_str());
        rec.set("query", format!("{}{}", req.method, req.params));
        rec.set("bytes_in", req.size);

        let mut sub = Map::new();
        sub.insert("params".into(), json!(req.params.clone()));
        if req.oneway {
            sub.insert("oneway".into(), json!(true));
        }
        match &resp {
            Some(resp) => {
                rec.responsetime(req.ts, ctx.ts);
                rec.set("bytes_out", resp.size);
                match resp.mtype {
                    MSG_EXCEPTION => {
                        rec.status(Status::Error);
                        sub.insert(
                            "exceptions".into(),
                            json!(Self::render_params(&resp.fields)),
                        );
                    }
                    _ => {
                        // a reply whose struct has any field other than 0 is
                        // a declared exception
                        let exceptions: Vec<(i16, String)> = resp
                            .fields
                            .iter()
                            .filter(|(fid, _)| *fid != 0)
                            .cloned()
                            .collect();
                        if !exceptions.is_empty() {
                            rec.status(Status::Error);
                            sub.insert(
                                "exceptions".into(),
                                json!(Self::render_params(&exceptions)),
                            );
                        } else if self.cfg.capture_reply {
                            if let Some((_, value)) =
                                resp.fields.iter().find(|(fid, _)| *fid == 0)
                            {
                                sub.insert("return_value".into(), json!(value.clone()));
                            }
                        }
                    }
                }
            }
            None if note == Some(NOTE_NO_RESPONSE) => rec.status(Status::Error),
            None => {}
        }
        rec.sub(sub);

        if self.cfg.send_request {
            rec.set("request", format!("{}{}", req.method, req.params));
        }
        if let Some(n) = note {
            rec.note(n);
        }
        ctx.out.publish(rec);
    }

    fn flush(&mut self, ctx: &ParseCtx) {
        for (_, _, req) in self.pending.drain() {
            STATS.protocol(ProtocolId::Thrift).timeouts.inc();
            self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
        }
    }
}

impl L7Parser for ThriftFlow {
    fn parse(&mut self, ctx: &ParseCtx, dir: Dir, buf: &mut StreamBuf) -> ParseVerdict {
        if buf.is_empty() {
            return ParseVerdict::NeedMore;
        }
        let limits = self.limits();
        let parsed = parse_message(buf.data(), &limits, self.cfg.max_message_size);
        let (consumed, msg) = match parsed {
            Ok(v) => v,
            Err(PErr::Incomplete) => {
                if buf.len() > self.cfg.max_message_size {
                    STATS.protocol(ProtocolId::Thrift).parse_errors.inc();
                    return ParseVerdict::Drop;
                }
                return ParseVerdict::NeedMore;
            }
            Err(PErr::Invalid) => {
                STATS.protocol(ProtocolId::Thrift).parse_errors.inc();
                return ParseVerdict::Drop;
            }
        };
        buf.consume(consumed);

        if dir == self.client_dir {
            self.handle_request(ctx, msg);
        } else {
            self.handle_response(ctx, msg);
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
        STATS.protocol(ProtocolId::Thrift).gaps.inc();
        true
    }

    fn expire(&mut self, ctx: &ParseCtx, now: u64) {
        let timeout = self.cfg.transaction_timeout;
        for (_, _, req) in self.pending.expire(now, timeout) {
            STATS.protocol(ProtocolId::Thrift).timeouts.inc();
            self.emit(ctx, req, None, Some(NOTE_NO_RESPONSE));
        }
    }
}
