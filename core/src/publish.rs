//! Transaction records and delivery to the downstream sink.
//!
//! Parsers assemble a [`Record`] and hand it to the [`Publisher`], which
//! stamps the sampling count and forwards it over a bounded channel to the
//! publisher thread. Publishing never blocks a parser: when the channel is
//! full the event is dropped and counted.

use crate::conntrack::conn_id::{Dir, FiveTuple};
use crate::protocols::ProtocolId;
use crate::stats::STATS;

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{LocalResult, SecondsFormat, TimeZone, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde_json::{json, Map, Value};
use thiserror::Error;

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX_ATTEMPTS: u32 = 5;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink error: {0}")]
    Other(String),
}

/// Transaction status classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    ClientError,
    ServerError,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::ClientError => "Client Error",
            Status::ServerError => "Server Error",
            Status::Error => "Error",
        }
    }
}

/// Renders a millisecond UTC timestamp as RFC3339 with millisecond
/// precision.
pub fn format_ts(ms: u64) -> String {
    let dt = match Utc.timestamp_millis_opt(ms as i64) {
        LocalResult::Single(dt) => dt,
        _ => Default::default(),
    };
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One output record under construction.
///
/// `new` seeds every required field so a published record always carries
/// `@timestamp`, `type`, `count`, `status`, `path` and `direction`.
#[derive(Debug)]
pub struct Record {
    proto: ProtocolId,
    map: Map<String, Value>,
}

impl Record {
    pub fn new(proto: ProtocolId, ts_ms: u64) -> Record {
        let mut map = Map::new();
        map.insert("@timestamp".into(), Value::String(format_ts(ts_ms)));
        map.insert("type".into(), Value::String(proto.name().into()));
        map.insert("count".into(), json!(1));
        map.insert("status".into(), Value::String(Status::Ok.as_str().into()));
        map.insert("path".into(), Value::String(String::new()));
        map.insert("direction".into(), Value::String("in".into()));
        Record { proto, map }
    }

    #[inline]
    pub fn proto(&self) -> ProtocolId {
        self.proto
    }

    pub fn status(&mut self, status: Status) {
        self.map
            .insert("status".into(), Value::String(status.as_str().into()));
    }

    pub fn path(&mut self, path: &str) {
        self.map.insert("path".into(), Value::String(path.into()));
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.map.insert(key.into(), value.into());
    }

    /// Inserts the per-protocol subdocument (keyed by the protocol name).
    pub fn sub(&mut self, fields: Map<String, Value>) {
        self.map
            .insert(self.proto.name().into(), Value::Object(fields));
    }

    pub fn note(&mut self, note: &str) {
        let notes = self
            .map
            .entry("notes")
            .or_insert_with(|| Value::Array(vec![]));
        if let Value::Array(list) = notes {
            list.push(Value::String(note.into()));
        }
    }

    /// Sets `responsetime` from request/response timestamps, clamped at 0.
    pub fn responsetime(&mut self, req_ts: u64, resp_ts: u64) {
        self.map
            .insert("responsetime".into(), json!(resp_ts.saturating_sub(req_ts)));
    }

    /// Fills `src`/`dst` endpoint objects and `direction`.
    ///
    /// `src` is the requester. `direction` is `in` when the flow was bound by
    /// a destination-port match (the originator is the client), `out` when
    /// the binding was reversed.
    pub fn endpoints(&mut self, five_tuple: &FiveTuple, client_dir: Dir) {
        let client = five_tuple.endpoint(client_dir);
        let server = five_tuple.endpoint(client_dir.flip());
        self.map.insert(
            "src".into(),
            json!({"ip": client.ip().to_string(), "port": client.port()}),
        );
        self.map.insert(
            "dst".into(),
            json!({"ip": server.ip().to_string(), "port": server.port()}),
        );
        let direction = match client_dir {
            Dir::Orig => "in",
            Dir::Resp => "out",
        };
        self.map
            .insert("direction".into(), Value::String(direction.into()));
    }

    fn into_value(self, sampling: u32) -> Value {
        let mut map = self.map;
        map.insert("count".into(), json!(sampling));
        Value::Object(map)
    }
}

/// Handle parsers use to emit records. Cheap to clone; one per worker.
#[derive(Clone)]
pub struct Publisher {
    tx: Sender<Value>,
    sampling: u32,
}

impl Publisher {
    pub fn new(tx: Sender<Value>, sampling: u32) -> Publisher {
        Publisher { tx, sampling }
    }

    pub fn publish(&self, record: Record) {
        let proto = record.proto();
        match self.tx.try_send(record.into_value(self.sampling)) {
            Ok(()) => STATS.protocol(proto).published.inc(),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                STATS.events_dropped.inc();
            }
        }
    }
}

/// Downstream consumer of finished records.
pub trait Sink: Send {
    fn deliver(&mut self, event: &Value) -> Result<(), SinkError>;
}

/// Writes one JSON object per line.
pub struct JsonlSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        JsonlSink { writer }
    }
}

impl<W: Write + Send> Sink for JsonlSink<W> {
    fn deliver(&mut self, event: &Value) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, event)
            .map_err(|e| SinkError::Other(e.to_string()))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

/// Collects records in memory; used by tests and the stats-only mode.
#[derive(Clone, Default)]
pub struct CollectSink {
    pub events: Arc<Mutex<Vec<Value>>>,
}

impl CollectSink {
    pub fn new() -> CollectSink {
        CollectSink::default()
    }

    pub fn take(&self) -> Vec<Value> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl Sink for CollectSink {
    fn deliver(&mut self, event: &Value) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Drains the publish channel into the sink, retrying failed deliveries with
/// exponential backoff before giving up on an event.
pub(crate) fn spawn_publisher(rx: Receiver<Value>, mut sink: Box<dyn Sink>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("publisher".into())
        .spawn(move || {
            for event in rx.iter() {
                let mut delivered = false;
                for attempt in 0..RETRY_MAX_ATTEMPTS {
                    match sink.deliver(&event) {
                        Ok(()) => {
                            delivered = true;
                            break;
                        }
                        Err(e) => {
                            log::warn!("sink delivery failed (attempt {}): {}", attempt + 1, e);
                            thread::sleep(RETRY_BASE * 2u32.saturating_pow(attempt));
                        }
                    }
                }
                if !delivered {
                    STATS.events_lost_sink.inc();
                }
            }
        })
        .expect("failed to spawn publisher thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::pdu::Transport;

    fn five_tuple() -> FiveTuple {
        FiveTuple {
            orig: "10.0.0.1:3456".parse().unwrap(),
            resp: "10.0.0.2:80".parse().unwrap(),
            proto: Transport::Tcp,
        }
    }

    #[test]
    fn core_record_required_fields() {
        let rec = Record::new(ProtocolId::Http, 1_700_000_000_123);
        let v = rec.into_value(1);
        for key in ["@timestamp", "type", "count", "status", "path", "direction"] {
            assert!(v.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(v["type"], "http");
        assert_eq!(v["status"], "OK");
        assert_eq!(v["@timestamp"], "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn core_record_endpoints_direction() {
        let ft = five_tuple();
        let mut rec = Record::new(ProtocolId::Http, 0);
        rec.endpoints(&ft, Dir::Orig);
        let v = rec.into_value(1);
        assert_eq!(v["direction"], "in");
        assert_eq!(v["src"]["ip"], "10.0.0.1");
        assert_eq!(v["dst"]["port"], 80);

        let mut rec = Record::new(ProtocolId::Http, 0);
        rec.endpoints(&ft, Dir::Resp);
        let v = rec.into_value(1);
        assert_eq!(v["direction"], "out");
        assert_eq!(v["src"]["ip"], "10.0.0.2");
    }

    #[test]
    fn core_record_notes_append() {
        let mut rec = Record::new(ProtocolId::Dns, 0);
        rec.note("no response");
        rec.note("dropped (overflow)");
        let v = rec.into_value(1);
        assert_eq!(v["notes"][0], "no response");
        assert_eq!(v["notes"][1], "dropped (overflow)");
    }

    #[test]
    fn core_record_responsetime_clamped() {
        let mut rec = Record::new(ProtocolId::Mysql, 0);
        rec.responsetime(2000, 1500);
        let v = rec.into_value(1);
        assert_eq!(v["responsetime"], 0);
    }

    #[test]
    fn core_publisher_drops_on_full_channel() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let publisher = Publisher::new(tx, 1);
        let before = STATS.events_dropped.get();
        publisher.publish(Record::new(ProtocolId::Redis, 0));
        publisher.publish(Record::new(ProtocolId::Redis, 0));
        assert_eq!(STATS.events_dropped.get(), before + 1);
    }
}
