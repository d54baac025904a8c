//! Application-layer protocol parsing.
//!
//! Every protocol implements [`L7Parser`] over a per-flow state struct; the
//! [`FlowParser`] enum dispatches the reassembler's callbacks to the right
//! one. Parsers are incremental and restartable: each `parse` call either
//! consumes a whole number of messages, asks for more data, or declares the
//! flow unrecoverable. Within a flow, callbacks are strictly serialized, so
//! parser state needs no internal locking.

pub mod dns;
pub mod http;
pub mod memcache;
pub mod mongodb;
pub mod mysql;
pub mod pgsql;
pub mod redis;
pub mod thrift;

use self::dns::DnsFlow;
use self::http::HttpFlow;
use self::memcache::MemcacheFlow;
use self::mongodb::MongodbFlow;
use self::mysql::MysqlFlow;
use self::pgsql::PgsqlFlow;
use self::redis::RedisFlow;
use self::thrift::ThriftFlow;
use crate::config::{Config, ConfigError};
use crate::conntrack::conn_id::{Dir, FiveTuple};
use crate::conntrack::pdu::Transport;
use crate::conntrack::stream_buf::StreamBuf;
use crate::protocols::ProtocolId;
use crate::publish::Publisher;

use std::collections::HashMap;
use std::sync::Arc;

/// Result of one parse attempt on a direction's stream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseVerdict {
    /// Consumed at least one message; call again on the remaining bytes.
    Progress,
    /// Cannot make progress until more bytes arrive; buffer retained.
    NeedMore,
    /// Unrecoverable; drop the flow and its parser state.
    Drop,
}

/// Per-callback context handed to parsers.
pub struct ParseCtx<'a> {
    pub five_tuple: &'a FiveTuple,
    /// Timestamp driving this callback (current packet, or sweep time).
    pub ts: u64,
    pub out: &'a Publisher,
}

/// The contract every protocol parser implements.
///
/// `gap` returns true when the flow should be dropped; protocols that cannot
/// resynchronize after loss take the default.
pub(crate) trait L7Parser {
    fn parse(&mut self, ctx: &ParseCtx, dir: Dir, buf: &mut StreamBuf) -> ParseVerdict;

    fn fin(&mut self, ctx: &ParseCtx, dir: Dir);

    fn gap(&mut self, ctx: &ParseCtx, dir: Dir, nbytes: u32) -> bool {
        let _ = (ctx, dir, nbytes);
        true
    }

    /// Flush pending transactions older than their timeout.
    fn expire(&mut self, ctx: &ParseCtx, now: u64) {
        let _ = (ctx, now);
    }
}

/// Per-flow parser state, one variant per protocol.
///
/// The reassembler owns this as an opaque value; only the enum knows which
/// protocol is behind it.
#[derive(Debug)]
pub(crate) enum FlowParser {
    Http(HttpFlow),
    Mysql(MysqlFlow),
    Pgsql(PgsqlFlow),
    Redis(RedisFlow),
    Thrift(ThriftFlow),
    Mongodb(MongodbFlow),
    Dns(DnsFlow),
    Memcache(MemcacheFlow),
}

impl FlowParser {
    pub(crate) fn protocol(&self) -> ProtocolId {
        match self {
            FlowParser::Http(_) => ProtocolId::Http,
            FlowParser::Mysql(_) => ProtocolId::Mysql,
            FlowParser::Pgsql(_) => ProtocolId::Pgsql,
            FlowParser::Redis(_) => ProtocolId::Redis,
            FlowParser::Thrift(_) => ProtocolId::Thrift,
            FlowParser::Mongodb(_) => ProtocolId::Mongodb,
            FlowParser::Dns(_) => ProtocolId::Dns,
            FlowParser::Memcache(_) => ProtocolId::Memcache,
        }
    }

    pub(crate) fn parse(&mut self, ctx: &ParseCtx, dir: Dir, buf: &mut StreamBuf) -> ParseVerdict {
        match self {
            FlowParser::Http(p) => p.parse(ctx, dir, buf),
            FlowParser::Mysql(p) => p.parse(ctx, dir, buf),
            FlowParser::Pgsql(p) => p.parse(ctx, dir, buf),
            FlowParser::Redis(p) => p.parse(ctx, dir, buf),
            FlowParser::Thrift(p) => p.parse(ctx, dir, buf),
            FlowParser::Mongodb(p) => p.parse(ctx, dir, buf),
            FlowParser::Dns(p) => p.parse(ctx, dir, buf),
            FlowParser::Memcache(p) => p.parse(ctx, dir, buf),
        }
    }

    pub(crate) fn fin(&mut self, ctx: &ParseCtx, dir: Dir) {
        match self {
            FlowParser::Http(p) => p.fin(ctx, dir),
            FlowParser::Mysql(p) => p.fin(ctx, dir),
            FlowParser::Pgsql(p) => p.fin(ctx, dir),
            FlowParser::Redis(p) => p.fin(ctx, dir),
            FlowParser::Thrift(p) => p.fin(ctx, dir),
            FlowParser::Mongodb(p) => p.fin(ctx, dir),
            FlowParser::Dns(p) => p.fin(ctx, dir),
            FlowParser::Memcache(p) => p.fin(ctx, dir),
        }
    }

    pub(crate) fn gap(&mut self, ctx: &ParseCtx, dir: Dir, nbytes: u32) -> bool {
        match self {
            FlowParser::Http(p) => p.gap(ctx, dir, nbytes),
            FlowParser::Mysql(p) => p.gap(ctx, dir, nbytes),
            FlowParser::Pgsql(p) => p.gap(ctx, dir, nbytes),
            FlowParser::Redis(p) => p.gap(ctx, dir, nbytes),
            FlowParser::Thrift(p) => p.gap(ctx, dir, nbytes),
            FlowParser::Mongodb(p) => p.gap(ctx, dir, nbytes),
            FlowParser::Dns(p) => p.gap(ctx, dir, nbytes),
            FlowParser::Memcache(p) => p.gap(ctx, dir, nbytes),
        }
    }

    pub(crate) fn expire(&mut self, ctx: &ParseCtx, now: u64) {
        match self {
            FlowParser::Http(p) => p.expire(ctx, now),
            FlowParser::Mysql(p) => p.expire(ctx, now),
            FlowParser::Pgsql(p) => p.expire(ctx, now),
            FlowParser::Redis(p) => p.expire(ctx, now),
            FlowParser::Thrift(p) => p.expire(ctx, now),
            FlowParser::Mongodb(p) => p.expire(ctx, now),
            FlowParser::Dns(p) => p.expire(ctx, now),
            FlowParser::Memcache(p) => p.expire(ctx, now),
        }
    }

    /// UDP surface: one datagram, one message.
    pub(crate) fn parse_udp(&mut self, ctx: &ParseCtx, dir: Dir, payload: &[u8]) {
        match self {
            FlowParser::Dns(p) => p.parse_udp(ctx, dir, payload),
            other => {
                log::debug!("udp payload for non-udp protocol {}", other.protocol());
            }
        }
    }
}

/// Shared per-protocol configuration plus the port-to-protocol table.
///
/// Built once at startup; read-only afterwards.
#[derive(Debug)]
pub struct ParserRegistry {
    ports: HashMap<(Transport, u16), ProtocolId>,
    http: Option<Arc<crate::config::HttpConfig>>,
    mysql: Option<Arc<crate::config::MysqlConfig>>,
    pgsql: Option<Arc<crate::config::PgsqlConfig>>,
    redis: Option<Arc<crate::config::RedisConfig>>,
    thrift: Option<Arc<crate::config::ThriftConfig>>,
    mongodb: Option<Arc<crate::config::MongodbConfig>>,
    dns: Option<Arc<crate::config::DnsConfig>>,
    memcache: Option<Arc<crate::config::MemcacheConfig>>,
}

impl ParserRegistry {
    pub fn new(config: &Config) -> Result<ParserRegistry, ConfigError> {
        let mut registry = ParserRegistry {
            ports: HashMap::new(),
            http: config.protocols.http.clone().map(Arc::new),
            mysql: config.protocols.mysql.clone().map(Arc::new),
            pgsql: config.protocols.pgsql.clone().map(Arc::new),
            redis: config.protocols.redis.clone().map(Arc::new),
            thrift: config.protocols.thrift.clone().map(Arc::new),
            mongodb: config.protocols.mongodb.clone().map(Arc::new),
            dns: config.protocols.dns.clone().map(Arc::new),
            memcache: config.protocols.memcache.clone().map(Arc::new),
        };

        fn register(
            table: &mut HashMap<(Transport, u16), ProtocolId>,
            proto: ProtocolId,
            transports: &[Transport],
            ports: &[u16],
        ) -> Result<(), ConfigError> {
            for &port in ports {
                for &transport in transports {
                    if let Some(prev) = table.insert((transport, port), proto) {
                        if prev != proto {
                            return Err(ConfigError::Invalid {
                                field: "ports",
                                reason: format!(
                                    "{}/{} claimed by both {} and {}",
                                    transport, port, prev, proto
                                ),
                            });
                        }
                    }
                }
            }
            Ok(())
        }

        if let Some(cfg) = &config.protocols.http {
            register(&mut registry.ports, ProtocolId::Http, &[Transport::Tcp], &cfg.ports)?;
        }
        if let Some(cfg) = &config.protocols.mysql {
            register(&mut registry.ports, ProtocolId::Mysql, &[Transport::Tcp], &cfg.ports)?;
        }
        if let Some(cfg) = &config.protocols.pgsql {
            register(&mut registry.ports, ProtocolId::Pgsql, &[Transport::Tcp], &cfg.ports)?;
        }
        if let Some(cfg) = &config.protocols.redis {
            register(&mut registry.ports, ProtocolId::Redis, &[Transport::Tcp], &cfg.ports)?;
        }
        if let Some(cfg) = &config.protocols.thrift {
            register(&mut registry.ports, ProtocolId::Thrift, &[Transport::Tcp], &cfg.ports)?;
        }
        if let Some(cfg) = &config.protocols.mongodb {
            register(&mut registry.ports, ProtocolId::Mongodb, &[Transport::Tcp], &cfg.ports)?;
        }
        if let Some(cfg) = &config.protocols.dns {
            register(&mut registry.ports, ProtocolId::Dns, &[Transport::Tcp, Transport::Udp], &cfg.ports)?;
        }
        if let Some(cfg) = &config.protocols.memcache {
            register(&mut registry.ports, ProtocolId::Memcache, &[Transport::Tcp], &cfg.ports)?;
        }

        if let Some(thrift) = &registry.thrift {
            if !thrift.idl_files.is_empty() {
                log::warn!("thrift idl_files configured but IDL naming is not supported; field ids will be used");
            }
        }

        Ok(registry)
    }

    /// Resolves the protocol serving `port`, if any.
    pub fn lookup(&self, transport: Transport, port: u16) -> Option<ProtocolId> {
        self.ports.get(&(transport, port)).copied()
    }

    /// Idle timeout for flows of the given protocol.
    pub fn connection_timeout(&self, proto: ProtocolId) -> u64 {
        match proto {
            ProtocolId::Http => self.http.as_ref().map(|c| c.transaction_timeout),
            ProtocolId::Mysql => self.mysql.as_ref().map(|c| c.transaction_timeout),
            ProtocolId::Pgsql => self.pgsql.as_ref().map(|c| c.transaction_timeout),
            ProtocolId::Redis => self.redis.as_ref().map(|c| c.transaction_timeout),
            ProtocolId::Thrift => self.thrift.as_ref().map(|c| c.transaction_timeout),
            ProtocolId::Mongodb => self.mongodb.as_ref().map(|c| c.transaction_timeout),
            ProtocolId::Dns => self.dns.as_ref().map(|c| c.transaction_timeout),
            ProtocolId::Memcache => self.memcache.as_ref().map(|c| c.transaction_timeout),
        }
        .unwrap_or(10_000)
    }

    /// Creates the per-flow parser state for a newly bound flow.
    ///
    /// `client_dir` is the direction requests travel in: `Orig` when the
    /// flow was bound by destination port, `Resp` when bound reversed.
    pub(crate) fn new_flow(&self, proto: ProtocolId, client_dir: Dir) -> FlowParser {
        match proto {
            ProtocolId::Http => {
                FlowParser::Http(HttpFlow::new(self.http.clone().unwrap(), client_dir))
            }
            ProtocolId::Mysql => {
                FlowParser::Mysql(MysqlFlow::new(self.mysql.clone().unwrap(), client_dir))
            }
            ProtocolId::Pgsql => {
                FlowParser::Pgsql(PgsqlFlow::new(self.pgsql.clone().unwrap(), client_dir))
            }
            ProtocolId::Redis => {
                FlowParser::Redis(RedisFlow::new(self.redis.clone().unwrap(), client_dir))
            }
            ProtocolId::Thrift => {
                FlowParser::Thrift(ThriftFlow::new(self.thrift.clone().unwrap(), client_dir))
            }
            ProtocolId::Mongodb => {
                FlowParser::Mongodb(MongodbFlow::new(self.mongodb.clone().unwrap(), client_dir))
            }
            ProtocolId::Dns => FlowParser::Dns(DnsFlow::new(self.dns.clone().unwrap(), client_dir)),
            ProtocolId::Memcache => {
                FlowParser::Memcache(MemcacheFlow::new(self.memcache.clone().unwrap(), client_dir))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::publish::Publisher;

    use crossbeam_channel::Receiver;
    use serde_json::Value;

    /// Drives a single flow parser directly, bypassing the conntracker.
    pub(crate) struct Harness {
        pub publisher: Publisher,
        pub rx: Receiver<Value>,
        pub five_tuple: FiveTuple,
    }

    impl Harness {
        pub fn new(server_port: u16) -> Harness {
            let (tx, rx) = crossbeam_channel::bounded(1024);
            Harness {
                publisher: Publisher::new(tx, 1),
                rx,
                five_tuple: FiveTuple {
                    orig: "10.1.0.1:41000".parse().unwrap(),
                    resp: format!("10.1.0.2:{}", server_port).parse().unwrap(),
                    proto: Transport::Tcp,
                },
            }
        }

        pub fn ctx(&self, ts: u64) -> ParseCtx<'_> {
            ParseCtx {
                five_tuple: &self.five_tuple,
                ts,
                out: &self.publisher,
            }
        }

        pub fn events(&self) -> Vec<Value> {
            self.rx.try_iter().collect()
        }
    }

    /// Feeds `data` through `parse` until the parser stops making progress.
    pub(crate) fn feed(
        parser: &mut dyn L7Parser,
        ctx: &ParseCtx,
        dir: Dir,
        buf: &mut StreamBuf,
        data: &[u8],
    ) -> ParseVerdict {
        assert!(buf.push(data));
        loop {
            match parser.parse(ctx, dir, buf) {
                ParseVerdict::Progress => continue,
                verdict => return verdict,
            }
        }
    }
}
