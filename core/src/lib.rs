//! Passive application-layer network traffic analysis.
//!
//! flowscope-core consumes captured frames, reassembles TCP streams and UDP
//! conversations, parses a fixed set of application protocols (HTTP, MySQL,
//! PostgreSQL, Redis, Thrift-RPC, MongoDB, DNS, Memcache), correlates each
//! request with its response, and emits one structured record per
//! transaction to a downstream sink.
//!
//! The capture layer is external: anything that can call
//! [`Runtime::deliver`] with a timestamp, a link type and the raw frame
//! bytes can drive the analyzer, live or from a pcap file.

pub mod config;
pub mod conntrack;
pub mod protocols;
pub mod publish;
pub mod runtime;
pub mod stats;
mod transactions;

pub use crate::config::{load_config, Config, ConfigError};
pub use crate::conntrack::conn_id::FiveTuple;
pub use crate::protocols::packet::LinkType;
pub use crate::protocols::ProtocolId;
pub use crate::publish::{CollectSink, JsonlSink, Publisher, Record, Sink, Status};
pub use crate::runtime::Runtime;
pub use crate::stats::STATS;
