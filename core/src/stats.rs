//! Process-wide metrics counters.
//!
//! Counters are initialized once and shared by all workers. Every non-fatal
//! error path in the pipeline increments a counter here; nothing is discarded
//! silently.

use crate::protocols::ProtocolId;

use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use serde_json::json;

lazy_static! {
    /// The global metrics registry.
    pub static ref STATS: Stats = Stats::new();
}

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-protocol counters.
#[derive(Debug, Default)]
pub struct ProtocolStats {
    pub parse_errors: Counter,
    pub gaps: Counter,
    pub timeouts: Counter,
    pub overflows: Counter,
    pub published: Counter,
}

/// Pipeline-wide counters.
#[derive(Debug, Default)]
pub struct Stats {
    /// Frames handed to the decoder.
    pub pkts_received: Counter,
    /// Frames the decoder could not parse.
    pub pkts_dropped_decode: Counter,
    /// Packets with no matching protocol port.
    pub pkts_dropped_noflow: Counter,
    /// Flows evicted to stay under the flow cap.
    pub flows_evicted: Counter,
    /// Flows expired for inactivity.
    pub flows_timeout: Counter,
    /// Events dropped on publisher backpressure.
    pub events_dropped: Counter,
    /// Events lost after exhausting sink delivery retries.
    pub events_lost_sink: Counter,

    http: ProtocolStats,
    mysql: ProtocolStats,
    pgsql: ProtocolStats,
    redis: ProtocolStats,
    thrift: ProtocolStats,
    mongodb: ProtocolStats,
    dns: ProtocolStats,
    memcache: ProtocolStats,
}

impl Stats {
    fn new() -> Self {
        Stats::default()
    }

    pub fn protocol(&self, id: ProtocolId) -> &ProtocolStats {
        match id {
            ProtocolId::Http => &self.http,
            ProtocolId::Mysql => &self.mysql,
            ProtocolId::Pgsql => &self.pgsql,
            ProtocolId::Redis => &self.redis,
            ProtocolId::Thrift => &self.thrift,
            ProtocolId::Mongodb => &self.mongodb,
            ProtocolId::Dns => &self.dns,
            ProtocolId::Memcache => &self.memcache,
        }
    }

    /// Serializes all counters, for the end-of-run report.
    pub fn snapshot(&self) -> serde_json::Value {
        let proto = |p: &ProtocolStats| {
            json!({
                "parse_errors": p.parse_errors.get(),
                "gaps": p.gaps.get(),
                "timeouts": p.timeouts.get(),
                "overflows": p.overflows.get(),
                "published": p.published.get(),
            })
        };
        json!({
            "pkts_received": self.pkts_received.get(),
            "pkts_dropped_decode": self.pkts_dropped_decode.get(),
            "pkts_dropped_noflow": self.pkts_dropped_noflow.get(),
            "flows_evicted": self.flows_evicted.get(),
            "flows_timeout": self.flows_timeout.get(),
            "events_dropped": self.events_dropped.get(),
            "events_lost_sink": self.events_lost_sink.get(),
            "http": proto(&self.http),
            "mysql": proto(&self.mysql),
            "pgsql": proto(&self.pgsql),
            "redis": proto(&self.redis),
            "thrift": proto(&self.thrift),
            "mongodb": proto(&self.mongodb),
            "dns": proto(&self.dns),
            "memcache": proto(&self.memcache),
        })
    }

    pub fn log_summary(&self) {
        log::info!(
            "pkts received={} decode_drop={} noflow={} flows evicted={} timeout={} events dropped={} lost={}",
            self.pkts_received.get(),
            self.pkts_dropped_decode.get(),
            self.pkts_dropped_noflow.get(),
            self.flows_evicted.get(),
            self.flows_timeout.get(),
            self.events_dropped.get(),
            self.events_lost_sink.get(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_counter_inc() {
        let c = Counter::default();
        c.inc();
        c.add(3);
        assert_eq!(c.get(), 4);
    }

    #[test]
    fn core_stats_snapshot_keys() {
        let snap = STATS.snapshot();
        assert!(snap.get("pkts_received").is_some());
        assert!(snap.get("dns").unwrap().get("timeouts").is_some());
    }
}
