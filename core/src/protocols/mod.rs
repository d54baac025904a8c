//! Packet-level and stream-level protocol support.

pub mod packet;
pub mod stream;

use strum_macros::{Display, EnumString};

/// Application-layer protocols the analyzer understands.
///
/// The string form of each variant is the record `type` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ProtocolId {
    Http,
    Mysql,
    Pgsql,
    Redis,
    Thrift,
    Mongodb,
    Dns,
    Memcache,
}

impl ProtocolId {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolId::Http => "http",
            ProtocolId::Mysql => "mysql",
            ProtocolId::Pgsql => "pgsql",
            ProtocolId::Redis => "redis",
            ProtocolId::Thrift => "thrift",
            ProtocolId::Mongodb => "mongodb",
            ProtocolId::Dns => "dns",
            ProtocolId::Memcache => "memcache",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn core_protocol_id_names() {
        assert_eq!(ProtocolId::Http.name(), "http");
        assert_eq!(ProtocolId::Memcache.to_string(), "memcache");
        assert_eq!(ProtocolId::from_str("pgsql").unwrap(), ProtocolId::Pgsql);
        assert!(ProtocolId::from_str("smtp").is_err());
    }
}
