//! Analyzer configuration.
//!
//! Deserialized from a TOML file via [`load_config`]. Every section and field
//! is optional; omitted fields take the documented defaults, and a protocol
//! section that is omitted entirely leaves that protocol disabled (no ports
//! registered). Unknown fields are rejected so typos fail at startup rather
//! than silently disabling behavior.

use std::fs;
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config field `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Parses duration strings of the form `300ms`, `10s`, or `2m` into
/// milliseconds.
fn de_duration<'de, D>(de: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(de)?;
    parse_duration(&s).map_err(D::Error::custom)
}

fn parse_duration(s: &str) -> Result<u64, String> {
    let (num, unit) = s
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| s.split_at(i))
        .ok_or_else(|| format!("duration `{}` is missing a unit (ms, s, m)", s))?;
    let n: u64 = num
        .parse()
        .map_err(|_| format!("invalid duration value `{}`", s))?;
    match unit {
        "ms" => Ok(n),
        "s" => Ok(n * 1_000),
        "m" => Ok(n * 60_000),
        _ => Err(format!("unknown duration unit `{}` in `{}`", unit, s)),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub protocols: Protocols,
}

impl Default for Config {
    /// Programmatic default: all protocols enabled on their well-known ports.
    fn default() -> Self {
        Config {
            runtime: RuntimeConfig::default(),
            protocols: Protocols::all_enabled(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "runtime.workers",
                reason: "must be at least 1".into(),
            });
        }
        if self.runtime.sampling == 0 {
            return Err(ConfigError::Invalid {
                field: "runtime.sampling",
                reason: "must be at least 1".into(),
            });
        }
        if self.runtime.stream_buffer < 1024 {
            return Err(ConfigError::Invalid {
                field: "runtime.stream_buffer",
                reason: "must be at least 1024 bytes".into(),
            });
        }
        if self.protocols.enabled_count() == 0 {
            log::warn!("no protocol sections configured, nothing will be analyzed");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    /// Number of worker threads packets are partitioned across.
    pub workers: usize,
    /// Maximum live flows per worker before oldest-first eviction.
    pub max_flows: usize,
    /// Reassembly buffer cap, bytes per flow direction.
    pub stream_buffer: usize,
    /// Per-worker packet queue depth.
    pub queue_size: usize,
    /// Publisher channel high-water mark.
    pub publish_queue: usize,
    /// Sampling factor copied into each record's `count` field.
    pub sampling: u32,
    /// Hard deadline for the shutdown drain.
    #[serde(deserialize_with = "de_duration")]
    pub shutdown_timeout: u64,
    /// Interval between flow-expiry sweeps.
    #[serde(deserialize_with = "de_duration")]
    pub sweep_interval: u64,
    /// Emit wall-clock idle ticks to workers (disable for deterministic
    /// offline replay).
    pub tick: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            workers: 4,
            max_flows: 65535,
            stream_buffer: 64 * 1024,
            queue_size: 4096,
            publish_queue: 8192,
            sampling: 1,
            shutdown_timeout: 5_000,
            sweep_interval: 1_000,
            tick: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Protocols {
    pub http: Option<HttpConfig>,
    pub mysql: Option<MysqlConfig>,
    pub pgsql: Option<PgsqlConfig>,
    pub redis: Option<RedisConfig>,
    pub thrift: Option<ThriftConfig>,
    pub mongodb: Option<MongodbConfig>,
    pub dns: Option<DnsConfig>,
    pub memcache: Option<MemcacheConfig>,
}

impl Protocols {
    pub fn all_enabled() -> Self {
        Protocols {
            http: Some(HttpConfig::default()),
            mysql: Some(MysqlConfig::default()),
            pgsql: Some(PgsqlConfig::default()),
            redis: Some(RedisConfig::default()),
            thrift: Some(ThriftConfig::default()),
            mongodb: Some(MongodbConfig::default()),
            dns: Some(DnsConfig::default()),
            memcache: Some(MemcacheConfig::default()),
        }
    }

    fn enabled_count(&self) -> usize {
        [
            self.http.is_some(),
            self.mysql.is_some(),
            self.pgsql.is_some(),
            self.redis.is_some(),
            self.thrift.is_some(),
            self.mongodb.is_some(),
            self.dns.is_some(),
            self.memcache.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }
}

fn d_true() -> bool {
    true
}
fn d_timeout() -> u64 {
    10_000
}
fn d_max_message() -> usize {
    10 * 1024 * 1024
}
fn d_max_pending() -> usize {
    200
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HttpConfig {
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    #[serde(deserialize_with = "de_duration")]
    pub transaction_timeout: u64,
    pub max_message_size: usize,
    pub max_pending: usize,
    /// Header names copied into `http.request_headers` / `http.response_headers`.
    pub send_headers: Vec<String>,
    pub send_all_headers: bool,
    /// Content types whose bodies are retained on the message.
    pub include_body_for: Vec<String>,
    /// Mask `Authorization` / `Proxy-Authorization` header values.
    pub redact_authorization: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            ports: vec![80, 8080, 8000, 5000, 8002],
            send_request: false,
            send_response: false,
            transaction_timeout: d_timeout(),
            max_message_size: d_max_message(),
            max_pending: d_max_pending(),
            send_headers: vec![],
            send_all_headers: false,
            include_body_for: vec![],
            redact_authorization: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MysqlConfig {
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    #[serde(deserialize_with = "de_duration")]
    pub transaction_timeout: u64,
    pub max_message_size: usize,
    pub max_pending: usize,
    /// Result-set preview: number of rows retained per response.
    pub max_rows: usize,
    /// Result-set preview: byte cap per retained row.
    pub max_row_length: usize,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        MysqlConfig {
            ports: vec![3306],
            send_request: false,
            send_response: false,
            transaction_timeout: d_timeout(),
            max_message_size: d_max_message(),
            max_pending: d_max_pending(),
            max_rows: 10,
            max_row_length: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PgsqlConfig {
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    #[serde(deserialize_with = "de_duration")]
    pub transaction_timeout: u64,
    pub max_message_size: usize,
    pub max_pending: usize,
    pub max_rows: usize,
    pub max_row_length: usize,
}

impl Default for PgsqlConfig {
    fn default() -> Self {
        PgsqlConfig {
            ports: vec![5432],
            send_request: false,
            send_response: false,
            transaction_timeout: d_timeout(),
            max_message_size: d_max_message(),
            max_pending: d_max_pending(),
            max_rows: 10,
            max_row_length: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RedisConfig {
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    #[serde(deserialize_with = "de_duration")]
    pub transaction_timeout: u64,
    pub max_message_size: usize,
    pub max_pending: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            ports: vec![6379],
            send_request: false,
            send_response: false,
            transaction_timeout: d_timeout(),
            max_message_size: d_max_message(),
            max_pending: d_max_pending(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ThriftConfig {
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    #[serde(deserialize_with = "de_duration")]
    pub transaction_timeout: u64,
    pub max_message_size: usize,
    pub max_pending: usize,
    /// Accepted for compatibility; IDL-based naming is not implemented and
    /// field IDs are always used.
    pub idl_files: Vec<String>,
    pub string_max_size: usize,
    pub collection_max_size: usize,
    pub capture_reply: bool,
    pub obfuscate_strings: bool,
}

impl Default for ThriftConfig {
    fn default() -> Self {
        ThriftConfig {
            ports: vec![9090],
            send_request: false,
            send_response: false,
            transaction_timeout: d_timeout(),
            max_message_size: d_max_message(),
            max_pending: d_max_pending(),
            idl_files: vec![],
            string_max_size: 200,
            collection_max_size: 15,
            capture_reply: d_true(),
            obfuscate_strings: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MongodbConfig {
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    #[serde(deserialize_with = "de_duration")]
    pub transaction_timeout: u64,
    pub max_message_size: usize,
    pub max_pending: usize,
    /// Number of response documents rendered into the record.
    pub max_docs: usize,
    /// Byte cap per rendered document.
    pub max_doc_length: usize,
}

impl Default for MongodbConfig {
    fn default() -> Self {
        MongodbConfig {
            ports: vec![27017],
            send_request: false,
            send_response: false,
            transaction_timeout: d_timeout(),
            max_message_size: d_max_message(),
            max_pending: d_max_pending(),
            max_docs: 10,
            max_doc_length: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DnsConfig {
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    #[serde(deserialize_with = "de_duration")]
    pub transaction_timeout: u64,
    pub max_message_size: usize,
    pub max_pending: usize,
    pub include_authorities: bool,
    pub include_additionals: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            ports: vec![53],
            send_request: false,
            send_response: false,
            transaction_timeout: d_timeout(),
            max_message_size: 64 * 1024,
            max_pending: d_max_pending(),
            include_authorities: false,
            include_additionals: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MemcacheConfig {
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    #[serde(deserialize_with = "de_duration")]
    pub transaction_timeout: u64,
    pub max_message_size: usize,
    pub max_pending: usize,
    /// Emit records for commands the parser does not recognize.
    pub parseunknown: bool,
    /// Number of values captured per message (0 disables value capture).
    pub maxvalues: usize,
    /// Byte cap per captured value.
    pub maxbytespervalue: usize,
}

impl Default for MemcacheConfig {
    fn default() -> Self {
        MemcacheConfig {
            ports: vec![11211],
            send_request: false,
            send_response: false,
            transaction_timeout: d_timeout(),
            max_message_size: d_max_message(),
            max_pending: d_max_pending(),
            parseunknown: false,
            maxvalues: 0,
            maxbytespervalue: 1024,
        }
    }
}

/// Loads and validates a configuration file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_duration_parsing() {
        assert_eq!(parse_duration("10s").unwrap(), 10_000);
        assert_eq!(parse_duration("300ms").unwrap(), 300);
        assert_eq!(parse_duration("2m").unwrap(), 120_000);
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn core_config_defaults() {
        let config = Config::default();
        assert_eq!(config.runtime.workers, 4);
        assert_eq!(config.protocols.http.as_ref().unwrap().ports[0], 80);
        assert_eq!(config.protocols.dns.as_ref().unwrap().ports, vec![53]);
        config.validate().unwrap();
    }

    #[test]
    fn core_config_from_toml() {
        let raw = r#"
            [runtime]
            workers = 2
            sweep_interval = "500ms"

            [protocols.http]
            ports = [8080]
            send_all_headers = true

            [protocols.dns]
            transaction_timeout = "2s"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.runtime.workers, 2);
        assert_eq!(config.runtime.sweep_interval, 500);
        let http = config.protocols.http.unwrap();
        assert_eq!(http.ports, vec![8080]);
        assert!(http.send_all_headers);
        assert_eq!(config.protocols.dns.unwrap().transaction_timeout, 2_000);
        assert!(config.protocols.mysql.is_none());
    }

    #[test]
    fn core_config_rejects_unknown_field() {
        let raw = r#"
            [protocols.http]
            prots = [80]
        "#;
        assert!(toml::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn core_config_rejects_zero_workers() {
        let raw = r#"
            [runtime]
            workers = 0
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
