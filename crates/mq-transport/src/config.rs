//! Configuration surface, per spec §6.

use mq_domain::MqError;
use serde::{Deserialize, Serialize};

/// Which backend a `Transport` talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    NatsCore,
    NatsJetstream,
    RedisStreams,
    Kafka,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsCoreConfig {
    pub url: String,
}

impl Default for NatsCoreConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JetStreamConfig {
    pub url: String,
    /// Stream name prefix; streams are named `{prefix}{sanitized-first-segment}`.
    pub stream_prefix: String,
    pub auto_create: bool,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_prefix: "S-".to_string(),
            auto_create: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStreamsConfig {
    pub url: String,
    /// XADD MAXLEN hint; `None` means unbounded.
    pub max_length: Option<usize>,
    /// Use `~` (approximate trim) rather than exact trimming.
    pub approximate_trim: bool,
    /// Poll block timeout in milliseconds for XREAD/XREADGROUP.
    pub block_timeout_ms: u64,
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_length: None,
            approximate_trim: true,
            block_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    /// Client id reported to the broker; connection/auth/TLS are owned by
    /// the external connector (out of scope here).
    pub client_id: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "mq-client".to_string(),
        }
    }
}

/// One record per MQ instance: declared driver plus its sub-record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqConfig {
    pub driver: Driver,
    #[serde(default)]
    pub nats_core: NatsCoreConfig,
    #[serde(default)]
    pub jetstream: JetStreamConfig,
    #[serde(default)]
    pub redis_streams: RedisStreamsConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
}

impl MqConfig {
    pub fn validate(&self) -> Result<(), MqError> {
        match self.driver {
            Driver::NatsCore if self.nats_core.url.is_empty() => {
                Err(MqError::invalid_config("nats_core.url must not be empty"))
            }
            Driver::NatsJetstream if self.jetstream.url.is_empty() => {
                Err(MqError::invalid_config("jetstream.url must not be empty"))
            }
            Driver::NatsJetstream if self.jetstream.stream_prefix.is_empty() => Err(
                MqError::invalid_config("jetstream.stream_prefix must not be empty"),
            ),
            Driver::RedisStreams if self.redis_streams.url.is_empty() => Err(
                MqError::invalid_config("redis_streams.url must not be empty"),
            ),
            Driver::Kafka if self.kafka.bootstrap_servers.is_empty() => Err(
                MqError::invalid_config("kafka.bootstrap_servers must not be empty"),
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_jetstream_prefix() {
        let mut cfg = MqConfig {
            driver: Driver::NatsJetstream,
            nats_core: NatsCoreConfig::default(),
            jetstream: JetStreamConfig::default(),
            redis_streams: RedisStreamsConfig::default(),
            kafka: KafkaConfig::default(),
        };
        cfg.jetstream.stream_prefix.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_configs_are_valid() {
        for driver in [
            Driver::NatsCore,
            Driver::NatsJetstream,
            Driver::RedisStreams,
            Driver::Kafka,
        ] {
            let cfg = MqConfig {
                driver,
                nats_core: NatsCoreConfig::default(),
                jetstream: JetStreamConfig::default(),
                redis_streams: RedisStreamsConfig::default(),
                kafka: KafkaConfig::default(),
            };
            assert!(cfg.validate().is_ok(), "{driver:?} default should validate");
        }
    }
}
