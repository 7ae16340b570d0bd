//! Static per-transport capability descriptor.
//!
//! The handler pipeline and the client façade consult this record to skip
//! no-op operations (e.g. don't attempt a `nak` on a transport that cannot
//! redeliver) rather than papering over the semantic differences between
//! backends.

/// Which operations a given `Transport` instance truly supports. Cheap to
/// compute, stable for the lifetime of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_ack: bool,
    pub supports_nak: bool,
    pub supports_headers: bool,
    pub supports_queue_group: bool,
    pub supports_durable: bool,
    pub supports_batch: bool,
    pub orders_within_key: bool,
}

impl Capabilities {
    pub const NATS_CORE: Capabilities = Capabilities {
        supports_ack: false,
        supports_nak: false,
        supports_headers: true,
        supports_queue_group: true,
        supports_durable: false,
        supports_batch: false,
        orders_within_key: false,
    };

    pub const NATS_JETSTREAM: Capabilities = Capabilities {
        supports_ack: true,
        supports_nak: true,
        supports_headers: true,
        supports_queue_group: true,
        supports_durable: true,
        supports_batch: true,
        orders_within_key: false,
    };

    pub const REDIS_STREAMS: Capabilities = Capabilities {
        supports_ack: true,
        supports_nak: false,
        supports_headers: false,
        supports_queue_group: true,
        supports_durable: true,
        supports_batch: true,
        orders_within_key: true,
    };

    pub const KAFKA: Capabilities = Capabilities {
        supports_ack: true,
        supports_nak: false,
        supports_headers: true,
        supports_queue_group: true,
        supports_durable: false,
        supports_batch: true,
        orders_within_key: true,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nats_core_has_no_ack_capability() {
        assert!(!Capabilities::NATS_CORE.supports_ack);
        assert!(!Capabilities::NATS_CORE.supports_nak);
    }

    #[test]
    fn jetstream_supports_full_ack_cycle() {
        assert!(Capabilities::NATS_JETSTREAM.supports_ack);
        assert!(Capabilities::NATS_JETSTREAM.supports_nak);
        assert!(Capabilities::NATS_JETSTREAM.supports_durable);
    }

    #[test]
    fn redis_streams_has_no_nak() {
        assert!(Capabilities::REDIS_STREAMS.supports_ack);
        assert!(!Capabilities::REDIS_STREAMS.supports_nak);
    }

    #[test]
    fn kafka_orders_within_key() {
        assert!(Capabilities::KAFKA.orders_within_key);
        assert!(!Capabilities::KAFKA.supports_durable);
    }
}
