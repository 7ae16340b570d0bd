//! The unit delivered to a handler, per spec §3.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::MqError;
use crate::headers::Headers;

/// Which backend produced a delivery. Carried for logging/metrics labels
/// only; it never changes pipeline behaviour (`Capabilities` does that).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    NatsCore,
    NatsJetStream,
    RedisStreams,
    Kafka,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::NatsCore => "nats_core",
            Backend::NatsJetStream => "nats_jetstream",
            Backend::RedisStreams => "redis_streams",
            Backend::Kafka => "kafka",
        }
    }
}

/// Per-delivery ack/nak primitive, implemented by each transport adapter.
/// This is intentionally the only trait-object seam in the crate: a single
/// delivery's ack/nak, not the whole `Transport` contract (see DESIGN.md).
pub trait DeliveryAck: Send + Sync {
    fn do_ack(&self) -> Pin<Box<dyn Future<Output = Result<(), MqError>> + Send + '_>>;
    fn do_nak(&self) -> Pin<Box<dyn Future<Output = Result<(), MqError>> + Send + '_>>;
}

/// Ack/nak implementation for backends where both are no-ops (NATS Core).
pub struct NoopAck;

impl DeliveryAck for NoopAck {
    fn do_ack(&self) -> Pin<Box<dyn Future<Output = Result<(), MqError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn do_nak(&self) -> Pin<Box<dyn Future<Output = Result<(), MqError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AckState {
    Pending = 0,
    Acked = 1,
    Naked = 2,
}

/// Immutable view of a delivered payload plus ack/nak/id operations scoped
/// to one delivery. Cheap to clone: a clone shares the same ack state and
/// cancellation context, so calling `ack`/`nak` from any clone is still
/// idempotent per delivery (used by the retry middleware to re-invoke the
/// user handler with "the same" message).
#[derive(Clone)]
pub struct Message {
    topic: String,
    data: Bytes,
    headers: Headers,
    id: String,
    backend: Backend,
    ctx: CancellationToken,
    ack_impl: Arc<dyn DeliveryAck>,
    state: Arc<AtomicU8>,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        data: Bytes,
        headers: Headers,
        id: impl Into<String>,
        backend: Backend,
        ctx: CancellationToken,
        ack_impl: Arc<dyn DeliveryAck>,
    ) -> Self {
        Self {
            topic: topic.into(),
            data,
            headers,
            id: id.into(),
            backend,
            ctx,
            ack_impl,
            state: Arc::new(AtomicU8::new(AckState::Pending as u8)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn headers(&self) -> Headers {
        self.headers.to_owned_copy()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The cancellation context the handler must honour; inherits from the
    /// subscribe call and from transport shutdown.
    pub fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    /// Acknowledge successful processing. Idempotent: a second call (or a
    /// call after the subscription has already entered `done`) returns
    /// `Ok(())` without producing broker traffic.
    pub async fn ack(&self) -> Result<(), MqError> {
        if self
            .state
            .compare_exchange(
                AckState::Pending as u8,
                AckState::Acked as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }
        self.ack_impl.do_ack().await
    }

    /// Request redelivery. Idempotent under the same rule as `ack`.
    pub async fn nak(&self) -> Result<(), MqError> {
        if self
            .state
            .compare_exchange(
                AckState::Pending as u8,
                AckState::Naked as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }
        self.ack_impl.do_nak().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingAck {
        acks: AtomicUsize,
        naks: AtomicUsize,
    }

    impl DeliveryAck for CountingAck {
        fn do_ack(&self) -> Pin<Box<dyn Future<Output = Result<(), MqError>> + Send + '_>> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn do_nak(&self) -> Pin<Box<dyn Future<Output = Result<(), MqError>> + Send + '_>> {
            self.naks.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    fn msg(ack_impl: Arc<dyn DeliveryAck>) -> Message {
        Message::new(
            "orders.created",
            Bytes::from_static(b"hello"),
            Headers::new(),
            "S-orders:1",
            Backend::NatsJetStream,
            CancellationToken::new(),
            ack_impl,
        )
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let ack_impl = Arc::new(CountingAck {
            acks: AtomicUsize::new(0),
            naks: AtomicUsize::new(0),
        });
        let m = msg(ack_impl.clone());
        m.ack().await.unwrap();
        m.ack().await.unwrap();
        assert_eq!(ack_impl.acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nak_after_ack_is_a_noop() {
        let ack_impl = Arc::new(CountingAck {
            acks: AtomicUsize::new(0),
            naks: AtomicUsize::new(0),
        });
        let m = msg(ack_impl.clone());
        m.ack().await.unwrap();
        m.nak().await.unwrap();
        assert_eq!(ack_impl.acks.load(Ordering::SeqCst), 1);
        assert_eq!(ack_impl.naks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn noop_ack_never_fails() {
        let m = msg(Arc::new(NoopAck));
        assert!(m.ack().await.is_ok());
        assert!(m.nak().await.is_ok());
    }

    #[test]
    fn message_exposes_delivery_metadata() {
        let m = msg(Arc::new(NoopAck));
        assert_eq!(m.topic(), "orders.created");
        assert_eq!(m.data(), b"hello");
        assert_eq!(m.id(), "S-orders:1");
        assert_eq!(m.backend(), Backend::NatsJetStream);
    }
}
