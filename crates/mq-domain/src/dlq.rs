//! Dead-letter hook, per spec §4.3.
//!
//! Tracks a per-message-id attempt count (best-effort, in-memory, scoped to
//! one `Client` process lifetime — see DESIGN.md's resolution of the
//! corresponding Open Question). Topics without a stable id (empty
//! `msg.id()`, e.g. plain NATS Core pub/sub) disable the feature: attempts
//! are never counted and the original error always propagates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::MqError;
use crate::message::Message;
use crate::options::DeadLetterPolicy;
use crate::pipeline::{handler_fn, Handler, Middleware, Publisher};
use crate::{mq_error, mq_warn};

/// Wraps a handler so that after `policy.max_attempts` failures for the
/// same message id, the original payload/headers are republished to
/// `policy.topic` and the original message is acked (to stop redelivery)
/// instead of being retried further. If the dead-letter publish itself
/// fails, the original is nak'd instead and the failure is logged — the
/// message is never silently dropped.
pub fn dead_letter(policy: DeadLetterPolicy, publisher: Arc<dyn Publisher>) -> Middleware {
    let attempts: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    Arc::new(move |next: Handler| {
        let next = next.clone();
        let policy = policy.clone();
        let publisher = publisher.clone();
        let attempts = attempts.clone();
        handler_fn(move |msg: Message| {
            let next = next.clone();
            let policy = policy.clone();
            let publisher = publisher.clone();
            let attempts = attempts.clone();
            async move {
                let result = next(msg.clone()).await;
                let Err(err) = result else {
                    if !msg.id().is_empty() {
                        attempts.lock().unwrap().remove(msg.id());
                    }
                    return Ok(());
                };

                if msg.id().is_empty() {
                    return Err(err);
                }

                let count = {
                    let mut guard = attempts.lock().unwrap();
                    let entry = guard.entry(msg.id().to_string()).or_insert(0);
                    *entry += 1;
                    *entry
                };

                if count < policy.max_attempts {
                    return Err(err);
                }

                attempts.lock().unwrap().remove(msg.id());
                match publisher
                    .publish(&policy.topic, msg.data().to_vec().into(), msg.headers())
                    .await
                {
                    Ok(()) => {
                        mq_warn!(
                            topic = %msg.topic(),
                            id = %msg.id(),
                            dlq = %policy.topic,
                            attempts = count,
                            "routed message to dead-letter topic after exhausting attempts"
                        );
                        if let Err(ack_err) = msg.ack().await {
                            mq_error!(id = %msg.id(), %ack_err, "failed to ack original after dlq publish");
                        }
                        Ok(())
                    }
                    Err(publish_err) => {
                        mq_error!(
                            topic = %msg.topic(),
                            id = %msg.id(),
                            %publish_err,
                            "failed to publish to dead-letter topic, nak-ing original instead"
                        );
                        let _ = msg.nak().await;
                        Err(err)
                    }
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;
    use crate::message::{Backend, NoopAck};
    use crate::pipeline::BoxFuture;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    struct RecordingPublisher {
        calls: Mutex<Vec<(String, Vec<u8>)>>,
        fail: bool,
    }

    impl Publisher for RecordingPublisher {
        fn publish<'a>(
            &'a self,
            topic: &'a str,
            data: Bytes,
            _headers: Headers,
        ) -> BoxFuture<'a, Result<(), MqError>> {
            Box::pin(async move {
                if self.fail {
                    return Err(MqError::transport_failure("dlq unavailable"));
                }
                self.calls.lock().unwrap().push((topic.to_string(), data.to_vec()));
                Ok(())
            })
        }
    }

    fn msg(id: &str) -> Message {
        Message::new(
            "orders.created",
            Bytes::from_static(b"payload"),
            Headers::new(),
            id,
            Backend::NatsJetStream,
            CancellationToken::new(),
            Arc::new(NoopAck),
        )
    }

    #[tokio::test]
    async fn routes_to_dlq_after_max_attempts_and_acks_original() {
        let publisher = Arc::new(RecordingPublisher {
            calls: Mutex::new(Vec::new()),
            fail: false,
        });
        let policy = DeadLetterPolicy {
            max_attempts: 2,
            topic: "orders.dlq".to_string(),
        };
        let core = handler_fn(|_m| async { Err(MqError::handler_failure("boom")) });
        let pipeline = dead_letter(policy, publisher.clone())(core);

        let m = msg("S-orders:1");
        let r1 = pipeline(m.clone()).await;
        assert!(r1.is_err(), "first failure should still propagate for redelivery");
        assert!(publisher.calls.lock().unwrap().is_empty());

        let r2 = pipeline(m.clone()).await;
        assert!(r2.is_ok(), "second failure reaches max_attempts and is absorbed");
        assert_eq!(publisher.calls.lock().unwrap().len(), 1);
        assert!(m.ack().await.is_ok());
    }

    #[tokio::test]
    async fn naks_original_when_dlq_publish_fails() {
        let publisher = Arc::new(RecordingPublisher {
            calls: Mutex::new(Vec::new()),
            fail: true,
        });
        let policy = DeadLetterPolicy {
            max_attempts: 1,
            topic: "orders.dlq".to_string(),
        };
        let core = handler_fn(|_m| async { Err(MqError::handler_failure("boom")) });
        let pipeline = dead_letter(policy, publisher)(core);
        let m = msg("S-orders:7");
        let result = pipeline(m).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn disabled_for_messages_without_stable_id() {
        let publisher = Arc::new(RecordingPublisher {
            calls: Mutex::new(Vec::new()),
            fail: false,
        });
        let policy = DeadLetterPolicy {
            max_attempts: 1,
            topic: "orders.dlq".to_string(),
        };
        let core = handler_fn(|_m| async { Err(MqError::handler_failure("boom")) });
        let pipeline = dead_letter(policy, publisher.clone())(core);
        let m = msg("");
        let _ = pipeline(m).await;
        let _ = pipeline(msg("")).await;
        assert!(publisher.calls.lock().unwrap().is_empty());
    }
}
