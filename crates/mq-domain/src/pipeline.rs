//! The composable handler-middleware pipeline, per spec §4.3.
//!
//! A handler is a function `Message -> Result<(), MqError>`. A middleware is
//! a function `Handler -> Handler`. `compose(m1, .., mN)(h)` wraps so `m1`
//! is outermost: execution begins in `m1`, descends through `m2..mN`,
//! reaches `h`, and unwinds back out through the same chain.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::FutureExt;

use crate::capabilities::Capabilities;
use crate::error::MqError;
use crate::headers::Headers;
use crate::message::Message;
use crate::options::RetryConfig;
use crate::{mq_debug, mq_error};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A user (or middleware-wrapped) handler.
pub type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), MqError>> + Send + Sync>;

/// A `Handler -> Handler` decorator.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Wrap a plain async closure as a `Handler`.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MqError>> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// `compose(vec![m1, m2], inner)` returns `m1(m2(inner))`, i.e. `m1` runs
/// first and outermost.
pub fn compose(middlewares: Vec<Middleware>, inner: Handler) -> Handler {
    middlewares.into_iter().rev().fold(inner, |acc, mw| mw(acc))
}

/// Publish port the dead-letter hook needs: "publish the original payload
/// to the dlq topic using the same Client". Kept as a narrow trait so
/// `mq-domain` does not depend on the concrete `Transport`/`Client` types
/// that live in higher layers.
pub trait Publisher: Send + Sync {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        data: Bytes,
        headers: Headers,
    ) -> BoxFuture<'a, Result<(), MqError>>;
}

/// Catches panics from the inner handler, logs a structured error including
/// the topic and the recovered value, and returns `MqError::PanicRecovered`.
pub fn recover() -> Middleware {
    Arc::new(|next: Handler| {
        let next = next.clone();
        handler_fn(move |msg: Message| {
            let next = next.clone();
            let topic = msg.topic().to_string();
            async move {
                match AssertUnwindSafe(next(msg)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic_val) => {
                        let detail = panic_message(&panic_val);
                        mq_error!(topic = %topic, panic = %detail, "handler panicked, recovered");
                        Err(MqError::PanicRecovered)
                    }
                }
            }
        })
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Emits a structured debug entry on success and a structured error entry
/// on failure, preserving the returned error unchanged.
pub fn logging() -> Middleware {
    Arc::new(|next: Handler| {
        let next = next.clone();
        handler_fn(move |msg: Message| {
            let next = next.clone();
            let topic = msg.topic().to_string();
            let id = msg.id().to_string();
            async move {
                let result = next(msg).await;
                match &result {
                    Ok(()) => mq_debug!(topic = %topic, id = %id, "handler succeeded"),
                    Err(err) => mq_error!(topic = %topic, id = %id, %err, "handler failed"),
                }
                result
            }
        })
    })
}

/// Retry with exponential backoff, per §4.3. The first attempt is not
/// counted as a retry; during the backoff sleep, cancellation of the
/// message's context short-circuits to `MqError::ContextCancelled` without a
/// further attempt; the last error is returned if every attempt fails.
pub fn retry(config: RetryConfig) -> Middleware {
    Arc::new(move |next: Handler| {
        let next = next.clone();
        let config = config;
        handler_fn(move |msg: Message| {
            let next = next.clone();
            async move {
                let mut attempt = 0u32;
                loop {
                    match next(msg.clone()).await {
                        Ok(()) => return Ok(()),
                        Err(err) => {
                            if attempt >= config.max_retries {
                                return Err(err);
                            }
                            let backoff = config.backoff_for(attempt);
                            let ctx = msg.context().clone();
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = ctx.cancelled() => {
                                    return Err(MqError::ContextCancelled);
                                }
                            }
                            attempt += 1;
                        }
                    }
                }
            }
        })
    })
}

/// Default on; when off the user handler must call `ack`/`nak` explicitly.
/// Ack/nak failures are logged and never change the returned error. When
/// `async_ack` is set, the ack/nak is dispatched on a separate task so the
/// consumer loop is not blocked on it.
pub fn auto_ack_nak(capabilities: Capabilities, auto_ack: bool, async_ack: bool) -> Middleware {
    Arc::new(move |next: Handler| {
        let next = next.clone();
        handler_fn(move |msg: Message| {
            let next = next.clone();
            async move {
                let result = next(msg.clone()).await;
                if !auto_ack {
                    return result;
                }
                match &result {
                    Ok(()) => dispatch_ack(msg, async_ack, true).await,
                    Err(_) if capabilities.supports_nak => dispatch_ack(msg, async_ack, false).await,
                    Err(_) => {}
                }
                result
            }
        })
    })
}

async fn dispatch_ack(msg: Message, async_ack: bool, ack: bool) {
    let run = async move {
        let outcome = if ack { msg.ack().await } else { msg.nak().await };
        if let Err(err) = outcome {
            mq_error!(topic = %msg.topic(), %err, ack, "failed to ack/nak delivery");
        }
    };
    if async_ack {
        tokio::spawn(run);
    } else {
        run.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Backend, NoopAck};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn msg_with_id(id: &str) -> Message {
        Message::new(
            "orders.created",
            Bytes::from_static(b"hi"),
            Headers::new(),
            id,
            Backend::NatsJetStream,
            CancellationToken::new(),
            Arc::new(NoopAck),
        )
    }

    #[tokio::test]
    async fn compose_runs_outer_before_inner() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let mw1: Middleware = Arc::new(move |next: Handler| {
            let o1 = o1.clone();
            handler_fn(move |msg| {
                let o1 = o1.clone();
                let next = next.clone();
                async move {
                    o1.lock().unwrap().push("m1-enter");
                    let r = next(msg).await;
                    o1.lock().unwrap().push("m1-exit");
                    r
                }
            })
        });
        let mw2: Middleware = Arc::new(move |next: Handler| {
            let o2 = o2.clone();
            handler_fn(move |msg| {
                let o2 = o2.clone();
                let next = next.clone();
                async move {
                    o2.lock().unwrap().push("m2-enter");
                    let r = next(msg).await;
                    o2.lock().unwrap().push("m2-exit");
                    r
                }
            })
        });
        let core = handler_fn(|_msg| async { Ok(()) });
        let pipeline = compose(vec![mw1, mw2], core);
        pipeline(msg_with_id("1")).await.unwrap();
        let seq = order.lock().unwrap().clone();
        assert_eq!(seq, vec!["m1-enter", "m2-enter", "m2-exit", "m1-exit"]);
    }

    #[tokio::test]
    async fn retry_retries_until_success_then_stops() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let core = handler_fn(move |_msg| {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(MqError::handler_failure("transient"))
                } else {
                    Ok(())
                }
            }
        });
        let mw = retry(RetryConfig::new(
            5,
            Duration::from_millis(1),
            Duration::from_millis(10),
            2.0,
        ));
        let pipeline = mw(core);
        let result = pipeline(msg_with_id("1")).await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let core = handler_fn(move |_msg| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(MqError::handler_failure("always fails"))
            }
        });
        let mw = retry(RetryConfig::new(
            2,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        ));
        let pipeline = mw(core);
        let result = pipeline(msg_with_id("1")).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3); // first attempt + 2 retries
    }

    #[tokio::test]
    async fn retry_short_circuits_on_context_cancel_during_backoff() {
        let msg = msg_with_id("1");
        let ctx = msg.context().clone();
        let core = handler_fn(|_msg| async { Err(MqError::handler_failure("always")) });
        let mw = retry(RetryConfig::new(
            10,
            Duration::from_secs(5),
            Duration::from_secs(10),
            2.0,
        ));
        let pipeline = mw(core);
        let fut = pipeline(msg);
        ctx.cancel();
        let result = tokio::time::timeout(Duration::from_millis(200), fut)
            .await
            .expect("should short-circuit quickly");
        assert!(matches!(result, Err(MqError::ContextCancelled)));
    }

    #[tokio::test]
    async fn recover_converts_panic_to_sentinel_error() {
        let core: Handler = Arc::new(|_msg| Box::pin(async { panic!("boom") }));
        let pipeline = recover()(core);
        let result = pipeline(msg_with_id("1")).await;
        assert!(matches!(result, Err(MqError::PanicRecovered)));
    }

    #[tokio::test]
    async fn auto_ack_acks_on_success() {
        let core = handler_fn(|_msg| async { Ok(()) });
        let pipeline = auto_ack_nak(Capabilities::NATS_JETSTREAM, true, false)(core);
        let msg = msg_with_id("1");
        let msg2 = msg.clone();
        pipeline(msg).await.unwrap();
        assert!(msg2.ack().await.is_ok());
    }

    #[tokio::test]
    async fn auto_ack_skips_nak_when_unsupported() {
        let core = handler_fn(|_msg| async { Err(MqError::handler_failure("x")) });
        let pipeline = auto_ack_nak(Capabilities::NATS_CORE, true, false)(core);
        let result = pipeline(msg_with_id("1")).await;
        assert!(result.is_err());
    }
}
