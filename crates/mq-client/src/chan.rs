//! `subscribeChan`'s forwarding handler, per spec §4.2/§4.4.
//!
//! The consumer loop must never block indefinitely on a full channel: when
//! the bounded channel is full, the delivery is dropped, a warning is
//! logged with the topic and the running drop count, and `ack` is not
//! issued (achieved by returning an error, which the outer auto-ack/nak
//! middleware turns into a no-op or a `nak` depending on capability).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mq_domain::{handler_fn, mq_warn, Handler, Message, MqError};
use tokio::sync::mpsc;

pub fn forwarding_handler(tx: mpsc::Sender<Message>, dropped: Arc<AtomicU64>) -> Handler {
    handler_fn(move |msg: Message| {
        let tx = tx.clone();
        let dropped = dropped.clone();
        async move {
            match tx.try_send(msg.clone()) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = dropped.fetch_add(1, Ordering::SeqCst) + 1;
                    mq_warn!(
                        topic = %msg.topic(),
                        drops = total,
                        "subscribeChan buffer full, dropping delivery without ack"
                    );
                    Err(MqError::handler_failure("subscribeChan buffer full"))
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(MqError::SubscriptionClosed),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_domain::{Backend, Headers, NoopAck};
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    fn msg() -> Message {
        Message::new(
            "orders.created",
            Bytes::from_static(b"hi"),
            Headers::new(),
            "1",
            Backend::NatsCore,
            CancellationToken::new(),
            Arc::new(NoopAck),
        )
    }

    #[tokio::test]
    async fn forwards_while_there_is_room() {
        let (tx, mut rx) = mpsc::channel(2);
        let dropped = Arc::new(AtomicU64::new(0));
        let handler = forwarding_handler(tx, dropped.clone());
        handler(msg()).await.unwrap();
        assert!(rx.recv().await.is_some());
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn drops_and_counts_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let handler = forwarding_handler(tx, dropped.clone());
        handler(msg()).await.unwrap();
        let second = handler(msg()).await;
        assert!(second.is_err());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
