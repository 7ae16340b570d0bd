//! In-memory transport used to exercise the subscription lifecycle and the
//! handler pipeline (spec §8) without a live broker. Not a `Transport`
//! backend in its own right — the real per-backend adapters live in
//! `mq-transport` — but it wires the same primitives (`Message`,
//! `Subscription`, `compose`) the real adapters use, so properties proven
//! against it hold for them too.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};

use crate::capabilities::Capabilities;
use crate::error::MqError;
use crate::headers::Headers;
use crate::message::{Backend, DeliveryAck, Message};
use crate::options::SubscribeOptions;
use crate::pipeline::{auto_ack_nak, compose, recover, Handler, Middleware};
use crate::subscription::{new_subscription, Subscription};
use crate::mq_warn;

#[derive(Clone)]
struct Envelope {
    id: String,
    data: Bytes,
    headers: Headers,
}

struct GroupChannel {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Envelope>>>,
}

#[derive(Default)]
struct TopicState {
    broadcast: Option<broadcast::Sender<Envelope>>,
    groups: HashMap<String, GroupChannel>,
    next_seq: u64,
}

/// A self-contained, in-process stand-in for a real `Transport`.
pub struct MockTransport {
    capabilities: Capabilities,
    topics: StdMutex<HashMap<String, TopicState>>,
    acked: AtomicUsize,
    naked: AtomicUsize,
    dropped: AtomicUsize,
}

impl MockTransport {
    pub fn new(capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            topics: StdMutex::new(HashMap::new()),
            acked: AtomicUsize::new(0),
            naked: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn naked(&self) -> usize {
        self.naked.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    pub async fn publish(
        &self,
        topic: &str,
        data: Bytes,
        headers: Headers,
    ) -> Result<(), MqError> {
        if topic.is_empty() {
            return Err(MqError::invalid_config("topic must not be empty"));
        }
        let mut topics = self.topics.lock().unwrap();
        let state = topics.entry(topic.to_string()).or_default();
        state.next_seq += 1;
        let env = Envelope {
            id: format!("mock:{}", state.next_seq),
            data,
            headers,
        };
        if let Some(tx) = &state.broadcast {
            let _ = tx.send(env.clone());
        }
        for group in state.groups.values() {
            let _ = group.tx.send(env.clone());
        }
        Ok(())
    }

    /// Spawn a consumer loop dispatching deliveries through `handler`
    /// wrapped in the standard `Recover -> AutoAckNak -> user` pipeline,
    /// plus any extra middlewares the caller supplies (retry, logging,
    /// dead-letter).
    pub fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        handler: Handler,
        options: SubscribeOptions,
        extra_middlewares: Vec<Middleware>,
    ) -> Result<Subscription, MqError> {
        options.validate()?;
        // Recover is outermost; auto-ack/nak wraps the user chain so it only
        // fires once retry/dead-letter have settled on a final outcome, per
        // spec §4.3 ("outermost around the user chain but inside Recover").
        let mut middlewares = vec![recover(), auto_ack_nak(self.capabilities, options.auto_ack, options.async_ack)];
        middlewares.extend(extra_middlewares);
        let pipeline = compose(middlewares, handler);

        let buffer_size = options.buffer_size.unwrap_or(64);
        let mut rx = self.make_receiver(topic, options.queue_group.as_deref());

        let (sub, ctrl) = new_subscription();
        let this = self.clone();
        let topic_owned = topic.to_string();
        let stop = ctrl.cancellation_token();

        tokio::spawn(async move {
            ctrl.mark_running();
            let mut inflight = buffer_size;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    env = rx.recv() => {
                        let Some(env) = env else { break };
                        if inflight == 0 {
                            this.dropped.fetch_add(1, Ordering::SeqCst);
                            mq_warn!(topic = %topic_owned, "buffer full, dropping delivery without ack");
                            continue;
                        }
                        inflight -= 1;
                        let ack_impl: Arc<dyn DeliveryAck> =
                            Arc::new(MockAck::new(this.clone()));
                        let msg = Message::new(
                            topic_owned.clone(),
                            env.data,
                            env.headers,
                            env.id,
                            Backend::NatsCore,
                            stop.clone(),
                            ack_impl,
                        );
                        let _ = pipeline(msg).await;
                        inflight += 1;
                    }
                }
            }
            ctrl.mark_draining();
            ctrl.mark_done();
        });

        Ok(sub)
    }

    fn make_receiver(&self, topic: &str, queue_group: Option<&str>) -> Receiver {
        let mut topics = self.topics.lock().unwrap();
        let state = topics.entry(topic.to_string()).or_default();
        match queue_group {
            None => {
                let tx = state
                    .broadcast
                    .get_or_insert_with(|| broadcast::channel(1024).0)
                    .clone();
                Receiver::Broadcast(tx.subscribe())
            }
            Some(group) => {
                let channel = state.groups.entry(group.to_string()).or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    GroupChannel {
                        tx,
                        rx: Arc::new(AsyncMutex::new(rx)),
                    }
                });
                Receiver::Group(channel.rx.clone())
            }
        }
    }
}

enum Receiver {
    Broadcast(broadcast::Receiver<Envelope>),
    Group(Arc<AsyncMutex<mpsc::UnboundedReceiver<Envelope>>>),
}

impl Receiver {
    async fn recv(&mut self) -> Option<Envelope> {
        match self {
            Receiver::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(env) => return Some(env),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Receiver::Group(rx) => rx.lock().await.recv().await,
        }
    }
}

struct MockAck {
    transport: Arc<MockTransport>,
}

impl MockAck {
    fn new(transport: Arc<MockTransport>) -> Self {
        Self { transport }
    }
}

impl DeliveryAck for MockAck {
    fn do_ack(&self) -> Pin<Box<dyn Future<Output = Result<(), MqError>> + Send + '_>> {
        self.transport.acked.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn do_nak(&self) -> Pin<Box<dyn Future<Output = Result<(), MqError>> + Send + '_>> {
        self.transport.naked.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::handler_fn;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_then_subscribe_delivers_payload() {
        let transport = MockTransport::new(Capabilities::NATS_JETSTREAM);
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received2 = received.clone();
        let handler = handler_fn(move |msg| {
            let received = received2.clone();
            async move {
                received.lock().unwrap().push(msg.data().to_vec());
                Ok(())
            }
        });
        let sub = transport
            .subscribe("orders.created", handler, SubscribeOptions::new(), vec![])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport
            .publish("orders.created", Bytes::from_static(b"hello"), Headers::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sub.stop();
        sub.done().await;
        assert_eq!(received.lock().unwrap().as_slice(), [b"hello".to_vec()]);
        assert_eq!(transport.acked(), 1);
    }

    #[tokio::test]
    async fn queue_group_delivers_each_message_to_one_member() {
        let transport = MockTransport::new(Capabilities::NATS_JETSTREAM);
        let counts: Vec<_> = (0..3).map(|_| Arc::new(AtomicU32::new(0))).collect();
        let mut subs = Vec::new();
        for counter in &counts {
            let counter = counter.clone();
            let handler = handler_fn(move |_msg| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            let opts = SubscribeOptions::new().with_queue_group("workers");
            subs.push(
                transport
                    .subscribe("jobs", handler, opts, vec![])
                    .unwrap(),
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..10 {
            transport
                .publish("jobs", Bytes::from(format!("msg-{i}")), Headers::new())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        for sub in &subs {
            sub.stop();
        }
        for sub in &subs {
            sub.done().await;
        }
        let total: u32 = counts.iter().map(|c| c.load(Ordering::SeqCst)).sum();
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn distinct_groups_each_see_every_message() {
        let transport = MockTransport::new(Capabilities::NATS_JETSTREAM);
        let count_a = Arc::new(AtomicU32::new(0));
        let count_b = Arc::new(AtomicU32::new(0));
        let ca = count_a.clone();
        let cb = count_b.clone();
        let sub_a = transport
            .subscribe(
                "jobs",
                handler_fn(move |_m| {
                    let ca = ca.clone();
                    async move {
                        ca.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                SubscribeOptions::new().with_queue_group("team-a"),
                vec![],
            )
            .unwrap();
        let sub_b = transport
            .subscribe(
                "jobs",
                handler_fn(move |_m| {
                    let cb = cb.clone();
                    async move {
                        cb.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                SubscribeOptions::new().with_queue_group("team-b"),
                vec![],
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..5 {
            transport
                .publish("jobs", Bytes::from(format!("msg-{i}")), Headers::new())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        sub_a.stop();
        sub_b.stop();
        sub_a.done().await;
        sub_b.done().await;
        assert_eq!(count_a.load(Ordering::SeqCst), 5);
        assert_eq!(count_b.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn stop_prevents_further_handler_invocations() {
        let transport = MockTransport::new(Capabilities::NATS_JETSTREAM);
        let count = Arc::new(AtomicU32::new(0));
        let c2 = count.clone();
        let sub = transport
            .subscribe(
                "orders.created",
                handler_fn(move |_m| {
                    let c2 = c2.clone();
                    async move {
                        c2.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                SubscribeOptions::new(),
                vec![],
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        sub.stop();
        tokio::time::timeout(Duration::from_secs(2), sub.done())
            .await
            .expect("done should fire within 2 seconds");
        let after_stop = count.load(Ordering::SeqCst);
        let _ = transport
            .publish("orders.created", Bytes::from_static(b"late"), Headers::new())
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }
}
