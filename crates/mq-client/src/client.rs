//! The public `Client` façade, per spec §4.4.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use mq_domain::metrics::{names, Labels};
use mq_domain::{
    compose, dead_letter, handler_fn, mq_debug, mq_error, recover, Handler, Headers, Message,
    Middleware, MqError, NoopMetrics, PublishOptions, Subscription, SubscribeOptions,
};
use mq_domain::pipeline::{auto_ack_nak, BoxFuture, Publisher};
use mq_domain::MetricsSink;
use mq_transport::{MqConfig, Transport};
use tokio::sync::mpsc;

use crate::chan::forwarding_handler;

/// Lets the dead-letter middleware republish through the same transport
/// without holding a reference back into `Client` — the middleware closure
/// must be `'static` since it is handed to a spawned consumer loop.
struct TransportPublisher(Arc<Transport>);

impl Publisher for TransportPublisher {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        data: Bytes,
        headers: Headers,
    ) -> BoxFuture<'a, Result<(), MqError>> {
        Box::pin(async move {
            self.0
                .publish(topic, data, &PublishOptions::new().with_headers(headers))
                .await
        })
    }
}

fn driver_label(driver: mq_transport::Driver) -> &'static str {
    match driver {
        mq_transport::Driver::NatsCore => "nats_core",
        mq_transport::Driver::NatsJetstream => "nats_jetstream",
        mq_transport::Driver::RedisStreams => "redis_streams",
        mq_transport::Driver::Kafka => "kafka",
    }
}

/// Composes a transport with configuration, metrics and the default
/// middleware stack. Owns the `Transport` exclusively; the broker connector
/// it in turn borrows is never touched here (spec §3 Ownership).
pub struct Client {
    transport: Arc<Transport>,
    metrics: Arc<dyn MetricsSink>,
    driver: &'static str,
    closed: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Client {
    pub async fn new(config: MqConfig) -> Result<Self, MqError> {
        Self::with_metrics(config, Arc::new(NoopMetrics)).await
    }

    pub async fn with_metrics(
        config: MqConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, MqError> {
        config.validate()?;
        let driver = driver_label(config.driver);
        let transport = Arc::new(Transport::connect(&config).await?);
        Ok(Self {
            transport,
            metrics,
            driver,
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    fn ensure_open(&self) -> Result<(), MqError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MqError::Closed)
        } else {
            Ok(())
        }
    }

    pub async fn publish(
        &self,
        topic: &str,
        data: Bytes,
        opts: PublishOptions,
    ) -> Result<(), MqError> {
        self.ensure_open()?;
        if topic.is_empty() {
            return Err(MqError::invalid_config("topic must not be empty"));
        }
        let start = Instant::now();
        let result = self.transport.publish(topic, data, &opts).await;

        let mut labels = Labels::new();
        labels.insert("topic", topic.to_string());
        labels.insert("driver", self.driver.to_string());
        labels.insert(
            "status",
            if result.is_ok() { "ok".to_string() } else { "error".to_string() },
        );
        self.metrics.counter(names::PUBLISH_TOTAL, &labels, 1);
        self.metrics
            .histogram(names::PUBLISH_DURATION, &labels, start.elapsed().as_secs_f64());

        if let Err(err) = &result {
            mq_error!(topic = %topic, %err, "publish failed");
        }
        result
    }

    /// Builds the default pipeline — `Recover` outermost, then `AutoAckNak`,
    /// then (when `opts.dead_letter` is set) the dead-letter hook, then the
    /// caller-supplied middlewares (retry, logging, ...), then the user
    /// handler — and hands it to the transport. Dead-letter sits ahead of
    /// the caller-supplied chain so its own `ack()` on the original message,
    /// issued once attempts are exhausted, reaches the message before
    /// `AutoAckNak` would otherwise `nak()` it: whichever of the two wins
    /// the message's ack/nak compare-and-swap is final. Metrics
    /// instrumentation wraps the raw handler directly so
    /// `mq.consume.total`/`mq.handle.duration` measure every delivery and
    /// every user-handler invocation, independent of retries above it.
    pub async fn subscribe(
        &self,
        topic: &str,
        opts: SubscribeOptions,
        handler: Handler,
        middlewares: Vec<Middleware>,
    ) -> Result<Subscription, MqError> {
        self.ensure_open()?;
        opts.validate()?;

        let instrumented = self.instrument_handler(topic, handler);

        let mut chain = vec![
            recover(),
            auto_ack_nak(self.transport.capabilities(), opts.auto_ack, opts.async_ack),
        ];
        if let Some(policy) = &opts.dead_letter {
            let publisher: Arc<dyn Publisher> = Arc::new(TransportPublisher(self.transport.clone()));
            chain.push(dead_letter(policy.clone(), publisher));
        }
        chain.extend(middlewares);
        let pipeline = compose(chain, instrumented);

        let sub = self.transport.subscribe(topic, opts, pipeline).await?;
        self.subscriptions.lock().unwrap().push(sub.clone());
        Ok(sub)
    }

    fn instrument_handler(&self, topic: &str, handler: Handler) -> Handler {
        let metrics = self.metrics.clone();
        let driver = self.driver;
        let topic_owned = topic.to_string();
        handler_fn(move |msg: Message| {
            let handler = handler.clone();
            let metrics = metrics.clone();
            let topic_owned = topic_owned.clone();
            async move {
                let mut labels = Labels::new();
                labels.insert("topic", topic_owned.clone());
                labels.insert("driver", driver.to_string());
                metrics.counter(names::CONSUME_TOTAL, &labels, 1);

                let start = Instant::now();
                let result = handler(msg).await;
                metrics.histogram(names::HANDLE_DURATION, &labels, start.elapsed().as_secs_f64());
                if let Err(err) = &result {
                    mq_debug!(topic = %topic_owned, %err, "user handler returned error");
                }
                result
            }
        })
    }

    /// Wraps `subscribe` with an internally owned bounded channel. The
    /// sending half lives only inside the forwarding handler the transport's
    /// consumer-loop task holds; when that task exits (after `draining`,
    /// right before `done` fires) it drops the handler chain along with it,
    /// closing the channel exactly once — never as a side effect of `stop`.
    pub async fn subscribe_chan(
        &self,
        topic: &str,
        opts: SubscribeOptions,
        middlewares: Vec<Middleware>,
    ) -> Result<(Subscription, mpsc::Receiver<Message>), MqError> {
        let buffer_size = opts.buffer_size.unwrap_or(64);
        let (tx, rx) = mpsc::channel(buffer_size);
        let dropped = Arc::new(AtomicU64::new(0));
        let handler = forwarding_handler(tx, dropped);

        let sub = self.subscribe(topic, opts, handler, middlewares).await?;
        Ok((sub, rx))
    }

    /// Stops every subscription created by this client and waits for each
    /// to reach `done`, then closes the transport. Never closes the
    /// borrowed connector (spec §3 Ownership).
    pub async fn close(&self) -> Result<(), MqError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let subs = self.subscriptions.lock().unwrap().clone();
        for sub in &subs {
            sub.stop();
        }
        for sub in &subs {
            sub.done().await;
        }
        self.transport.close().await
    }
}
