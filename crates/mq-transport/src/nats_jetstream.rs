//! NATS JetStream adapter: durable streams, explicit ack/nak, queue-group
//! and durable-name semantics, per spec §4.1. Grounded in this workspace's
//! existing JetStream event-bus adapter (ensure-stream-or-update, pull
//! consumer, ack/nak/term wrapper).

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConsumerConfig, AckPolicy, DeliverPolicy},
    stream::Config as StreamConfig,
    AckKind, Context as JetStreamContext,
};
use async_nats::Client as NatsClient;
use bytes::Bytes;
use futures::StreamExt;
use mq_domain::{
    mq_error, mq_info, mq_warn, new_subscription, Backend, Capabilities, DeliveryAck, Handler,
    Headers, Message, MqError, PublishOptions, Subscription, SubscribeOptions,
};
use tracing::instrument;
use ulid::Ulid;

use crate::config::JetStreamConfig;
use crate::connector::NatsConnector;

/// Derives the stream name for a topic's first dot-separated segment,
/// sanitized to the subset NATS stream names allow (alnum, `-`, `_`).
/// `orders.created` and `orders.cancelled` both land on the same stream
/// named `{prefix}orders`, mirroring how a domain's event subjects share
/// one stream in this workspace's existing adapter.
pub fn stream_name_for(prefix: &str, topic: &str) -> String {
    let first_segment = topic.split('.').next().unwrap_or(topic);
    let sanitized: String = first_segment
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{prefix}{sanitized}")
}

/// Wildcard subject filter covering every subject under a stream's segment,
/// e.g. `orders` -> `orders.>`.
fn stream_subject_filter(first_segment: &str) -> String {
    format!("{first_segment}.>")
}

/// Fixed backoff on transient poll/receive errors, per spec §4.2.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct JetStreamTransport {
    client: NatsClient,
    jetstream: JetStreamContext,
    config: JetStreamConfig,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl JetStreamTransport {
    pub async fn connect(config: &JetStreamConfig) -> Result<Self, MqError> {
        mq_info!(url = %config.url, "connecting to NATS JetStream");
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| MqError::transport_failure(format!("jetstream connect: {e}")))?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            client,
            jetstream,
            config: config.clone(),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Builds from a caller-owned `NatsConnector` instead of dialing its own
    /// client, per spec §6's borrowed-connector seam.
    pub fn from_connector(connector: &dyn NatsConnector, config: &JetStreamConfig) -> Self {
        let client = connector.client().clone();
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            config: config.clone(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::NATS_JETSTREAM
    }

    async fn ensure_stream(&self, topic: &str) -> Result<String, MqError> {
        let first_segment = topic.split('.').next().unwrap_or(topic);
        let stream_name = stream_name_for(&self.config.stream_prefix, topic);
        let subject_filter = stream_subject_filter(first_segment);

        match self.jetstream.get_stream(&stream_name).await {
            Ok(mut existing) => {
                // Merge the subject into the stream's current config in place
                // rather than constructing a fresh default one: storage class,
                // retention and limits must survive the update unchanged
                // (spec §4.1/§8 "stream add-subject preservation").
                let mut config = existing
                    .info()
                    .await
                    .map_err(|e| MqError::transport_failure(format!("get stream info: {e}")))?
                    .config
                    .clone();
                if !config.subjects.iter().any(|s| s == &subject_filter) {
                    config.subjects.push(subject_filter);
                    self.jetstream
                        .update_stream(config)
                        .await
                        .map_err(|e| MqError::transport_failure(format!("update stream: {e}")))?;
                }
            }
            Err(_) => {
                if !self.config.auto_create {
                    return Err(MqError::not_supported(format!(
                        "stream {stream_name} does not exist and auto_create is disabled"
                    )));
                }
                mq_info!(stream = %stream_name, "creating jetstream stream");
                let desired = StreamConfig {
                    name: stream_name.clone(),
                    subjects: vec![subject_filter],
                    ..Default::default()
                };
                self.jetstream
                    .create_stream(desired)
                    .await
                    .map_err(|e| MqError::transport_failure(format!("create stream: {e}")))?;
            }
        }
        Ok(stream_name)
    }

    #[instrument(skip(self, data), fields(topic = %topic))]
    pub async fn publish(
        &self,
        topic: &str,
        data: Bytes,
        opts: &PublishOptions,
    ) -> Result<(), MqError> {
        self.ensure_stream(topic).await?;
        let mut headers = async_nats::HeaderMap::new();
        for (k, v) in opts.headers.iter() {
            headers.insert(k, v);
        }
        let msg_id = Ulid::new().to_string();
        headers.insert("Nats-Msg-Id", msg_id);

        let ack = self
            .jetstream
            .publish_with_headers(topic.to_string(), headers, data)
            .await
            .map_err(|e| MqError::transport_failure(format!("jetstream publish: {e}")))?;
        ack.await
            .map_err(|e| MqError::transport_failure(format!("jetstream publish ack: {e}")))?;
        Ok(())
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        opts: SubscribeOptions,
        handler: Handler,
    ) -> Result<Subscription, MqError> {
        opts.validate()?;
        let stream_name = self.ensure_stream(topic).await?;
        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|e| MqError::transport_failure(format!("get stream: {e}")))?;

        let durable_name = opts
            .durable_identity()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("ephemeral-{}", Ulid::new()));

        let consumer_config = PullConsumerConfig {
            durable_name: Some(durable_name.clone()),
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::All,
            filter_subject: topic.to_string(),
            max_ack_pending: opts.max_in_flight.map(|n| n as i64).unwrap_or(-1),
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&durable_name, consumer_config)
            .await
            .map_err(|e| MqError::transport_failure(format!("get_or_create_consumer: {e}")))?;

        let batch_size = opts.batch_size.unwrap_or(16);
        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| MqError::transport_failure(format!("consumer messages: {e}")))?;

        let (sub, ctrl) = new_subscription();
        let topic_owned = topic.to_string();
        let stop = ctrl.cancellation_token();

        let stream_name_owned = stream_name.clone();
        tokio::spawn(async move {
            ctrl.mark_running();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    next = messages.next() => {
                        match next {
                            Some(Ok(jsm)) => {
                                let headers = jsm
                                    .headers
                                    .as_ref()
                                    .map(|h| {
                                        h.iter()
                                            .map(|(k, v)| (k.to_string(), v.iter().next().map(|v| v.to_string()).unwrap_or_default()))
                                            .collect::<Headers>()
                                    })
                                    .unwrap_or_default();
                                // Message id is `stream:streamSequence`, per spec §3/§8
                                // scenario 1 (`S-orders:1`), not the dedup header.
                                let id = match jsm.info() {
                                    Ok(info) => format!("{stream_name_owned}:{}", info.stream_sequence),
                                    Err(err) => {
                                        mq_warn!(topic = %topic_owned, %err, "could not read jetstream message info, id left empty");
                                        String::new()
                                    }
                                };
                                let payload = jsm.payload.clone();
                                let ack = Arc::new(JetStreamAck { inner: Arc::new(jsm) });
                                let msg = Message::new(
                                    topic_owned.clone(),
                                    payload,
                                    headers,
                                    id,
                                    Backend::NatsJetStream,
                                    stop.clone(),
                                    ack,
                                );
                                if let Err(err) = handler(msg).await {
                                    mq_error!(topic = %topic_owned, %err, "handler returned error for jetstream delivery");
                                }
                            }
                            Some(Err(err)) => {
                                mq_warn!(topic = %topic_owned, %err, "jetstream message stream error, backing off");
                                tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                            }
                            None => break,
                        }
                    }
                }
            }
            mq_warn!(topic = %topic_owned, batch_size, "jetstream consumer loop exiting");
            ctrl.mark_draining();
            ctrl.mark_done();
        });

        self.subscriptions.lock().unwrap().push(sub.clone());
        Ok(sub)
    }

    /// Does not close the shared NATS client; waits for every subscription
    /// this transport created to observe `done` before returning (spec §4.1).
    pub async fn close(&self) -> Result<(), MqError> {
        let subs = self.subscriptions.lock().unwrap().clone();
        for sub in &subs {
            sub.stop();
        }
        for sub in &subs {
            sub.done().await;
        }
        Ok(())
    }
}

struct JetStreamAck {
    inner: Arc<jetstream::Message>,
}

impl DeliveryAck for JetStreamAck {
    fn do_ack(&self) -> Pin<Box<dyn Future<Output = Result<(), MqError>> + Send + '_>> {
        Box::pin(async move {
            self.inner
                .ack()
                .await
                .map_err(|e| MqError::transport_failure(format!("jetstream ack: {e}")))
        })
    }

    fn do_nak(&self) -> Pin<Box<dyn Future<Output = Result<(), MqError>> + Send + '_>> {
        Box::pin(async move {
            self.inner
                .ack_with(AckKind::Nak(None))
                .await
                .map_err(|e| MqError::transport_failure(format!("jetstream nak: {e}")))
        })
    }
}
