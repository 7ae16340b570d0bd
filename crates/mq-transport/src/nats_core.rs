//! NATS Core adapter: fire-and-forget pub/sub, no ack/nak, per spec §4.1.

use std::sync::{Arc, Mutex};

use async_nats::Client as NatsClient;
use bytes::Bytes;
use futures::StreamExt;
use mq_domain::{
    mq_error, mq_info, mq_warn, new_subscription, Backend, Capabilities, Handler, Headers,
    Message, MqError, NoopAck, PublishOptions, Subscription, SubscribeOptions,
};
use tracing::instrument;

use crate::config::NatsCoreConfig;
use crate::connector::NatsConnector;

/// Live connection to a NATS Core deployment. Holds only the client handle;
/// dial/reconnect/health is the external `Connector`'s concern (spec §6).
pub struct NatsCoreTransport {
    client: NatsClient,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl NatsCoreTransport {
    pub async fn connect(config: &NatsCoreConfig) -> Result<Self, MqError> {
        mq_info!(url = %config.url, "connecting to NATS Core");
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| MqError::transport_failure(format!("nats core connect: {e}")))?;
        Ok(Self {
            client,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Builds from a caller-owned `NatsConnector` instead of dialing its own
    /// client, per spec §6's borrowed-connector seam: the connector keeps
    /// ownership (dial/reconnect/health), this transport only reads `client()`.
    pub fn from_connector(connector: &dyn NatsConnector) -> Self {
        Self {
            client: connector.client().clone(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::NATS_CORE
    }

    #[instrument(skip(self, data), fields(topic = %topic))]
    pub async fn publish(
        &self,
        topic: &str,
        data: Bytes,
        opts: &PublishOptions,
    ) -> Result<(), MqError> {
        if opts.headers.is_empty() {
            self.client
                .publish(topic.to_string(), data)
                .await
                .map_err(|e| MqError::transport_failure(format!("nats core publish: {e}")))?;
        } else {
            let mut headers = async_nats::HeaderMap::new();
            for (k, v) in opts.headers.iter() {
                headers.insert(k, v);
            }
            self.client
                .publish_with_headers(topic.to_string(), headers, data)
                .await
                .map_err(|e| MqError::transport_failure(format!("nats core publish: {e}")))?;
        }
        Ok(())
    }

    /// Subscribes, optionally as part of a queue group (competing consumers
    /// across processes sharing the same group name). There is no ack/nak:
    /// the auto-ack-nak middleware is a no-op here because `Capabilities`
    /// reports `supports_ack: false`.
    pub async fn subscribe(
        &self,
        topic: &str,
        opts: SubscribeOptions,
        handler: Handler,
    ) -> Result<Subscription, MqError> {
        opts.validate()?;
        let mut subscriber = match &opts.queue_group {
            Some(group) => self
                .client
                .queue_subscribe(topic.to_string(), group.clone())
                .await
                .map_err(|e| MqError::transport_failure(format!("nats core subscribe: {e}")))?,
            None => self
                .client
                .subscribe(topic.to_string())
                .await
                .map_err(|e| MqError::transport_failure(format!("nats core subscribe: {e}")))?,
        };

        let (sub, ctrl) = new_subscription();
        let topic_owned = topic.to_string();
        let stop = ctrl.cancellation_token();

        tokio::spawn(async move {
            ctrl.mark_running();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    next = subscriber.next() => {
                        match next {
                            Some(raw) => {
                                let headers = raw
                                    .headers
                                    .map(|h| {
                                        h.iter()
                                            .map(|(k, v)| (k.to_string(), v.iter().next().map(|v| v.to_string()).unwrap_or_default()))
                                            .collect::<Headers>()
                                    })
                                    .unwrap_or_default();
                                let msg = Message::new(
                                    topic_owned.clone(),
                                    raw.payload,
                                    headers,
                                    "",
                                    Backend::NatsCore,
                                    stop.clone(),
                                    Arc::new(NoopAck),
                                );
                                if let Err(err) = handler(msg).await {
                                    mq_error!(topic = %topic_owned, %err, "handler returned error for nats core delivery");
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            let _ = subscriber.unsubscribe().await;
            mq_warn!(topic = %topic_owned, "nats core subscriber loop exiting");
            ctrl.mark_draining();
            ctrl.mark_done();
        });

        self.subscriptions.lock().unwrap().push(sub.clone());
        Ok(sub)
    }

    /// Does not close the shared NATS client (borrowed, per spec §3
    /// Ownership); waits for every subscription this transport created to
    /// observe `done` before returning.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_disallow_ack_and_nak() {
        // Constructed without connecting: capabilities() does not touch the network.
        let caps = Capabilities::NATS_CORE;
        assert!(!caps.supports_ack);
        assert!(!caps.supports_nak);
        assert!(caps.supports_queue_group);
    }
}
