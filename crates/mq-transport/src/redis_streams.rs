//! Redis Streams adapter: XADD/XREADGROUP/XACK for queue-group (competing
//! consumers) mode, XREAD with a per-subscriber cursor for broadcast mode
//! when no queue group is given (spec §9 Open Question, resolved in
//! SPEC_FULL.md/DESIGN.md). No corpus example ships a Redis Streams
//! adapter; the `redis` crate's raw `cmd()` builder is the ecosystem-
//! standard way to reach stream commands it has no typed wrapper for.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use mq_domain::{
    mq_error, mq_info, mq_warn, new_subscription, Backend, Capabilities, DeliveryAck, Handler,
    Headers, Message, MqError, PublishOptions, Subscription, SubscribeOptions,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use tracing::instrument;
use ulid::Ulid;

use crate::config::RedisStreamsConfig;
use crate::connector::RedisConnector;

const FIELD_PAYLOAD: &str = "payload";

pub struct RedisStreamsTransport {
    manager: ConnectionManager,
    config: RedisStreamsConfig,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl RedisStreamsTransport {
    pub async fn connect(config: &RedisStreamsConfig) -> Result<Self, MqError> {
        mq_info!(url = %config.url, "connecting to Redis Streams");
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| MqError::invalid_config(format!("invalid redis url: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| MqError::transport_failure(format!("redis connect: {e}")))?;
        Ok(Self {
            manager,
            config: config.clone(),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Builds from a caller-owned `RedisConnector` instead of dialing its
    /// own connection manager, per spec §6's borrowed-connector seam.
    pub fn from_connector(connector: &dyn RedisConnector, config: &RedisStreamsConfig) -> Self {
        Self {
            manager: connector.manager().clone(),
            config: config.clone(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::REDIS_STREAMS
    }

    #[instrument(skip(self, data), fields(topic = %topic))]
    pub async fn publish(
        &self,
        topic: &str,
        data: Bytes,
        _opts: &PublishOptions,
    ) -> Result<(), MqError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(topic);
        if let Some(max_len) = self.config.max_length {
            cmd.arg("MAXLEN");
            if self.config.approximate_trim {
                cmd.arg("~");
            }
            cmd.arg(max_len);
        }
        cmd.arg("*").arg(FIELD_PAYLOAD).arg(data.to_vec());
        let _id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| MqError::transport_failure(format!("xadd: {e}")))?;
        Ok(())
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        opts: SubscribeOptions,
        handler: Handler,
    ) -> Result<Subscription, MqError> {
        opts.validate()?;
        let batch_size = opts.batch_size.unwrap_or(16);
        let sub = match &opts.queue_group {
            Some(group) => {
                self.subscribe_group(topic, group.clone(), handler, batch_size).await?
            }
            None => self.subscribe_broadcast(topic, handler, batch_size).await?,
        };
        self.subscriptions.lock().unwrap().push(sub.clone());
        Ok(sub)
    }

    /// Competing consumers within `group`: ensures the consumer group exists
    /// (creating the stream with `MKSTREAM` if needed), then loops
    /// XREADGROUP + dispatch + (auto-ack middleware calls) XACK.
    async fn subscribe_group(
        &self,
        topic: &str,
        group: String,
        handler: Handler,
        batch_size: usize,
    ) -> Result<Subscription, MqError> {
        let mut conn = self.manager.clone();
        let consumer_name = format!("consumer-{}", Ulid::new());

        let created: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(&group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(e) = created {
            // BUSYGROUP means the group already exists, which is fine.
            if !e.to_string().contains("BUSYGROUP") {
                return Err(MqError::transport_failure(format!("xgroup create: {e}")));
            }
        }

        let (sub, ctrl) = new_subscription();
        let topic_owned = topic.to_string();
        let stop = ctrl.cancellation_token();
        let block_ms = self.config.block_timeout_ms;
        let manager = self.manager.clone();

        tokio::spawn(async move {
            ctrl.mark_running();
            let mut conn = manager;
            loop {
                if stop.is_cancelled() {
                    break;
                }
                let result: RedisResult<
                    Vec<(String, Vec<(String, Vec<(String, Vec<u8>)>)>)>,
                > = redis::cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(&group)
                    .arg(&consumer_name)
                    .arg("BLOCK")
                    .arg(block_ms)
                    .arg("COUNT")
                    .arg(batch_size)
                    .arg("STREAMS")
                    .arg(&topic_owned)
                    .arg(">")
                    .query_async(&mut conn)
                    .await;

                match result {
                    Ok(streams) => {
                        for (_stream_name, entries) in streams {
                            for (entry_id, fields) in entries {
                                let data = fields
                                    .into_iter()
                                    .find(|(k, _)| k == FIELD_PAYLOAD)
                                    .map(|(_, v)| v)
                                    .unwrap_or_default();
                                let ack = Arc::new(RedisAck {
                                    manager: conn.clone(),
                                    stream: topic_owned.clone(),
                                    group: group.clone(),
                                    entry_id: entry_id.clone(),
                                });
                                let msg = Message::new(
                                    topic_owned.clone(),
                                    Bytes::from(data),
                                    Headers::new(),
                                    entry_id,
                                    Backend::RedisStreams,
                                    stop.clone(),
                                    ack,
                                );
                                if let Err(err) = handler(msg).await {
                                    mq_error!(topic = %topic_owned, %err, "handler returned error for redis delivery");
                                }
                            }
                        }
                    }
                    Err(err) => {
                        mq_warn!(topic = %topic_owned, %err, "xreadgroup failed, backing off");
                        tokio::time::sleep(Duration::from_millis(block_ms.min(1000))).await;
                    }
                }
            }
            mq_warn!(topic = %topic_owned, group = %group, "redis group consumer loop exiting");
            ctrl.mark_draining();
            ctrl.mark_done();
        });

        Ok(sub)
    }

    /// No queue group: every subscriber tracks its own cursor (starting from
    /// "new messages only", i.e. `$`) and observes every message on the
    /// stream independently of any other subscriber — broadcast, not
    /// competing consumers.
    async fn subscribe_broadcast(
        &self,
        topic: &str,
        handler: Handler,
        batch_size: usize,
    ) -> Result<Subscription, MqError> {
        let (sub, ctrl) = new_subscription();
        let topic_owned = topic.to_string();
        let stop = ctrl.cancellation_token();
        let block_ms = self.config.block_timeout_ms;
        let manager = self.manager.clone();

        tokio::spawn(async move {
            ctrl.mark_running();
            let mut conn = manager;
            let mut last_id = "$".to_string();
            loop {
                if stop.is_cancelled() {
                    break;
                }
                let result: RedisResult<
                    Vec<(String, Vec<(String, Vec<(String, Vec<u8>)>)>)>,
                > = redis::cmd("XREAD")
                    .arg("BLOCK")
                    .arg(block_ms)
                    .arg("COUNT")
                    .arg(batch_size)
                    .arg("STREAMS")
                    .arg(&topic_owned)
                    .arg(&last_id)
                    .query_async(&mut conn)
                    .await;

                match result {
                    Ok(streams) => {
                        for (_stream_name, entries) in streams {
                            for (entry_id, fields) in entries {
                                last_id = entry_id.clone();
                                let data = fields
                                    .into_iter()
                                    .find(|(k, _)| k == FIELD_PAYLOAD)
                                    .map(|(_, v)| v)
                                    .unwrap_or_default();
                                let msg = Message::new(
                                    topic_owned.clone(),
                                    Bytes::from(data),
                                    Headers::new(),
                                    entry_id,
                                    Backend::RedisStreams,
                                    stop.clone(),
                                    Arc::new(mq_domain::NoopAck),
                                );
                                if let Err(err) = handler(msg).await {
                                    mq_error!(topic = %topic_owned, %err, "handler returned error for redis broadcast delivery");
                                }
                            }
                        }
                    }
                    Err(err) => {
                        mq_warn!(topic = %topic_owned, %err, "xread failed, backing off");
                        tokio::time::sleep(Duration::from_millis(block_ms.min(1000))).await;
                    }
                }
            }
            mq_warn!(topic = %topic_owned, "redis broadcast consumer loop exiting");
            ctrl.mark_draining();
            ctrl.mark_done();
        });

        Ok(sub)
    }

    /// Does not close the shared connection manager; waits for every
    /// subscription this transport created to observe `done` (spec §4.1).
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

struct RedisAck {
    manager: ConnectionManager,
    stream: String,
    group: String,
    entry_id: String,
}

impl DeliveryAck for RedisAck {
    fn do_ack(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), MqError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = conn
                .xack(&self.stream, &self.group, &[&self.entry_id])
                .await
                .map_err(|e| MqError::transport_failure(format!("xack: {e}")))?;
            Ok(())
        })
    }

    /// Redis Streams has no negative-ack primitive: a failed delivery simply
    /// stays pending and is eventually reclaimed by XCLAIM/XAUTOCLAIM, which
    /// is out of this crate's scope. `Capabilities::REDIS_STREAMS.supports_nak`
    /// is `false` so the pipeline never calls this in practice.
    fn do_nak(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), MqError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_have_no_nak_but_do_have_ack() {
        let caps = Capabilities::REDIS_STREAMS;
        assert!(caps.supports_ack);
        assert!(!caps.supports_nak);
        assert!(!caps.supports_headers);
    }
}
