//! Producer client
//!
//! Sends messages to the broker with a fixed number of attempts, and
//! implements request-reply on top of PRODUCE and CONSUME.
//!
//! Retries reuse the message id, so an attempt whose reply was lost does not
//! create a second copy: the broker answers a repeated id without queuing it
//! again.
//!
//! Known limitation: a reply that arrives after `request_reply` has timed out
//! is never consumed. It stays queued on its `reply.temp.*` topic and in the
//! broker's log, and the topic is never pruned because it is not empty. Like
//! the O(log size) cost of each ACK, this is accepted for small deployments.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::message::Message;
use crate::client::connection::{ConnectionPool, TcpConnectionPool, exchange, send_line};
use crate::client::consumer::DeliveryContext;
use crate::config::{ClientSettings, ProducerSettings};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::ClientError;

/// Prefix of the per-request topic a reply is expected on.
pub const REPLY_TOPIC_PREFIX: &str = "reply.temp.";

pub struct Producer<P: ConnectionPool = TcpConnectionPool> {
    pool: Arc<P>,
    settings: ProducerSettings,
    request_timeout: Duration,
}

impl Producer<TcpConnectionPool> {
    /// Build a producer with its own connection pool.
    pub fn connect(settings: &ClientSettings) -> Self {
        Self::new(
            Arc::new(TcpConnectionPool::new(settings)),
            settings.producer.clone(),
            settings.request_timeout(),
        )
    }
}

impl<P: ConnectionPool> Producer<P> {
    pub fn new(pool: Arc<P>, settings: ProducerSettings, request_timeout: Duration) -> Self {
        Self {
            pool,
            settings,
            request_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    /// Serialize `payload` as JSON and send it to `topic`.
    pub async fn send<T>(&self, topic: &str, payload: &T) -> Result<String, ClientError>
    where
        T: Serialize + ?Sized,
    {
        let content = serde_json::to_string(payload)?;
        self.send_message(Message::new(topic, content)).await
    }

    /// Send a prebuilt message, retrying transport failures.
    ///
    /// Makes at most `retries` attempts (at least one, even when `retries`
    /// is 0) with `retry_delay` between them and returns the id the broker
    /// acknowledged.
    pub async fn send_message(&self, message: Message) -> Result<String, ClientError> {
        message.check_wire_safe()?;
        let attempts = self.settings.retries.max(1);
        let id = message.id.clone();
        let line = ClientMessage::Produce(message).encode();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.produce_once(&line, &id).await {
                Ok(acked) => {
                    debug!("Message [{id}] accepted on attempt {attempt}");
                    return Ok(acked);
                }
                Err(e) if attempt >= attempts => {
                    warn!("Giving up on message [{id}] after {attempt} attempt(s): {e}");
                    return Err(ClientError::DeliveryFailed {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!("Attempt {attempt}/{attempts} to send message [{id}] failed: {e}");
                    tokio::time::sleep(self.settings.retry_delay()).await;
                }
            }
        }
    }

    async fn produce_once(&self, line: &str, expected_id: &str) -> Result<String, ClientError> {
        let mut conn = self.pool.acquire().await?;
        match exchange(&mut conn, line, self.request_timeout).await {
            Ok(reply) if reply == expected_id => {
                self.pool.release(conn).await;
                Ok(reply)
            }
            Ok(reply) => {
                self.pool.invalidate(conn).await;
                Err(ClientError::Protocol(format!(
                    "broker answered {reply:?} to PRODUCE of [{expected_id}]"
                )))
            }
            Err(e) => {
                self.pool.invalidate(conn).await;
                Err(e)
            }
        }
    }

    /// Send `payload` to `topic` and wait for the matching reply.
    ///
    /// The reply is expected on a fresh `reply.temp.<uuid>` topic and must
    /// carry the request's correlation id. Every reply read from that topic
    /// is acknowledged, matching or not. Fails with `ClientError::Timeout`
    /// once `timeout` has passed since the request was sent.
    pub async fn request_reply<Req, Resp>(
        &self,
        topic: &str,
        payload: &Req,
        timeout: Duration,
    ) -> Result<Resp, ClientError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let correlation_id = Uuid::new_v4().to_string();
        let reply_topic = format!("{REPLY_TOPIC_PREFIX}{}", Uuid::new_v4());
        let request = Message::request(
            topic,
            serde_json::to_string(payload)?,
            correlation_id.as_str(),
            reply_topic.as_str(),
        );

        let round_trip = async {
            self.send_message(request).await?;
            self.await_reply(&reply_topic, &correlation_id).await
        };
        let content = match tokio::time::timeout(timeout, round_trip).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClientError::Timeout {
                    correlation_id,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        Ok(serde_json::from_str(&content)?)
    }

    async fn await_reply(&self, reply_topic: &str, correlation_id: &str) -> Result<String, ClientError> {
        loop {
            match self.consume_once(reply_topic).await {
                Ok(Some(message)) => {
                    self.acknowledge(&message.id).await;
                    if message.correlation_id.as_deref() == Some(correlation_id) {
                        return Ok(message.content);
                    }
                    warn!(
                        "Discarding reply [{}] on [{reply_topic}] with correlation id {:?}",
                        message.id, message.correlation_id
                    );
                    continue;
                }
                Ok(None) => {}
                Err(e) => debug!("Polling [{reply_topic}] failed: {e}"),
            }
            tokio::time::sleep(self.settings.reply_poll_interval()).await;
        }
    }

    async fn consume_once(&self, topic: &str) -> Result<Option<Message>, ClientError> {
        let line = ClientMessage::Consume {
            topic: topic.to_string(),
        }
        .encode();
        let mut conn = self.pool.acquire().await?;
        match exchange(&mut conn, &line, self.request_timeout).await {
            Ok(reply) => {
                self.pool.release(conn).await;
                Ok(ServerMessage::parse_consume(&reply)?)
            }
            Err(e) => {
                self.pool.invalidate(conn).await;
                Err(e)
            }
        }
    }

    async fn acknowledge(&self, message_id: &str) {
        let line = ClientMessage::Ack {
            message_id: message_id.to_string(),
        }
        .encode();
        let result = match self.pool.acquire().await {
            Ok(mut conn) => match send_line(&mut conn, &line, self.request_timeout).await {
                Ok(()) => {
                    self.pool.release(conn).await;
                    Ok(())
                }
                Err(e) => {
                    self.pool.invalidate(conn).await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            // The broker redelivers it to a topic nobody reads any more
            warn!("Could not acknowledge reply [{message_id}]: {e}");
        }
    }

    /// Answer a request delivered to a listener.
    ///
    /// The reply goes to `ctx.reply_to` and carries `ctx.correlation_id`.
    pub async fn reply<T>(&self, ctx: &DeliveryContext, payload: &T) -> Result<String, ClientError>
    where
        T: Serialize + ?Sized,
    {
        let Some(reply_to) = ctx.reply_to.as_deref() else {
            return Err(ClientError::Protocol(format!(
                "message [{}] has no reply-to topic",
                ctx.message_id
            )));
        };
        let mut message = Message::new(reply_to, serde_json::to_string(payload)?);
        message.correlation_id = ctx.correlation_id.clone();
        self.send_message(message).await
    }
}

impl<P: ConnectionPool> Clone for Producer<P> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            settings: self.settings.clone(),
            request_timeout: self.request_timeout,
        }
    }
}
