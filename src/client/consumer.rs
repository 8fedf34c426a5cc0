//! Consumer client
//!
//! Listeners are registered per topic and started together. Each one runs
//! as its own task with a loop that keeps a connection open and polls the
//! topic with CONSUME:
//! - `NO_MSG`: wait `poll_interval`, then poll again
//! - a message: decode the payload, run the handler, ACK on success
//! - a transport error: drop the connection, wait `reconnect_backoff`,
//!   reconnect and continue
//!
//! Each listener keeps one pooled connection checked out while it polls, so
//! the pool must allow at least as many connections as there are listeners.
//!
//! A handler error or panic is logged and the message is left unacknowledged,
//! so the broker redelivers it after its ACK timeout. Every wait in the loop
//! also watches the stop signal.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::message::Message;
use crate::client::connection::{ConnectionPool, TcpConnectionPool, exchange, send_line};
use crate::config::{ClientSettings, ConsumerSettings};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::{ClientError, HandlerError};

/// Message metadata handed to a handler next to its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    pub message_id: String,
    pub topic: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl From<&Message> for DeliveryContext {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            topic: message.topic.clone(),
            correlation_id: message.correlation_id.clone(),
            reply_to: message.reply_to.clone(),
        }
    }
}

type Handler =
    Arc<dyn Fn(String, DeliveryContext) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

struct Registration {
    topic: String,
    handler: Handler,
}

pub struct Consumer<P: ConnectionPool = TcpConnectionPool> {
    pool: Arc<P>,
    settings: ConsumerSettings,
    request_timeout: Duration,
    registrations: Vec<Registration>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
}

impl Consumer<TcpConnectionPool> {
    /// Build a consumer with its own connection pool.
    pub fn connect(settings: &ClientSettings) -> Self {
        Self::new(
            Arc::new(TcpConnectionPool::new(settings)),
            settings.consumer.clone(),
            settings.request_timeout(),
        )
    }
}

impl<P: ConnectionPool> Consumer<P> {
    pub fn new(pool: Arc<P>, settings: ConsumerSettings, request_timeout: Duration) -> Self {
        Self {
            pool,
            settings,
            request_timeout,
            registrations: Vec::new(),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            running: false,
        }
    }

    /// Register `handler` for `topic`. The JSON payload is decoded into `T`
    /// before the handler runs; a payload that does not decode counts as a
    /// handler failure.
    ///
    /// Takes effect at the next `start`.
    pub fn register_listener<T, F, Fut>(&mut self, topic: impl Into<String>, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, DeliveryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |content: String, ctx: DeliveryContext| {
            let handler = Arc::clone(&handler);
            async move {
                let payload: T = serde_json::from_str(&content).map_err(HandlerError::from)?;
                handler(payload, ctx).await
            }
            .boxed()
        });
        self.registrations.push(Registration {
            topic: topic.into(),
            handler: erased,
        });
    }

    /// Register `handler` on the configured default topic.
    pub fn register_default_listener<T, F, Fut>(&mut self, handler: F) -> Result<(), ClientError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, DeliveryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let Some(topic) = self.settings.topic.clone() else {
            return Err(ClientError::Config(
                "client.consumer.topic is not set".to_string(),
            ));
        };
        self.register_listener(topic, handler);
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Spawn one polling task per registered listener.
    ///
    /// Every listener holds a pooled connection while it runs, so starting
    /// more listeners than the pool can hand out fails with
    /// `ClientError::Config`.
    pub fn start(&mut self) -> Result<(), ClientError> {
        if self.running {
            return Err(ClientError::AlreadyRunning);
        }
        if !self.settings.enabled {
            info!("Consumer is disabled; no listeners started");
            return Ok(());
        }
        let listeners = self.registrations.len();
        if let Some(limit) = self.pool.max_connections().filter(|&limit| listeners > limit) {
            return Err(ClientError::Config(format!(
                "{listeners} listener(s) need as many connections but client.pool.max_total is {limit}"
            )));
        }

        self.cancel = CancellationToken::new();
        for registration in &self.registrations {
            let listener = Listener {
                topic: registration.topic.clone(),
                handler: Arc::clone(&registration.handler),
                pool: Arc::clone(&self.pool),
                poll_interval: self.settings.poll_interval(),
                reconnect_backoff: self.settings.reconnect_backoff(),
                request_timeout: self.request_timeout,
                cancel: self.cancel.child_token(),
            };
            self.tasks.push(tokio::spawn(listener.run()));
        }
        self.running = true;
        info!("Started {} listener(s)", self.tasks.len());
        Ok(())
    }

    /// Signal every listener to stop and wait for them to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Listener task ended abnormally: {e}");
            }
        }
        if self.running {
            info!("All listeners stopped");
        }
        self.running = false;
    }
}

impl<P: ConnectionPool> Drop for Consumer<P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Listener<P: ConnectionPool> {
    topic: String,
    handler: Handler,
    pool: Arc<P>,
    poll_interval: Duration,
    reconnect_backoff: Duration,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl<P: ConnectionPool> Listener<P> {
    async fn run(self) {
        info!("Listener started for topic [{}]", self.topic);

        while !self.cancel.is_cancelled() {
            let acquired = tokio::select! {
                _ = self.cancel.cancelled() => break,
                acquired = self.pool.acquire() => acquired,
            };
            let mut conn = match acquired {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(
                        "Listener for [{}] could not connect: {e}; retrying in {:?}",
                        self.topic, self.reconnect_backoff
                    );
                    self.pause(self.reconnect_backoff).await;
                    continue;
                }
            };

            let outcome = self.poll(&mut conn).await;
            // A stop can land mid-request, so the connection is never reused
            self.pool.invalidate(conn).await;

            if let Err(e) = outcome {
                warn!(
                    "Listener for [{}] lost its connection: {e}; reconnecting in {:?}",
                    self.topic, self.reconnect_backoff
                );
                self.pause(self.reconnect_backoff).await;
            }
        }

        info!("Listener stopped for topic [{}]", self.topic);
    }

    /// Poll until stopped (`Ok`) or the connection fails (`Err`).
    async fn poll(&self, conn: &mut P::Connection) -> Result<(), ClientError> {
        let consume = ClientMessage::Consume {
            topic: self.topic.clone(),
        }
        .encode();

        loop {
            let reply = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                reply = exchange(conn, &consume, self.request_timeout) => reply?,
            };

            match ServerMessage::parse_consume(&reply) {
                Ok(Some(message)) => self.deliver(conn, message).await?,
                Ok(None) => {
                    if !self.pause(self.poll_interval).await {
                        return Ok(());
                    }
                }
                Err(e) => warn!("Skipping undecodable reply on [{}]: {e}", self.topic),
            }
        }
    }

    async fn deliver(&self, conn: &mut P::Connection, message: Message) -> Result<(), ClientError> {
        let ctx = DeliveryContext::from(&message);
        let message_id = ctx.message_id.clone();
        debug!("Delivering message [{message_id}] from [{}]", self.topic);

        let outcome = AssertUnwindSafe((self.handler)(message.content, ctx))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                let ack = ClientMessage::Ack { message_id }.encode();
                send_line(conn, &ack, self.request_timeout).await
            }
            Ok(Err(e)) => {
                warn!(
                    "Handler for [{}] failed on message [{message_id}]: {e}; left for redelivery",
                    self.topic
                );
                Ok(())
            }
            Err(_) => {
                error!(
                    "Handler for [{}] panicked on message [{message_id}]; left for redelivery",
                    self.topic
                );
                Ok(())
            }
        }
    }

    /// Sleep for `duration` unless stopped first. Returns `false` if stopped.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
