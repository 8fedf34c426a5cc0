use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use url::Url;

use crate::transport::message::DEFAULT_MAX_LINE_LENGTH;

/// Top-level configuration settings for the application.
///
/// Includes settings for the broker server, the client runtime and logging.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub client: ClientSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Reject values the runtime would otherwise have to clamp.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.producer.retries == 0 {
            return Err(ConfigError::Message(
                "client.producer.retries must be at least 1".to_string(),
            ));
        }
        if self.client.pool.max_total == 0 {
            return Err(ConfigError::Message(
                "client.pool.max_total must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration settings for the server.
///
/// Defines the host and port the broker will bind to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5677,
        }
    }
}

/// Configuration settings for the broker engine.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub log_path: String,
    pub ack_timeout_ms: u64,
    pub scan_interval_ms: u64,
    pub poll_wait_ms: u64,
    pub max_line_length: usize,
}

impl BrokerSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(1))
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            log_path: "minimq-broker.log".to_string(),
            ack_timeout_ms: 30_000,
            scan_interval_ms: 5_000,
            poll_wait_ms: 1_000,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Configuration settings for producers and consumers.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClientSettings {
    /// Either a bare host name or a `tcp://host:port` URI.
    pub host: String,
    pub port: u16,
    pub connection_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
    pub pool: PoolSettings,
}

impl ClientSettings {
    /// Resolve the broker address. A port in a URI `host` wins over `port`.
    pub fn broker_addr(&self) -> String {
        if self.host.contains("://") {
            match Url::parse(&self.host) {
                Ok(uri) => {
                    if let Some(host) = uri.host_str() {
                        return format!("{host}:{}", uri.port().unwrap_or(self.port));
                    }
                }
                Err(e) => tracing::warn!("Client host {:?} is not a valid URI: {e}", self.host),
            }
        }
        format!("{}:{}", self.host, self.port)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5677,
            connection_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            producer: ProducerSettings::default(),
            consumer: ConsumerSettings::default(),
            pool: PoolSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProducerSettings {
    /// Total PRODUCE attempts per message, including the first. Loading
    /// rejects 0; a `Producer` built by hand treats 0 as a single attempt.
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub reply_poll_interval_ms: u64,
}

impl ProducerSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reply_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reply_poll_interval_ms)
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay_ms: 1_000,
            reply_poll_interval_ms: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConsumerSettings {
    pub enabled: bool,
    pub topic: Option<String>,
    pub poll_interval_ms: u64,
    pub reconnect_backoff_ms: u64,
}

impl ConsumerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: None,
            poll_interval_ms: 1_000,
            reconnect_backoff_ms: 5_000,
        }
    }
}

/// Bounds for the client connection pool.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_total: usize,
    pub max_idle: usize,
    pub max_wait_ms: u64,
}

impl PoolSettings {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 8,
            max_wait_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// the defaults by the `merge` methods below.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub client: Option<PartialClientSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub log_path: Option<String>,
    pub ack_timeout_ms: Option<u64>,
    pub scan_interval_ms: Option<u64>,
    pub poll_wait_ms: Option<u64>,
    pub max_line_length: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connection_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub producer: Option<PartialProducerSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub pool: Option<PartialPoolSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialProducerSettings {
    pub retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub reply_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConsumerSettings {
    pub enabled: Option<bool>,
    pub topic: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub reconnect_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPoolSettings {
    pub max_total: Option<usize>,
    pub max_idle: Option<usize>,
    pub max_wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    pub fn merge(self, default: Settings) -> Settings {
        Settings {
            server: self.server.unwrap_or_default().merge(default.server),
            broker: self.broker.unwrap_or_default().merge(default.broker),
            client: self.client.unwrap_or_default().merge(default.client),
            logging: self.logging.unwrap_or_default().merge(default.logging),
        }
    }
}

impl PartialServerSettings {
    fn merge(self, default: ServerSettings) -> ServerSettings {
        ServerSettings {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
        }
    }
}

impl PartialBrokerSettings {
    fn merge(self, default: BrokerSettings) -> BrokerSettings {
        BrokerSettings {
            log_path: self.log_path.unwrap_or(default.log_path),
            ack_timeout_ms: self.ack_timeout_ms.unwrap_or(default.ack_timeout_ms),
            scan_interval_ms: self.scan_interval_ms.unwrap_or(default.scan_interval_ms),
            poll_wait_ms: self.poll_wait_ms.unwrap_or(default.poll_wait_ms),
            max_line_length: self.max_line_length.unwrap_or(default.max_line_length),
        }
    }
}

impl PartialClientSettings {
    fn merge(self, default: ClientSettings) -> ClientSettings {
        ClientSettings {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
            connection_timeout_ms: self
                .connection_timeout_ms
                .unwrap_or(default.connection_timeout_ms),
            request_timeout_ms: self.request_timeout_ms.unwrap_or(default.request_timeout_ms),
            producer: self.producer.unwrap_or_default().merge(default.producer),
            consumer: self.consumer.unwrap_or_default().merge(default.consumer),
            pool: self.pool.unwrap_or_default().merge(default.pool),
        }
    }
}

impl PartialProducerSettings {
    fn merge(self, default: ProducerSettings) -> ProducerSettings {
        ProducerSettings {
            retries: self.retries.unwrap_or(default.retries),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(default.retry_delay_ms),
            reply_poll_interval_ms: self
                .reply_poll_interval_ms
                .unwrap_or(default.reply_poll_interval_ms),
        }
    }
}

impl PartialConsumerSettings {
    fn merge(self, default: ConsumerSettings) -> ConsumerSettings {
        ConsumerSettings {
            enabled: self.enabled.unwrap_or(default.enabled),
            topic: self.topic.or(default.topic),
            poll_interval_ms: self.poll_interval_ms.unwrap_or(default.poll_interval_ms),
            reconnect_backoff_ms: self
                .reconnect_backoff_ms
                .unwrap_or(default.reconnect_backoff_ms),
        }
    }
}

impl PartialPoolSettings {
    fn merge(self, default: PoolSettings) -> PoolSettings {
        PoolSettings {
            max_total: self.max_total.unwrap_or(default.max_total),
            max_idle: self.max_idle.unwrap_or(default.max_idle),
            max_wait_ms: self.max_wait_ms.unwrap_or(default.max_wait_ms),
        }
    }
}

impl PartialLoggingSettings {
    fn merge(self, default: LoggingSettings) -> LoggingSettings {
        LoggingSettings {
            level: self.level.unwrap_or(default.level),
        }
    }
}
