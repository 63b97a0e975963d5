//! Broker connection provider.
//!
//! This module contains:
//! - `BrokerConnector` / `BrokerConnection` / `BrokerChannel` traits: the seam
//!   between the managers and the wire client
//! - Option and delivery types passed across that seam
//! - Implementations: AMQP (RabbitMQ via lapin), Mock

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::warn;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::LapinConnector;
pub use mock::MockBroker;

// ============================================================================
// Traits
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors raised by a broker client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel failed: {0}")]
    Channel(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Ack failed: {0}")]
    Ack(String),

    #[error("Close failed: {0}")]
    Close(String),
}

impl BrokerError {
    /// Short machine-readable name of the failing step.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Connection(_) => "connection",
            BrokerError::Channel(_) => "channel",
            BrokerError::Topology(_) => "topology",
            BrokerError::Publish(_) => "publish",
            BrokerError::Consume(_) => "consume",
            BrokerError::Ack(_) => "ack",
            BrokerError::Close(_) => "close",
        }
    }
}

/// Shared handle to an open channel.
pub type ChannelHandle = Arc<dyn BrokerChannel>;

/// Deliveries pushed by the broker. `None` marks an empty or malformed delivery.
pub type DeliveryStream = BoxStream<'static, Option<Delivery>>;

/// Dials connections from a connection string.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>>;
}

/// A live session to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a logical channel multiplexed over this connection.
    async fn create_channel(&self) -> Result<ChannelHandle>;

    async fn close(&self) -> Result<()>;
}

/// A logical channel: the unit topology is declared on and messages flow over.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limit the number of unacknowledged deliveries pushed to this channel.
    async fn prefetch(&self, count: u16) -> Result<()>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()>;

    /// Declare a queue, returning the name the broker assigned to it.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Publish a message. Returns `true` when the broker accepted it into its
    /// buffers; this says nothing about consumer delivery.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<bool>;

    /// Register a subscription on `queue`.
    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream>;

    /// Mark a delivery as processed.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn BrokerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BrokerChannel")
    }
}

// ============================================================================
// Options & deliveries
// ============================================================================

/// Exchange routing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
}

/// Per-message publish options. Every field is off by default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to write the message to disk.
    pub persistent: bool,
    /// Publish time in epoch milliseconds.
    pub timestamp_millis: Option<i64>,
    pub content_type: Option<String>,
}

impl PublishOptions {
    /// Persistent message stamped with the current time.
    pub fn persistent_now() -> Self {
        Self {
            persistent: true,
            timestamp_millis: Some(chrono::Utc::now().timestamp_millis()),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    /// Let the broker consider deliveries acknowledged as soon as they are sent.
    pub no_ack: bool,
}

/// One inbound message plus the handle needed to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned handle, unique per channel.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub timestamp: Option<u64>,
    pub data: Vec<u8>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, routing_key: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            exchange: String::new(),
            routing_key: routing_key.into(),
            redelivered: false,
            timestamp: None,
            data: data.into(),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A connection together with the single channel a manager opened on it.
pub(crate) struct Session {
    pub connection: Box<dyn BrokerConnection>,
    pub channel: ChannelHandle,
}

impl Session {
    /// Dial and open a channel. A connection whose channel could not be
    /// opened is closed before returning.
    pub async fn open(connector: &dyn BrokerConnector, url: &str) -> Result<Self> {
        let connection = connector.connect(url).await?;
        match connection.create_channel().await {
            Ok(channel) => Ok(Self { connection, channel }),
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "Failed to close connection after channel error");
                }
                Err(e)
            }
        }
    }

    /// Best-effort teardown. Failures are logged and swallowed.
    pub async fn close(self) {
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "Failed to close broker channel");
        }
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "Failed to close broker connection");
        }
    }
}
