//! Outbound side: publishes events to the shared topic exchange.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::broker::{
    BrokerConnector, ChannelHandle, ExchangeKind, ExchangeOptions, PublishOptions, Session,
};
use crate::error::{PermLogError, Result};
use crate::topology::{PermLogEvent, PERM_LOG_EXCHANGE};

/// Owns one connection and one channel to the broker for publishing.
///
/// Uninitialized until [`init`](Self::init) succeeds; [`clear_all`](Self::clear_all)
/// returns it to that state.
pub struct EventPublisher {
    connector: Arc<dyn BrokerConnector>,
    session: Option<Session>,
}

impl EventPublisher {
    /// Publisher backed by RabbitMQ.
    #[cfg(feature = "amqp")]
    pub fn new() -> Self {
        Self::with_connector(Arc::new(crate::broker::LapinConnector::new()))
    }

    pub fn with_connector(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            session: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    /// Connect, open a channel, and declare the exchange.
    ///
    /// Returns the existing channel without touching the broker when already
    /// initialized.
    pub async fn init(&mut self, url: &str) -> Result<ChannelHandle> {
        if let Some(session) = &self.session {
            debug!("Publisher already initialized");
            return Ok(Arc::clone(&session.channel));
        }

        let session = Session::open(self.connector.as_ref(), url)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to open publisher channel");
                PermLogError::init(e)
            })?;

        let declared = session
            .channel
            .declare_exchange(
                PERM_LOG_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeOptions { durable: true },
            )
            .await;

        if let Err(e) = declared {
            error!(error = %e, exchange = %PERM_LOG_EXCHANGE, "Failed to declare exchange");
            session.close().await;
            return Err(PermLogError::init(e));
        }

        info!(exchange = %PERM_LOG_EXCHANGE, "Publisher initialized");

        let channel = Arc::clone(&session.channel);
        self.session = Some(session);
        Ok(channel)
    }

    /// Publish `payload` under `routing_key`.
    ///
    /// Makes a single attempt. Returns whether the broker accepted the
    /// message into its buffers.
    pub async fn publish_message(
        &self,
        routing_key: PermLogEvent,
        payload: &[u8],
        options: Option<PublishOptions>,
    ) -> Result<bool> {
        let session = self.session.as_ref().ok_or(PermLogError::NotInitialized)?;

        if routing_key.is_wildcard() {
            return Err(PermLogError::InvalidRoutingKey(routing_key.to_string()));
        }

        let options = options.unwrap_or_default();
        let accepted = session
            .channel
            .publish(PERM_LOG_EXCHANGE, routing_key.as_str(), payload, &options)
            .await
            .map_err(|e| {
                error!(routing_key = %routing_key, error = %e, "Publish failed");
                PermLogError::from(e)
            })?;

        debug!(
            exchange = %PERM_LOG_EXCHANGE,
            routing_key = %routing_key,
            accepted,
            "Published event"
        );

        Ok(accepted)
    }

    /// Serialize `payload` as JSON and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        routing_key: PermLogEvent,
        payload: &T,
        options: Option<PublishOptions>,
    ) -> Result<bool> {
        if !self.is_initialized() {
            return Err(PermLogError::NotInitialized);
        }
        let bytes = serde_json::to_vec(payload)?;
        let options = options
            .unwrap_or_default()
            .with_content_type("application/json");
        self.publish_message(routing_key, &bytes, Some(options))
            .await
    }

    /// Close the channel (best effort) and forget it.
    pub async fn clear_all(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            info!("Publisher cleared");
        }
    }
}

#[cfg(feature = "amqp")]
impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::{BrokerCall, FailPoint, MockBroker};
    use crate::error::ErrorCode;

    fn publisher(broker: &MockBroker) -> EventPublisher {
        EventPublisher::with_connector(Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn test_init_declares_durable_topic_exchange() {
        let broker = MockBroker::new();
        let mut publisher = publisher(&broker);

        publisher.init("amqp://mock").await.unwrap();

        let declares: Vec<_> = broker
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, BrokerCall::DeclareExchange { .. }))
            .collect();
        assert_eq!(
            declares,
            vec![BrokerCall::DeclareExchange {
                channel: 1,
                name: PERM_LOG_EXCHANGE.to_string(),
                kind: ExchangeKind::Topic,
                options: ExchangeOptions { durable: true },
            }]
        );
        assert!(publisher.is_initialized());
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let broker = MockBroker::new();
        let mut publisher = publisher(&broker);

        let first = publisher.init("amqp://mock").await.unwrap();
        let second = publisher.init("amqp://mock").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.connect_count().await, 1);
        assert_eq!(
            broker
                .count_calls(|c| matches!(c, BrokerCall::DeclareExchange { .. }))
                .await,
            1
        );
    }

    #[tokio::test]
    async fn test_publish_before_init_fails_without_broker_calls() {
        let broker = MockBroker::new();
        let publisher = publisher(&broker);

        let err = publisher
            .publish_message(PermLogEvent::PermRequested, b"{}", None)
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::RabbitNotInitialized);
        assert!(broker.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_returns_broker_accept_signal() {
        let broker = MockBroker::new();
        let mut publisher = publisher(&broker);
        publisher.init("amqp://mock").await.unwrap();

        let accepted = publisher
            .publish_message(PermLogEvent::PermRequested, br#"{"test":"content"}"#, None)
            .await
            .unwrap();
        assert!(accepted);

        broker.set_publish_rejected(true).await;
        let accepted = publisher
            .publish_message(PermLogEvent::PermRequested, b"again", None)
            .await
            .unwrap();
        assert!(!accepted);
    }

    #[tokio::test]
    async fn test_publish_defaults_options_when_absent() {
        let broker = MockBroker::new();
        let mut publisher = publisher(&broker);
        publisher.init("amqp://mock").await.unwrap();

        publisher
            .publish_message(PermLogEvent::PermFetched, b"x", None)
            .await
            .unwrap();

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        let (exchange, routing_key, payload, options) = &published[0];
        assert_eq!(exchange, PERM_LOG_EXCHANGE);
        assert_eq!(routing_key, "Perm.Fetched");
        assert_eq!(payload, b"x");
        assert_eq!(options, &PublishOptions::default());
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcard_routing_key() {
        let broker = MockBroker::new();
        let mut publisher = publisher(&broker);
        publisher.init("amqp://mock").await.unwrap();

        let err = publisher
            .publish_message(PermLogEvent::PermAll, b"x", None)
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::RabbitInvalidRoutingKey);
        assert!(broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_single_attempt() {
        let broker = MockBroker::new();
        let mut publisher = publisher(&broker);
        publisher.init("amqp://mock").await.unwrap();
        broker.fail_on(FailPoint::Publish).await;

        let result = publisher
            .publish_message(PermLogEvent::PermCalculated, b"x", None)
            .await;

        assert!(result.is_err());
        assert_eq!(broker.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_json_sets_content_type() {
        let broker = MockBroker::new();
        let mut publisher = publisher(&broker);
        publisher.init("amqp://mock").await.unwrap();

        publisher
            .publish_json(
                PermLogEvent::PermExplicitLog,
                &serde_json::json!({ "test": "content" }),
                Some(PublishOptions::persistent_now()),
            )
            .await
            .unwrap();

        let (_, _, payload, options) = broker.published().await.remove(0);
        assert_eq!(payload, br#"{"test":"content"}"#);
        assert!(options.persistent);
        assert!(options.timestamp_millis.is_some());
        assert_eq!(options.content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_init_failure_leaves_publisher_uninitialized() {
        let broker = MockBroker::new();
        broker.fail_on(FailPoint::DeclareExchange).await;
        let mut publisher = publisher(&broker);

        let err = publisher.init("amqp://mock").await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::RabbitInit);
        assert!(!publisher.is_initialized());
        // The partially built channel is discarded.
        assert_eq!(
            broker
                .count_calls(|c| matches!(c, BrokerCall::CloseChannel { .. }))
                .await,
            1
        );

        broker.clear_failures().await;
        publisher.init("amqp://mock").await.unwrap();
        assert!(publisher.is_initialized());
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_init_error() {
        let broker = MockBroker::new();
        broker.fail_on(FailPoint::Connect).await;
        let mut publisher = publisher(&broker);

        let err = publisher.init("amqp://mock").await.unwrap_err();

        assert!(matches!(err, PermLogError::Init { .. }));
        assert!(err.data().unwrap().contains("connection"));
    }

    #[tokio::test]
    async fn test_clear_all_resets_and_swallows_close_errors() {
        let broker = MockBroker::new();
        let mut publisher = publisher(&broker);
        publisher.init("amqp://mock").await.unwrap();

        broker.fail_on(FailPoint::CloseChannel).await;
        publisher.clear_all().await;
        assert!(!publisher.is_initialized());

        broker.clear_failures().await;
        publisher.init("amqp://mock").await.unwrap();
        assert_eq!(broker.connect_count().await, 2);
        assert_eq!(
            broker
                .count_calls(|c| matches!(c, BrokerCall::DeclareExchange { .. }))
                .await,
            2
        );
    }

    #[tokio::test]
    async fn test_clear_all_on_uninitialized_is_noop() {
        let broker = MockBroker::new();
        let mut publisher = publisher(&broker);

        publisher.clear_all().await;

        assert!(broker.calls().await.is_empty());
    }
}
