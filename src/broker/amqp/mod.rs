//! AMQP (RabbitMQ) broker client.
//!
//! Thin adapter from the broker traits onto `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, error, info};

use super::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, ChannelHandle, ConsumeOptions,
    Delivery, DeliveryStream, ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions, Result,
};

/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;

        info!("Connected to AMQP");

        Ok(Box::new(LapinConnection { connection }))
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<ChannelHandle> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to create channel: {}", e)))?;

        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(|e| BrokerError::Close(format!("Failed to close connection: {}", e)))
    }
}

struct LapinChannel {
    channel: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn build_properties(options: &PublishOptions) -> BasicProperties {
    let mut properties = BasicProperties::default();

    if options.persistent {
        properties = properties.with_delivery_mode(2); // persistent
    }

    if let Some(ts) = options.timestamp_millis {
        properties = properties.with_timestamp(ts.max(0) as u64);
    }

    if let Some(content_type) = &options.content_type {
        properties = properties.with_content_type(content_type.as_str().into());
    }

    properties
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
            timestamp: *delivery.properties.timestamp(),
            data: delivery.data,
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("QoS setup failed: {}", e)))
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare exchange: {}", e)))
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare queue: {}", e)))?;

        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to bind queue: {}", e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<bool> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                build_properties(options),
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;

        Ok(!confirmation.is_nack())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        debug!(queue = %queue, consumer_tag = %options.consumer_tag, "Consumer registered");

        let deliveries = consumer.map(|delivery| match delivery {
            Ok(delivery) => Some(Delivery::from(delivery)),
            Err(e) => {
                error!(error = %e, "Consumer delivery error");
                None
            }
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(format!("Failed to ack message: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(|e| BrokerError::Close(format!("Failed to close channel: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_options_set_delivery_mode() {
        let options = PublishOptions {
            persistent: true,
            timestamp_millis: Some(1_700_000_000_000),
            content_type: Some("application/json".to_string()),
        };
        let properties = build_properties(&options);

        assert_eq!(*properties.delivery_mode(), Some(2));
        assert_eq!(*properties.timestamp(), Some(1_700_000_000_000));
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some("application/json")
        );
    }

    #[test]
    fn test_default_options_leave_properties_empty() {
        let properties = build_properties(&PublishOptions::default());

        assert!(properties.delivery_mode().is_none());
        assert!(properties.timestamp().is_none());
        assert!(properties.content_type().is_none());
    }
}
