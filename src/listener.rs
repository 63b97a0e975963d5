//! Inbound side: consumes a durable queue bound to event patterns.
//!
//! ## Flow
//! ```text
//! init ─► prefetch(1) ─► declare exchange ─► declare queue ─► bind patterns ─► consume
//!                                                                              │
//!            ┌─────────────────────────────────────────────────────────────────┘
//!            ▼
//!     Some(delivery) ─► on_message(delivery)   (caller acknowledges)
//!     None           ─► publish Rabbit.EmptyMessage { queueName }
//! ```
//!
//! With a prefetch of one the broker withholds the next delivery until the
//! current one is acknowledged, so a callback that never acknowledges stalls
//! the queue.

use std::sync::Arc;

use futures::future::join_all;
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{
    BrokerChannel, BrokerConnector, ChannelHandle, ConsumeOptions, Delivery, DeliveryStream,
    ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions, Session,
};
use crate::error::{PermLogError, Result};
use crate::topology::{PermLogEvent, QueueName, RabbitEmptyMessage, PERM_LOG_EXCHANGE};

/// Deliveries in flight per channel.
pub const PREFETCH_COUNT: u16 = 1;

/// Callback invoked once per accepted delivery.
pub type MessageListener = Arc<dyn Fn(Delivery) + Send + Sync>;

/// What `init` does when some event bindings fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingPolicy {
    /// Log failed bindings and finish initialization with the rest.
    #[default]
    BestEffort,
    /// Fail initialization on the first failed binding.
    RequireAll,
}

struct ListenerSession {
    session: Session,
    queue: String,
    bound: Vec<PermLogEvent>,
    consumer: JoinHandle<()>,
}

/// Everything declared on the channel before consuming starts.
struct Topology {
    queue: String,
    bound: Vec<PermLogEvent>,
    deliveries: DeliveryStream,
}

/// Owns one connection and one channel consuming a single queue.
pub struct EventListener {
    connector: Arc<dyn BrokerConnector>,
    binding_policy: BindingPolicy,
    session: Option<ListenerSession>,
}

impl EventListener {
    /// Listener backed by RabbitMQ.
    #[cfg(feature = "amqp")]
    pub fn new() -> Self {
        Self::with_connector(Arc::new(crate::broker::LapinConnector::new()))
    }

    pub fn with_connector(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            binding_policy: BindingPolicy::default(),
            session: None,
        }
    }

    pub fn with_binding_policy(mut self, policy: BindingPolicy) -> Self {
        self.binding_policy = policy;
        self
    }

    /// True while a channel is open and its consumer is still running.
    pub fn is_initialized(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|active| !active.consumer.is_finished())
    }

    /// Name of the consumed queue, once initialized.
    pub fn queue(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.queue.as_str())
    }

    /// Patterns whose binding succeeded during `init`.
    pub fn bound_events(&self) -> &[PermLogEvent] {
        match &self.session {
            Some(active) => &active.bound,
            None => &[],
        }
    }

    /// Set up the queue topology and start consuming.
    ///
    /// Bindings are issued concurrently and all of them complete before this
    /// returns. Returns the existing channel without touching the broker when
    /// already initialized. A session whose consumer has stopped is torn down
    /// and set up again.
    ///
    /// `on_message` runs on the consumer task and must not block. Acknowledge
    /// through [`EventListener::acknowledge_message`], usually by forwarding
    /// the delivery to the owner of the listener:
    ///
    /// ```text
    /// let (tx, mut rx) = mpsc::unbounded_channel();
    /// listener.init(url, queue, &events, move |d| { let _ = tx.send(d); }).await?;
    /// while let Some(delivery) = rx.recv().await {
    ///     listener.acknowledge_message(&delivery).await?;
    /// }
    /// ```
    pub async fn init<F>(
        &mut self,
        url: &str,
        queue: QueueName,
        events: &[PermLogEvent],
        on_message: F,
    ) -> Result<ChannelHandle>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        if let Some(active) = &self.session {
            if !active.consumer.is_finished() {
                debug!(queue = %active.queue, "Listener already initialized");
                return Ok(Arc::clone(&active.session.channel));
            }
            warn!(queue = %active.queue, "Consumer stopped, setting listener up again");
            self.clear_all().await;
        }

        let session = Session::open(self.connector.as_ref(), url)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to open listener channel");
                PermLogError::init(e)
            })?;

        let declared = self
            .declare_topology(session.channel.as_ref(), queue, events)
            .await;

        let topology = match declared {
            Ok(topology) => topology,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let on_message: MessageListener = Arc::new(on_message);
        let consumer = tokio::spawn(consume_loop(
            Arc::clone(&session.channel),
            topology.queue.clone(),
            topology.deliveries,
            on_message,
        ));

        info!(
            queue = %topology.queue,
            bound = topology.bound.len(),
            requested = events.len(),
            "Listener initialized"
        );

        let channel = Arc::clone(&session.channel);
        self.session = Some(ListenerSession {
            session,
            queue: topology.queue,
            bound: topology.bound,
            consumer,
        });
        Ok(channel)
    }

    async fn declare_topology(
        &self,
        channel: &dyn BrokerChannel,
        queue: QueueName,
        events: &[PermLogEvent],
    ) -> Result<Topology> {
        channel
            .prefetch(PREFETCH_COUNT)
            .await
            .map_err(PermLogError::init)?;

        channel
            .declare_exchange(
                PERM_LOG_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeOptions { durable: true },
            )
            .await
            .map_err(PermLogError::init)?;

        let queue = channel
            .declare_queue(queue.as_str(), QueueOptions { durable: true })
            .await
            .map_err(PermLogError::init)?;

        let bound = self.bind_events(channel, &queue, events).await?;

        let deliveries = channel
            .consume(
                &queue,
                ConsumeOptions {
                    consumer_tag: format!("perm-log-{}", uuid::Uuid::new_v4()),
                    no_ack: false,
                },
            )
            .await
            .map_err(PermLogError::init)?;

        Ok(Topology {
            queue,
            bound,
            deliveries,
        })
    }

    async fn bind_events(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        events: &[PermLogEvent],
    ) -> Result<Vec<PermLogEvent>> {
        let results = join_all(events.iter().map(|event| async move {
            let result = channel
                .bind_queue(queue, PERM_LOG_EXCHANGE, event.as_str())
                .await;
            (*event, result)
        }))
        .await;

        let mut bound = Vec::with_capacity(events.len());
        let mut first_failure = None;

        for (event, result) in results {
            match result {
                Ok(()) => {
                    info!(event = %event, queue = %queue, "Bound event to queue");
                    bound.push(event);
                }
                Err(e) => {
                    error!(event = %event, queue = %queue, error = %e, "Failed to bind event");
                    first_failure.get_or_insert(e);
                }
            }
        }

        match (self.binding_policy, first_failure) {
            (BindingPolicy::RequireAll, Some(e)) => Err(PermLogError::init(e)),
            _ => Ok(bound),
        }
    }

    /// Mark `delivery` as processed so the broker can push the next one.
    pub async fn acknowledge_message(&self, delivery: &Delivery) -> Result<()> {
        let active = self.session.as_ref().ok_or(PermLogError::NotInitialized)?;

        active.session.channel.ack(delivery).await.map_err(|e| {
            error!(delivery_tag = delivery.delivery_tag, error = %e, "Failed to ack message");
            PermLogError::from(e)
        })?;

        debug!(delivery_tag = delivery.delivery_tag, "Acknowledged message");
        Ok(())
    }

    /// Stop consuming, close the channel (best effort), and forget the queue
    /// and callback.
    pub async fn clear_all(&mut self) {
        if let Some(active) = self.session.take() {
            active.consumer.abort();
            active.session.close().await;
            info!(queue = %active.queue, "Listener cleared");
        }
    }
}

#[cfg(feature = "amqp")]
impl Default for EventListener {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        if let Some(active) = &self.session {
            active.consumer.abort();
        }
    }
}

/// Dispatch deliveries until the subscription ends. The end of the
/// subscription is reported like an empty delivery.
async fn consume_loop(
    channel: ChannelHandle,
    queue: String,
    mut deliveries: DeliveryStream,
    on_message: MessageListener,
) {
    info!(queue = %queue, "Consumer started");

    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Some(delivery) => {
                debug!(
                    queue = %queue,
                    routing_key = %delivery.routing_key,
                    delivery_tag = delivery.delivery_tag,
                    "Received message"
                );
                on_message(delivery);
            }
            None => report_empty_message(channel.as_ref(), &queue).await,
        }
    }

    warn!(queue = %queue, "Consumer stream ended");
    report_empty_message(channel.as_ref(), &queue).await;
}

/// Publish a `Rabbit.EmptyMessage` diagnostic naming `queue`.
async fn report_empty_message(channel: &dyn BrokerChannel, queue: &str) {
    warn!(queue = %queue, "Received empty message");

    let payload = match serde_json::to_vec(&RabbitEmptyMessage {
        queue_name: queue.to_string(),
    }) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "Failed to serialize empty message report");
            return;
        }
    };

    let options = PublishOptions::persistent_now();
    if let Err(e) = channel
        .publish(
            PERM_LOG_EXCHANGE,
            PermLogEvent::RabbitEmptyMessage.as_str(),
            &payload,
            &options,
        )
        .await
    {
        error!(queue = %queue, error = %e, "Failed to publish empty message report");
    }
}
