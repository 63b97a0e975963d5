//! Mock broker implementation for testing.
//!
//! Records every call made through the broker traits, routes published
//! messages to bound queues with topic semantics, and lets tests push
//! deliveries (including empty ones) straight into an active subscription.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, ChannelHandle, ConsumeOptions,
    Delivery, DeliveryStream, ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions, Result,
};
use crate::topology::topic_matches;

/// A single call observed by the mock, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Connect {
        url: String,
    },
    CreateChannel {
        channel: usize,
    },
    Prefetch {
        channel: usize,
        count: u16,
    },
    DeclareExchange {
        channel: usize,
        name: String,
        kind: ExchangeKind,
        options: ExchangeOptions,
    },
    DeclareQueue {
        channel: usize,
        name: String,
        options: QueueOptions,
    },
    BindQueue {
        channel: usize,
        queue: String,
        exchange: String,
        pattern: String,
    },
    Publish {
        channel: usize,
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        options: PublishOptions,
    },
    Consume {
        channel: usize,
        queue: String,
        options: ConsumeOptions,
    },
    Ack {
        channel: usize,
        delivery_tag: u64,
    },
    CloseChannel {
        channel: usize,
    },
    CloseConnection,
}

/// Operations the mock can be told to fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Connect,
    CreateChannel,
    Prefetch,
    DeclareExchange,
    DeclareQueue,
    /// Fail binding this pattern only.
    Bind(String),
    Publish,
    Consume,
    Ack,
    CloseChannel,
    CloseConnection,
}

#[derive(Default)]
struct MockState {
    calls: Vec<BrokerCall>,
    failures: Vec<FailPoint>,
    publish_rejected: bool,
    next_channel: usize,
    next_delivery_tag: u64,
    bindings: Vec<(String, String)>,
    /// Active subscription per queue, tagged with the consuming channel.
    subscribers: HashMap<String, (usize, mpsc::UnboundedSender<Option<Delivery>>)>,
}

impl MockState {
    fn check(&self, point: FailPoint) -> Result<()> {
        if !self.failures.contains(&point) {
            return Ok(());
        }
        let reason = format!("Mock failure at {:?}", point);
        Err(match point {
            FailPoint::Connect => BrokerError::Connection(reason),
            FailPoint::CreateChannel | FailPoint::Prefetch => BrokerError::Channel(reason),
            FailPoint::DeclareExchange | FailPoint::DeclareQueue | FailPoint::Bind(_) => {
                BrokerError::Topology(reason)
            }
            FailPoint::Publish => BrokerError::Publish(reason),
            FailPoint::Consume => BrokerError::Consume(reason),
            FailPoint::Ack => BrokerError::Ack(reason),
            FailPoint::CloseChannel | FailPoint::CloseConnection => BrokerError::Close(reason),
        })
    }

    fn next_tag(&mut self) -> u64 {
        self.next_delivery_tag += 1;
        self.next_delivery_tag
    }
}

/// In-memory broker for tests.
///
/// Cloning shares the underlying state, so a test can keep one clone for
/// assertions and hand another to a manager.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future call at `point` fail.
    pub async fn fail_on(&self, point: FailPoint) {
        self.state.lock().await.failures.push(point);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    /// Make publishes report that the broker did not accept the message.
    pub async fn set_publish_rejected(&self, rejected: bool) {
        self.state.lock().await.publish_rejected = rejected;
    }

    /// All calls observed so far.
    pub async fn calls(&self) -> Vec<BrokerCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn count_calls(&self, predicate: impl Fn(&BrokerCall) -> bool) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| predicate(*c))
            .count()
    }

    pub async fn connect_count(&self) -> usize {
        self.count_calls(|c| matches!(c, BrokerCall::Connect { .. }))
            .await
    }

    /// `(queue, exchange, pattern)` for every bind call.
    pub async fn bindings(&self) -> Vec<(String, String, String)> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                BrokerCall::BindQueue {
                    queue,
                    exchange,
                    pattern,
                    ..
                } => Some((queue.clone(), exchange.clone(), pattern.clone())),
                _ => None,
            })
            .collect()
    }

    /// `(exchange, routing_key, payload, options)` for every publish call.
    pub async fn published(&self) -> Vec<(String, String, Vec<u8>, PublishOptions)> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                BrokerCall::Publish {
                    exchange,
                    routing_key,
                    payload,
                    options,
                    ..
                } => Some((
                    exchange.clone(),
                    routing_key.clone(),
                    payload.clone(),
                    options.clone(),
                )),
                _ => None,
            })
            .collect()
    }

    /// Delivery tags of every ack call.
    pub async fn acks(&self) -> Vec<u64> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                BrokerCall::Ack { delivery_tag, .. } => Some(*delivery_tag),
                _ => None,
            })
            .collect()
    }

    /// Push a delivery into the subscription on `queue`. `None` simulates an
    /// empty delivery. Returns false when nobody consumes the queue.
    pub async fn deliver(&self, queue: &str, delivery: Option<Delivery>) -> bool {
        let state = self.state.lock().await;
        match state.subscribers.get(queue) {
            Some((_, tx)) => tx.send(delivery).is_ok(),
            None => false,
        }
    }

    /// Build a delivery with a fresh tag and push it into `queue`.
    pub async fn deliver_payload(
        &self,
        queue: &str,
        routing_key: &str,
        data: impl Into<Vec<u8>>,
    ) -> Option<Delivery> {
        let delivery = {
            let mut state = self.state.lock().await;
            let tag = state.next_tag();
            Delivery::new(tag, routing_key, data)
        };
        self.deliver(queue, Some(delivery.clone()))
            .await
            .then_some(delivery)
    }

    /// End every active subscription stream.
    pub async fn cancel_subscriptions(&self) {
        self.state.lock().await.subscribers.clear();
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Connect {
            url: url.to_string(),
        });
        state.check(FailPoint::Connect)?;
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn create_channel(&self) -> Result<ChannelHandle> {
        let mut state = self.state.lock().await;
        state.next_channel += 1;
        let id = state.next_channel;
        state.calls.push(BrokerCall::CreateChannel { channel: id });
        state.check(FailPoint::CreateChannel)?;
        Ok(Arc::new(MockChannel {
            id,
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::CloseConnection);
        state.check(FailPoint::CloseConnection)
    }
}

struct MockChannel {
    id: usize,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Prefetch {
            channel: self.id,
            count,
        });
        state.check(FailPoint::Prefetch)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::DeclareExchange {
            channel: self.id,
            name: name.to_string(),
            kind,
            options,
        });
        state.check(FailPoint::DeclareExchange)
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::DeclareQueue {
            channel: self.id,
            name: name.to_string(),
            options,
        });
        state.check(FailPoint::DeclareQueue)?;
        Ok(name.to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::BindQueue {
            channel: self.id,
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        });
        state.check(FailPoint::Bind(pattern.to_string()))?;
        state
            .bindings
            .push((queue.to_string(), pattern.to_string()));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Publish {
            channel: self.id,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            options: options.clone(),
        });
        state.check(FailPoint::Publish)?;
        if state.publish_rejected {
            return Ok(false);
        }

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(_, pattern)| topic_matches(pattern, routing_key))
            .map(|(queue, _)| queue.clone())
            .collect();

        for queue in targets {
            let tag = state.next_tag();
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
                timestamp: options.timestamp_millis.map(|ts| ts.max(0) as u64),
                data: payload.to_vec(),
            };
            if let Some((_, tx)) = state.subscribers.get(&queue) {
                let _ = tx.send(Some(delivery));
            }
        }

        Ok(true)
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Consume {
            channel: self.id,
            queue: queue.to_string(),
            options,
        });
        state.check(FailPoint::Consume)?;

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.insert(queue.to_string(), (self.id, tx));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Ack {
            channel: self.id,
            delivery_tag: delivery.delivery_tag,
        });
        state.check(FailPoint::Ack)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::CloseChannel { channel: self.id });
        state.check(FailPoint::CloseChannel)?;
        let id = self.id;
        state.subscribers.retain(|_, (channel, _)| *channel != id);
        Ok(())
    }
}
