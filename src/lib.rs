//! perm-log - event publishing and consuming over RabbitMQ
//!
//! A publisher and a listener, each owning one connection and one channel,
//! sharing a durable topic exchange and a closed vocabulary of routing keys.

pub mod broker;
pub mod config;
pub mod error;
pub mod listener;
pub mod publisher;
pub mod topology;
pub mod utils;

pub use broker::{ChannelHandle, Delivery, PublishOptions};
pub use error::{ErrorCode, PermLogError, Result};
pub use listener::{BindingPolicy, EventListener};
pub use publisher::EventPublisher;
pub use topology::{PermLogEvent, QueueName, PERM_LOG_EXCHANGE};
