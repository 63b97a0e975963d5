//! Error taxonomy for the publisher and listener managers.
//!
//! Every error carries a stable [`ErrorCode`] so callers can branch on it
//! programmatically, and a message that is safe to show to users.

use serde_json::json;

use crate::broker::BrokerError;
use crate::topology::stringify_if_not;

/// Result type for manager operations.
pub type Result<T> = std::result::Result<T, PermLogError>;

/// Message attached to every initialization failure.
pub const INIT_ERROR_MESSAGE: &str = "Unable to initialize rabbitmq";

/// Message attached to operations invoked before `init`.
pub const NOT_INITIALIZED_MESSAGE: &str =
    "channel is undefined, rabbitmq has not been initialized.";

/// Stable error identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Dial, channel, or topology failure during `init`.
    RabbitInit,
    /// An operation that needs a live channel ran before `init`.
    RabbitNotInitialized,
    /// A wildcard pattern was used where a concrete routing key is required.
    RabbitInvalidRoutingKey,
    /// A publish or acknowledgment on a live channel failed.
    RabbitOperation,
    /// A payload could not be serialized.
    Serialization,
    /// An error must never be classified as unknown unless nothing else fits.
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RabbitInit => "Rabbit.Init",
            ErrorCode::RabbitNotInitialized => "Rabbit.NotInitialized",
            ErrorCode::RabbitInvalidRoutingKey => "Rabbit.InvalidRoutingKey",
            ErrorCode::RabbitOperation => "Rabbit.Operation",
            ErrorCode::Serialization => "Serialization",
            ErrorCode::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by [`EventPublisher`](crate::publisher::EventPublisher) and
/// [`EventListener`](crate::listener::EventListener).
#[derive(Debug, thiserror::Error)]
pub enum PermLogError {
    /// Connection or topology setup failed. The manager stays uninitialized
    /// and `init` may be retried.
    #[error("{message}")]
    Init {
        /// User-safe message.
        message: String,
        /// Serialized diagnostic data describing the cause.
        data: String,
        #[source]
        source: BrokerError,
    },

    #[error("{}", NOT_INITIALIZED_MESSAGE)]
    NotInitialized,

    #[error("'{0}' is a binding pattern and cannot be used as a routing key")]
    InvalidRoutingKey(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl PermLogError {
    /// Wrap a broker failure raised while initializing a manager.
    pub fn init(source: BrokerError) -> Self {
        let data = json!({
            "kind": source.kind(),
            "detail": source.to_string(),
        });
        Self::Init {
            message: INIT_ERROR_MESSAGE.to_string(),
            data: stringify_if_not(&data),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            PermLogError::Init { .. } => ErrorCode::RabbitInit,
            PermLogError::NotInitialized => ErrorCode::RabbitNotInitialized,
            PermLogError::InvalidRoutingKey(_) => ErrorCode::RabbitInvalidRoutingKey,
            PermLogError::Broker(_) => ErrorCode::RabbitOperation,
            PermLogError::Serialization(_) => ErrorCode::Serialization,
            PermLogError::Unknown(_) => ErrorCode::Unknown,
        }
    }

    /// Diagnostic data attached to the error, if any.
    pub fn data(&self) -> Option<&str> {
        match self {
            PermLogError::Init { data, .. } => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_error_carries_code_message_and_data() {
        let err = PermLogError::init(BrokerError::Connection("refused".to_string()));

        assert_eq!(err.code(), ErrorCode::RabbitInit);
        assert_eq!(err.to_string(), INIT_ERROR_MESSAGE);

        let data: serde_json::Value = serde_json::from_str(err.data().unwrap()).unwrap();
        assert_eq!(data["kind"], "connection");
        assert_eq!(data["detail"], "Connection failed: refused");
    }

    #[test]
    fn test_init_error_keeps_source() {
        use std::error::Error;

        let err = PermLogError::init(BrokerError::Topology("no exchange".to_string()));
        let source = err.source().expect("source should be kept");
        assert_eq!(source.to_string(), "Topology declaration failed: no exchange");
    }

    #[test]
    fn test_not_initialized_message() {
        let err = PermLogError::NotInitialized;
        assert_eq!(err.code().as_str(), "Rabbit.NotInitialized");
        assert_eq!(err.to_string(), NOT_INITIALIZED_MESSAGE);
        assert!(err.data().is_none());
    }

    #[test]
    fn test_broker_operation_error_is_transparent() {
        let err: PermLogError = BrokerError::Ack("gone".to_string()).into();
        assert_eq!(err.code(), ErrorCode::RabbitOperation);
        assert_eq!(err.to_string(), "Ack failed: gone");
    }

    #[test]
    fn test_unknown_code() {
        let err = PermLogError::Unknown("unclassified".to_string());
        assert_eq!(err.code().to_string(), "Unknown");
    }
}
