//! Shared topology contract between publisher and listener processes.
//!
//! Both sides declare the same durable topic exchange and speak the same
//! closed vocabulary of routing keys and queue names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Exchange every event is published to.
pub const PERM_LOG_EXCHANGE: &str = "perm_log_exchange";

/// Durable queues known to the perm/log services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    /// For testing purposes only.
    #[serde(rename = "test_queue")]
    Test,
    #[serde(rename = "perm_queue")]
    Perm,
    #[serde(rename = "log_queue")]
    Log,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Test => "test_queue",
            QueueName::Perm => "perm_queue",
            QueueName::Log => "log_queue",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test_queue" => Ok(QueueName::Test),
            "perm_queue" => Ok(QueueName::Perm),
            "log_queue" => Ok(QueueName::Log),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

/// Routing keys and binding patterns.
///
/// Routing keys are dot-delimited; `*` matches exactly one segment. The
/// wildcard variants are only valid as binding patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermLogEvent {
    /// All Perm events.
    #[serde(rename = "Perm.*")]
    PermAll,
    /// User requested a perm calculation.
    #[serde(rename = "Perm.Requested")]
    PermRequested,
    /// Perm has been calculated and saved.
    #[serde(rename = "Perm.Calculated")]
    PermCalculated,
    /// User fetched perm(s).
    #[serde(rename = "Perm.Fetched")]
    PermFetched,
    /// Perm wants to log an event explicitly.
    #[serde(rename = "Perm.ExplicitLog")]
    PermExplicitLog,
    /// All events related to the broker itself.
    #[serde(rename = "Rabbit.*")]
    RabbitAll,
    /// A subscriber received an empty message.
    #[serde(rename = "Rabbit.EmptyMessage")]
    RabbitEmptyMessage,
}

impl PermLogEvent {
    pub const ALL: [PermLogEvent; 7] = [
        PermLogEvent::PermAll,
        PermLogEvent::PermRequested,
        PermLogEvent::PermCalculated,
        PermLogEvent::PermFetched,
        PermLogEvent::PermExplicitLog,
        PermLogEvent::RabbitAll,
        PermLogEvent::RabbitEmptyMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermLogEvent::PermAll => "Perm.*",
            PermLogEvent::PermRequested => "Perm.Requested",
            PermLogEvent::PermCalculated => "Perm.Calculated",
            PermLogEvent::PermFetched => "Perm.Fetched",
            PermLogEvent::PermExplicitLog => "Perm.ExplicitLog",
            PermLogEvent::RabbitAll => "Rabbit.*",
            PermLogEvent::RabbitEmptyMessage => "Rabbit.EmptyMessage",
        }
    }

    /// True for binding-only patterns.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, PermLogEvent::PermAll | PermLogEvent::RabbitAll)
    }

    /// Whether a message published under `routing_key` reaches a queue bound
    /// with this pattern.
    pub fn matches(&self, routing_key: &str) -> bool {
        topic_matches(self.as_str(), routing_key)
    }
}

impl fmt::Display for PermLogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermLogEvent {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PermLogEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| UnknownName(s.to_string()))
    }
}

/// Topic exchange matching: segments are dot-delimited and `*` matches
/// exactly one segment.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut key = routing_key.split('.');
    loop {
        match (pattern.next(), key.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(k)) if p == k => continue,
            _ => return false,
        }
    }
}

/// A queue or event name outside the known vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown name: {0}")]
pub struct UnknownName(pub String);

/// Diagnostic payload published when a subscriber receives an empty delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RabbitEmptyMessage {
    pub queue_name: String,
}

/// Always return the string form of a JSON value.
///
/// Strings are returned as-is, `null` becomes an empty string, and anything
/// else is JSON-encoded.
pub fn stringify_if_not(data: &Value) -> String {
    match data {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stringify_null_is_empty() {
        assert_eq!(stringify_if_not(&Value::Null), "");
    }

    #[test]
    fn test_stringify_falsy_scalars() {
        assert_eq!(stringify_if_not(&json!(0)), "0");
        assert_eq!(stringify_if_not(&json!(false)), "false");
    }

    #[test]
    fn test_stringify_string_is_untouched() {
        assert_eq!(stringify_if_not(&json!("plain")), "plain");
    }

    #[test]
    fn test_stringify_object_matches_json_encoding() {
        let obj = json!({ "test": "object" });
        assert_eq!(stringify_if_not(&obj), obj.to_string());
        assert_eq!(obj["test"], "object");
    }

    #[test]
    fn test_event_names_round_trip_through_from_str() {
        for event in PermLogEvent::ALL {
            assert_eq!(event.as_str().parse::<PermLogEvent>().unwrap(), event);
        }
        assert!("Perm.Unknown".parse::<PermLogEvent>().is_err());
    }

    #[test]
    fn test_only_star_patterns_are_wildcards() {
        let wildcards: Vec<_> = PermLogEvent::ALL
            .into_iter()
            .filter(PermLogEvent::is_wildcard)
            .collect();
        assert_eq!(wildcards, vec![PermLogEvent::PermAll, PermLogEvent::RabbitAll]);
    }

    #[test]
    fn test_pattern_matching() {
        assert!(PermLogEvent::PermAll.matches("Perm.Requested"));
        assert!(PermLogEvent::PermAll.matches("Perm.ExplicitLog"));
        assert!(!PermLogEvent::PermAll.matches("Rabbit.EmptyMessage"));
        assert!(!PermLogEvent::PermAll.matches("Perm"));
        assert!(!PermLogEvent::PermAll.matches("Perm.Requested.Extra"));
        assert!(PermLogEvent::PermFetched.matches("Perm.Fetched"));
        assert!(!PermLogEvent::PermFetched.matches("Perm.Calculated"));
    }

    #[test]
    fn test_queue_names() {
        assert_eq!(QueueName::Test.as_str(), "test_queue");
        assert_eq!("perm_queue".parse::<QueueName>().unwrap(), QueueName::Perm);
        assert_eq!(
            serde_json::to_string(&QueueName::Log).unwrap(),
            "\"log_queue\""
        );
    }

    #[test]
    fn test_empty_message_payload_uses_camel_case() {
        let payload = RabbitEmptyMessage {
            queue_name: "test_queue".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({ "queueName": "test_queue" })
        );
    }
}
