//! Typed JSON envelopes exchanged over realtime endpoints.
//!
//! Every frame is a UTF-8 JSON object with a `type` tag. The tag is parsed
//! into [`EnvelopeKind`]; tags this crate does not know survive as
//! [`EnvelopeKind::Other`] so new backend events flow through untouched.
//! Payloads stay as opaque JSON since their shapes belong to the backend.

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Wildcard topic string
pub const WILDCARD: &str = "*";

/// Dispatch key of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EnvelopeKind {
    /// Outbound keep-alive ping
    Ping,
    /// Keep-alive acknowledgement
    Pong,
    /// Server greeting after the handshake
    ConnectionEstablished,
    NewMessage,
    MessageRead,
    TypingIndicator,
    NewNotification,
    NotificationRead,
    UserStatus,
    /// Server-reported application error
    Error,
    /// Any type this crate does not know about
    Other(String),
}

impl EnvelopeKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &str {
        match self {
            EnvelopeKind::Ping => "ping",
            EnvelopeKind::Pong => "pong",
            EnvelopeKind::ConnectionEstablished => "connection_established",
            EnvelopeKind::NewMessage => "new_message",
            EnvelopeKind::MessageRead => "message_read",
            EnvelopeKind::TypingIndicator => "typing_indicator",
            EnvelopeKind::NewNotification => "new_notification",
            EnvelopeKind::NotificationRead => "notification_read",
            EnvelopeKind::UserStatus => "user_status",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Other(name) => name.as_str(),
        }
    }

    /// Reserved kinds handled by the connection itself, never by subscribers.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            EnvelopeKind::Ping | EnvelopeKind::Pong | EnvelopeKind::ConnectionEstablished
        )
    }
}

impl From<&str> for EnvelopeKind {
    fn from(name: &str) -> Self {
        match name {
            "ping" => EnvelopeKind::Ping,
            "pong" => EnvelopeKind::Pong,
            "connection_established" => EnvelopeKind::ConnectionEstablished,
            "new_message" => EnvelopeKind::NewMessage,
            "message_read" => EnvelopeKind::MessageRead,
            "typing_indicator" => EnvelopeKind::TypingIndicator,
            "new_notification" => EnvelopeKind::NewNotification,
            "notification_read" => EnvelopeKind::NotificationRead,
            "user_status" => EnvelopeKind::UserStatus,
            "error" => EnvelopeKind::Error,
            other => EnvelopeKind::Other(other.to_string()),
        }
    }
}

impl From<String> for EnvelopeKind {
    fn from(name: String) -> Self {
        match EnvelopeKind::from(name.as_str()) {
            EnvelopeKind::Other(_) => EnvelopeKind::Other(name),
            known => known,
        }
    }
}

impl From<EnvelopeKind> for String {
    fn from(kind: EnvelopeKind) -> Self {
        match kind {
            EnvelopeKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// ISO 8601 timestamp, when the sender supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Correlation fields (`thread_id`, `request_id`, ...) kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with an optional payload
    pub fn new(kind: impl Into<EnvelopeKind>, data: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: None,
            extra: Map::new(),
        }
    }

    /// Heartbeat ping stamped with the current time
    pub fn ping() -> Self {
        Self::new(EnvelopeKind::Ping, None).with_timestamp_now()
    }

    /// Stamp the envelope with the current UTC time
    pub fn with_timestamp_now(mut self) -> Self {
        self.timestamp = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        self
    }

    /// Attach a correlation field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Parse an inbound text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize for the wire
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode the payload into a concrete type
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone().unwrap_or(Value::Null))
    }

    /// Whether the envelope carries a usable dispatch tag
    pub fn has_type(&self) -> bool {
        !self.kind.as_str().is_empty()
    }
}

/// Subscription key: one envelope kind, or every non-system kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Kind(EnvelopeKind),
    All,
}

impl From<EnvelopeKind> for Topic {
    fn from(kind: EnvelopeKind) -> Self {
        Topic::Kind(kind)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        if name == WILDCARD {
            Topic::All
        } else {
            Topic::Kind(EnvelopeKind::from(name))
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Kind(kind) => write!(f, "{}", kind),
            Topic::All => f.write_str(WILDCARD),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_kind() {
        let env = Envelope::parse(r#"{"type":"new_notification","data":{"id":"1"}}"#)
            .expect("valid frame");
        assert_eq!(env.kind, EnvelopeKind::NewNotification);
        assert_eq!(env.data, Some(json!({"id": "1"})));
        assert!(env.timestamp.is_none());
        assert!(env.extra.is_empty());
    }

    #[test]
    fn test_unknown_kind_survives_round_trip() {
        let env = Envelope::parse(r#"{"type":"contract_signed","data":[1,2]}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Other("contract_signed".to_string()));

        let out: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(out, json!({"type": "contract_signed", "data": [1, 2]}));
    }

    #[test]
    fn test_correlation_fields_are_preserved() {
        let env =
            Envelope::parse(r#"{"type":"message_read","thread_id":42,"message_id":"m-7"}"#)
                .unwrap();
        assert_eq!(env.kind, EnvelopeKind::MessageRead);
        assert_eq!(env.extra.get("thread_id"), Some(&json!(42)));
        assert_eq!(env.extra.get("message_id"), Some(&json!("m-7")));
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(Envelope::parse("not json").is_err());
        assert!(Envelope::parse(r#"{"data":{}}"#).is_err()); // no type
        assert!(Envelope::parse(r#"{"type":7}"#).is_err());
        assert!(Envelope::parse("[1,2,3]").is_err());
    }

    #[test]
    fn test_ping_has_timestamp() {
        let ping = Envelope::ping();
        assert_eq!(ping.kind, EnvelopeKind::Ping);
        let ts = ping.timestamp.clone().expect("timestamp");
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
        assert!(ping.to_json().unwrap().starts_with(r#"{"type":"ping","#));
    }

    #[test]
    fn test_system_kinds() {
        assert!(EnvelopeKind::Ping.is_system());
        assert!(EnvelopeKind::Pong.is_system());
        assert!(EnvelopeKind::ConnectionEstablished.is_system());
        assert!(!EnvelopeKind::NewMessage.is_system());
        assert!(!EnvelopeKind::Other("pong2".into()).is_system());
    }

    #[test]
    fn test_topic_from_str() {
        assert_eq!(Topic::from("*"), Topic::All);
        assert_eq!(
            Topic::from("new_message"),
            Topic::Kind(EnvelopeKind::NewMessage)
        );
        assert_eq!(Topic::All.to_string(), "*");
    }

    #[test]
    fn test_data_as() {
        #[derive(Deserialize)]
        struct Notification {
            id: String,
        }
        let env = Envelope::new(EnvelopeKind::NewNotification, Some(json!({"id": "9"})));
        let n: Notification = env.data_as().unwrap();
        assert_eq!(n.id, "9");
    }

    #[test]
    fn test_empty_type_is_not_sendable() {
        assert!(!Envelope::new("", None).has_type());
        assert!(Envelope::new(EnvelopeKind::TypingIndicator, None).has_type());
    }
}
