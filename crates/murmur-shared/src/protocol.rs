//! Wire envelopes exchanged over the chat socket.
//!
//! Every frame is a JSON object `{"type": <kind>, "payload": {...}}`. Clients
//! send `message` and `typing`; the server sends `message`, `typing`,
//! `status` and `ack`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::types::{DeliveryStatus, Username};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Envelopes a client may send.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ClientEnvelope {
    Message(InboundMessage),
    Typing(TypingRequest),
}

/// A chat message as submitted by its sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub to: String,
    #[serde(default)]
    pub content: String,
    /// Client-side correlation id, echoed nowhere but useful in logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    pub to: String,
    #[serde(default)]
    pub is_typing: bool,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl ClientEnvelope {
    /// Decode a text frame.
    ///
    /// Unknown kinds are reported separately from malformed payloads so the
    /// caller can log them differently; both are non-fatal.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;

        match raw.kind.as_str() {
            "message" => serde_json::from_value(raw.payload)
                .map(ClientEnvelope::Message)
                .map_err(|source| ProtocolError::InvalidPayload {
                    kind: "message",
                    source,
                }),
            "typing" => serde_json::from_value(raw.payload)
                .map(ClientEnvelope::Typing)
                .map_err(|source| ProtocolError::InvalidPayload {
                    kind: "typing",
                    source,
                }),
            _ => Err(ProtocolError::UnknownKind(raw.kind)),
        }
    }

    /// Decode a binary frame carrying UTF-8 JSON.
    pub fn decode_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
        Self::decode(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Envelopes the server pushes onto a connection's outbound queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ServerEnvelope {
    Message(OutboundMessage),
    Typing(TypingNotice),
    Status(StatusEvent),
    Ack(AckEvent),
}

impl ServerEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEnvelope::Message(_) => "message",
            ServerEnvelope::Typing(_) => "typing",
            ServerEnvelope::Status(_) => "status",
            ServerEnvelope::Ack(_) => "ack",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A routed chat message. Also the shape of conversation history entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub from: Username,
    pub to: Username,
    pub content: String,
    /// RFC 3339, second precision, UTC.
    pub timestamp: String,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub from: Username,
    pub is_typing: bool,
}

/// Peer online/offline status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEvent {
    pub username: Username,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AckEvent {
    pub message_id: Uuid,
    pub status: DeliveryStatus,
}

/// Format a timestamp the way every outbound `message` carries it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_message() {
        let env = ClientEnvelope::decode(
            r#"{"type":"message","payload":{"to":"bob","content":"hi","tempId":"t-1"}}"#,
        )
        .unwrap();
        assert_eq!(
            env,
            ClientEnvelope::Message(InboundMessage {
                to: "bob".into(),
                content: "hi".into(),
                temp_id: Some("t-1".into()),
            })
        );
    }

    #[test]
    fn test_decode_typing() {
        let env =
            ClientEnvelope::decode(r#"{"type":"typing","payload":{"to":"bob","isTyping":true}}"#)
                .unwrap();
        assert_eq!(
            env,
            ClientEnvelope::Typing(TypingRequest {
                to: "bob".into(),
                is_typing: true,
            })
        );
    }

    #[test]
    fn test_decode_unknown_kind() {
        let err = ClientEnvelope::decode(r#"{"type":"status","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(kind) if kind == "status"));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            ClientEnvelope::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientEnvelope::decode(r#"{"type":"message"}"#),
            Err(ProtocolError::InvalidPayload { kind: "message", .. })
        ));
        assert!(matches!(
            ClientEnvelope::decode(r#"{"type":"typing","payload":{"isTyping":true}}"#),
            Err(ProtocolError::InvalidPayload { kind: "typing", .. })
        ));
        assert!(matches!(
            ClientEnvelope::decode_bytes(&[0xff, 0xfe]),
            Err(ProtocolError::NotUtf8)
        ));
    }

    #[test]
    fn test_server_envelope_wire_shape() {
        let id = Uuid::new_v4();
        let ack = ServerEnvelope::Ack(AckEvent {
            message_id: id,
            status: DeliveryStatus::Delivered,
        });
        let value: serde_json::Value = serde_json::from_str(&ack.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["payload"]["messageId"], id.to_string());
        assert_eq!(value["payload"]["status"], "delivered");

        let typing = ServerEnvelope::Typing(TypingNotice {
            from: Username::parse("alice").unwrap(),
            is_typing: false,
        });
        let value: serde_json::Value = serde_json::from_str(&typing.to_json().unwrap()).unwrap();
        assert_eq!(value["payload"]["from"], "alice");
        assert_eq!(value["payload"]["isTyping"], false);
    }

    #[test]
    fn test_format_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-01T12:30:05Z");
    }
}
