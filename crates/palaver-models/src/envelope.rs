use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender ID used for server-originated envelopes (acks, errors, pongs).
pub const SERVER_SENDER: i64 = 0;

/// Closed set of wire message types. An unknown `type` tag is a decode
/// error, never a fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    ChatMessage,
    TypingStatus,
    OnlineStatus,
    JoinChat,
    LeaveChat,
    ReadReceipt,
    Ping,
    Pong,
    /// Server -> client handshake greeting advertising the session ID and
    /// expected ping cadence.
    Hello,
    /// Server -> sender delivery acknowledgement for a chat message.
    Ack,
    /// Server -> client protocol error; the connection stays open.
    Error,
}

impl EnvelopeKind {
    /// Kinds a client is allowed to send. Everything else arriving on the
    /// ingress side is a protocol error.
    pub fn client_originated(self) -> bool {
        !matches!(self, Self::Hello | Self::Ack | Self::Error | Self::Pong)
    }

    /// Heartbeat frames are handled by the connection loop and never reach
    /// the router.
    pub fn is_heartbeat(self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}

/// Routing target of an envelope: a single user (direct chat, receipts) or
/// a group whose current membership is resolved at routing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    User(i64),
    Group(i64),
}

/// The unit of real-time wire traffic. Immutable once constructed;
/// `server_timestamp` is stamped by the gateway at ingress and never
/// trusted from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub sender_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, sender_id: i64, target: Option<Target>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            sender_id,
            target,
            payload,
            server_timestamp: None,
        }
    }

    /// Returns a copy stamped with the server-side receipt time.
    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.server_timestamp = Some(at);
        self
    }

    pub fn ping(sender_id: i64) -> Self {
        Self::new(EnvelopeKind::Ping, sender_id, None, serde_json::Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(EnvelopeKind::Pong, SERVER_SENDER, None, serde_json::Value::Null)
    }

    pub fn hello(session_id: Uuid, heartbeat_interval_ms: u64) -> Self {
        Self::new(
            EnvelopeKind::Hello,
            SERVER_SENDER,
            None,
            serde_json::to_value(HelloPayload {
                session_id,
                heartbeat_interval_ms,
            })
            .unwrap_or_default(),
        )
    }

    pub fn ack(target_user: i64, payload: AckPayload) -> Self {
        Self::new(
            EnvelopeKind::Ack,
            SERVER_SENDER,
            Some(Target::User(target_user)),
            serde_json::to_value(payload).unwrap_or_default(),
        )
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::new(
            EnvelopeKind::Error,
            SERVER_SENDER,
            None,
            serde_json::to_value(ErrorPayload {
                code,
                message: message.into(),
            })
            .unwrap_or_default(),
        )
    }

    /// Client-generated message ID, present on chat messages, receipts and
    /// acks.
    pub fn message_id(&self) -> Option<Uuid> {
        self.payload
            .get("message_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub message_id: Uuid,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingStatusPayload {
    pub typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineStatusPayload {
    pub user_id: i64,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptPayload {
    pub message_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub session_id: Uuid,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub message_id: Uuid,
    pub state: crate::DeliveryState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn unknown_kind_is_a_decode_error() {
        let raw = json!({
            "type": "carrier_pigeon",
            "sender_id": 7,
            "payload": {},
        });
        assert!(serde_json::from_value::<Envelope>(raw).is_err());
    }

    #[test]
    fn chat_message_round_trips_with_target() {
        let env = Envelope::new(
            EnvelopeKind::ChatMessage,
            11,
            Some(Target::Group(42)),
            json!({"message_id": Uuid::new_v4().to_string(), "body": "hi"}),
        );
        let raw = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.kind, EnvelopeKind::ChatMessage);
        assert_eq!(back.target, Some(Target::Group(42)));
        assert!(back.message_id().is_some());
    }

    #[test]
    fn client_timestamp_is_not_deserialized_as_trusted() {
        // A client may put anything in server_timestamp; the gateway
        // re-stamps at ingress.
        let env = Envelope::ping(3).stamped(Utc::now());
        assert!(env.server_timestamp.is_some());
        let fresh = Envelope::ping(3);
        assert!(fresh.server_timestamp.is_none());
    }
}
