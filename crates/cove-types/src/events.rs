use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DeliveryState, PresenceState};

/// Commands sent FROM client TO server over the WebSocket.
///
/// Wire format: internally tagged JSON, e.g.
/// `{"type":"subscribe","conversationId":"...","lastSeenSeq":5}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Subscribe this connection to a conversation. `last_seen_seq` is the
    /// highest sequence number the client has observed; the server replays
    /// the gap (or signals a resync) before live events flow.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        conversation_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen_seq: Option<u64>,
    },

    /// Send a durable message. The payload is opaque apart from its
    /// `kind` tag (`text`, `file`, `voice`).
    #[serde(rename_all = "camelCase")]
    Message {
        conversation_id: Uuid,
        payload: serde_json::Value,
    },

    /// Indicate typing in a conversation. Ephemeral; expires by TTL.
    #[serde(rename_all = "camelCase")]
    Typing { conversation_id: Uuid },

    /// Add or remove a reaction on a message. Ephemeral set semantics
    /// keyed by (message, user, emoji).
    #[serde(rename_all = "camelCase")]
    Reaction {
        conversation_id: Uuid,
        message_id: Uuid,
        emoji: String,
        #[serde(default)]
        remove: bool,
    },

    /// Acknowledge receipt of a message: advances this user's delivery
    /// state for it (`delivered` or `read`, never backwards).
    #[serde(rename_all = "camelCase")]
    Ack {
        conversation_id: Uuid,
        message_id: Uuid,
        state: DeliveryState,
    },
}

/// Events sent FROM server TO client over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Handshake complete; the connection is authenticated and live.
    #[serde(rename_all = "camelCase")]
    Ready { user_id: Uuid, username: String },

    /// A durable message, either live fan-out or reconciliation replay.
    /// Replayed and live messages are indistinguishable on the wire;
    /// per-connection ordering by `sequence_number` is guaranteed.
    #[serde(rename_all = "camelCase")]
    Message {
        conversation_id: Uuid,
        sequence_number: u64,
        message_id: Uuid,
        sender_id: Uuid,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },

    /// The subscription gap exceeds retained history. The client must
    /// discard local state for this conversation and fetch a fresh
    /// snapshot; live events resume from the current head.
    #[serde(rename_all = "camelCase")]
    ResyncRequired { conversation_id: Uuid },

    /// Confirmation to the sender that its message was persisted, with
    /// the assigned sequence number.
    #[serde(rename_all = "camelCase")]
    Ack {
        conversation_id: Uuid,
        message_id: Uuid,
        sequence_number: u64,
        timestamp: DateTime<Utc>,
    },

    /// A user came online or went offline.
    #[serde(rename_all = "camelCase")]
    Presence {
        user_id: Uuid,
        state: PresenceState,
    },

    /// A user is typing in a conversation.
    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: Uuid,
        user_id: Uuid,
    },

    /// A reaction was added to or removed from a message.
    #[serde(rename_all = "camelCase")]
    Reaction {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
        removed: bool,
    },

    /// A recipient's delivery state advanced for a message.
    #[serde(rename_all = "camelCase")]
    Receipt {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        state: DeliveryState,
    },

    /// A validation or authorization failure, surfaced only to the
    /// originating connection.
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
    },
}

impl ServerEvent {
    /// Sequence number, for events that carry one.
    pub fn sequence_number(&self) -> Option<u64> {
        match self {
            Self::Message {
                sequence_number, ..
            } => Some(*sequence_number),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_wire_format() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"subscribe","conversationId":"4a1b12cf-5d9e-4f2a-a111-2b3c4d5e6f70","lastSeenSeq":5}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::Subscribe { last_seen_seq, .. } => {
                assert_eq!(last_seen_seq, Some(5));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn subscribe_without_cursor_is_first_join() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"subscribe","conversationId":"4a1b12cf-5d9e-4f2a-a111-2b3c4d5e6f70"}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::Subscribe { last_seen_seq, .. } => {
                assert_eq!(last_seen_seq, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn resync_required_tag() {
        let event = ServerEvent::ResyncRequired {
            conversation_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"resyncRequired""#));
        assert!(json.contains(r#""conversationId""#));
    }

    #[test]
    fn message_event_carries_sequence_number() {
        let event = ServerEvent::Message {
            conversation_id: Uuid::nil(),
            sequence_number: 42,
            message_id: Uuid::nil(),
            sender_id: Uuid::nil(),
            payload: serde_json::json!({"kind": "text", "body": "hi"}),
            timestamp: Utc::now(),
        };
        assert_eq!(event.sequence_number(), Some(42));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""sequenceNumber":42"#));
    }
}
