//! Binary protocol spoken between push channels and the push hub.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────────┬────────────────────┬──────────┐
//! │ msg_type │ connection_id │ session_id         │ payload  │
//! │ 1 byte   │ 16 bytes      │ optional string    │ variable │
//! └──────────┴───────────────┴────────────────────┴──────────┘
//! ```
//!
//! Handshake: the hub answers every accepted socket with `Welcome` (carrying
//! the connection id) or `Rejected`. A socket only receives notifications
//! after a `JoinGroup` for a session has been acknowledged with `JoinAck`.

use agora_core::{ChangeNotification, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identity the hub assigns to one live channel connection.
pub type ConnectionId = Uuid;

/// Message types for the push protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Hub accepted the socket; carries the connection id
    Welcome = 1,
    /// Hub refused the socket (payload: `RejectReason`)
    Rejected = 2,
    /// Client asks to join a session group
    JoinGroup = 3,
    /// Group membership confirmed
    JoinAck = 4,
    /// Group membership refused (payload: reason string)
    JoinFailed = 5,
    /// Client leaves its session group
    LeaveGroup = 6,
    /// Producer asks the hub to fan out a notification
    Publish = 7,
    /// Hub delivers a notification to a group member
    Notification = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

/// Why the hub refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Hub is at its connection capacity
    ConnectionLimit,
    Unauthorized,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    pub msg_type: MessageType,
    pub connection_id: ConnectionId,
    pub session_id: Option<SessionId>,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl PushMessage {
    fn bare(msg_type: MessageType, connection_id: ConnectionId, session_id: Option<SessionId>) -> Self {
        Self {
            msg_type,
            connection_id,
            session_id,
            payload: Vec::new(),
        }
    }

    pub fn welcome(connection_id: ConnectionId) -> Self {
        Self::bare(MessageType::Welcome, connection_id, None)
    }

    pub fn rejected(reason: RejectReason) -> Self {
        let payload = bincode::serde::encode_to_vec(reason, bincode::config::standard())
            .unwrap_or_default();
        Self {
            payload,
            ..Self::bare(MessageType::Rejected, Uuid::nil(), None)
        }
    }

    pub fn join_group(connection_id: ConnectionId, session_id: SessionId) -> Self {
        Self::bare(MessageType::JoinGroup, connection_id, Some(session_id))
    }

    pub fn join_ack(connection_id: ConnectionId, session_id: SessionId) -> Self {
        Self::bare(MessageType::JoinAck, connection_id, Some(session_id))
    }

    pub fn join_failed(connection_id: ConnectionId, session_id: SessionId, reason: &str) -> Self {
        Self {
            payload: reason.as_bytes().to_vec(),
            ..Self::bare(MessageType::JoinFailed, connection_id, Some(session_id))
        }
    }

    pub fn leave_group(connection_id: ConnectionId, session_id: SessionId) -> Self {
        Self::bare(MessageType::LeaveGroup, connection_id, Some(session_id))
    }

    /// Ask the hub to fan a notification out to its session group.
    pub fn publish(connection_id: ConnectionId, notification: &ChangeNotification) -> Self {
        Self::carrying(MessageType::Publish, connection_id, notification)
    }

    /// Deliver a notification to a group member.
    pub fn notification(connection_id: ConnectionId, notification: &ChangeNotification) -> Self {
        Self::carrying(MessageType::Notification, connection_id, notification)
    }

    fn carrying(msg_type: MessageType, connection_id: ConnectionId, notification: &ChangeNotification) -> Self {
        let payload = bincode::serde::encode_to_vec(notification, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type,
            connection_id,
            session_id: Some(notification.session_id.clone()),
            payload,
        }
    }

    pub fn ping(connection_id: ConnectionId) -> Self {
        Self::bare(MessageType::Ping, connection_id, None)
    }

    pub fn pong(connection_id: ConnectionId) -> Self {
        Self::bare(MessageType::Pong, connection_id, None)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the notification carried by `Publish` / `Notification`.
    pub fn change_notification(&self) -> Result<ChangeNotification, ProtocolError> {
        if !matches!(self.msg_type, MessageType::Publish | MessageType::Notification) {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (notification, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(notification)
    }

    /// Parse the reason carried by `Rejected`.
    pub fn reject_reason(&self) -> Result<RejectReason, ProtocolError> {
        if self.msg_type != MessageType::Rejected {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (reason, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(reason)
    }

    /// Human-readable reason carried by `JoinFailed`.
    pub fn failure_reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::NotificationType;

    #[test]
    fn test_notification_roundtrip() {
        let conn = Uuid::new_v4();
        let n = ChangeNotification::question_added("S1", "Q1");

        let encoded = PushMessage::notification(conn, &n).encode().unwrap();
        let decoded = PushMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Notification);
        assert_eq!(decoded.connection_id, conn);
        assert_eq!(decoded.session_id, Some(SessionId::from("S1")));
        let parsed = decoded.change_notification().unwrap();
        assert_eq!(parsed, n);
        assert_eq!(parsed.notification_type(), NotificationType::QuestionAdded);
    }

    #[test]
    fn test_rejected_carries_reason() {
        let encoded = PushMessage::rejected(RejectReason::ConnectionLimit).encode().unwrap();
        let decoded = PushMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.reject_reason().unwrap(), RejectReason::ConnectionLimit);
    }

    #[test]
    fn test_join_failed_reason_text() {
        let msg = PushMessage::join_failed(Uuid::new_v4(), SessionId::from("S1"), "unknown connection");
        assert_eq!(msg.failure_reason(), "unknown connection");
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = PushMessage::ping(Uuid::new_v4());
        assert!(msg.change_notification().is_err());
        assert!(msg.reject_reason().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(PushMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Welcome as u8, 1);
        assert_eq!(MessageType::Notification as u8, 8);
        assert_eq!(MessageType::Pong as u8, 10);
    }
}
