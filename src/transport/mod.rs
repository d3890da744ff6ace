//! Remote transport abstraction and wire-shape normalization.
//!
//! Two interchangeable strategies implement [`Transport`]: a polling REST
//! adapter and a push-style websocket adapter. Exactly one is active per
//! session, chosen by configuration; the synchronization service is agnostic
//! to which. Raw wire shapes are normalized into the canonical model types
//! here and never leak further in.

pub mod push;
pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::models::{conversation_id, Conversation, DeliveryState, Message};

/// Observable connection state, reported separately from data callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

/// Events delivered by a push-capable transport's standing subscription.
#[derive(Debug)]
pub enum RemoteEvent {
    /// Full current message set for one peer conversation.
    Messages {
        peer_id: String,
        messages: Vec<RemoteMessage>,
    },
    /// Full current conversation list for the subscribed user.
    Conversations(Vec<RemoteConversation>),
}

/// Remote backend contract. `fetch_*` deliver the full current set; the
/// reconciliation engine performs no-op detection, so redundant delivery of
/// unchanged data is harmless.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Forward a locally composed message; returns the authoritative fields.
    async fn send(&self, msg: &Message) -> Result<RemoteMessage, SyncError>;

    /// Fetch all messages exchanged with one peer.
    async fn fetch_messages(
        &self,
        user_id: &str,
        peer_id: &str,
    ) -> Result<Vec<RemoteMessage>, SyncError>;

    /// Fetch the conversation list for a user.
    async fn fetch_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<RemoteConversation>, SyncError>;

    /// Open a standing subscription if this transport supports push.
    /// Polling transports return `Ok(None)` and the service drives
    /// `fetch_*` on an interval instead.
    async fn subscribe(
        &self,
        _user_id: &str,
    ) -> Result<Option<mpsc::Receiver<RemoteEvent>>, SyncError> {
        Ok(None)
    }
}

/// Message as it appears on the wire. Backends disagree on field naming
/// (`sentAt` vs `created_at` vs `timestamp`); aliases absorb all of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    #[serde(alias = "_id", alias = "message_id")]
    pub id: String,
    #[serde(default, alias = "conversation_id")]
    pub conversation_id: Option<String>,
    #[serde(alias = "sender_id", alias = "from")]
    pub sender_id: String,
    #[serde(alias = "receiver_id", alias = "to")]
    pub receiver_id: String,
    #[serde(default, alias = "text", alias = "body")]
    pub content: String,
    #[serde(default, alias = "media_url")]
    pub media_url: Option<String>,
    #[serde(default, alias = "media_type")]
    pub media_type: Option<String>,
    #[serde(alias = "sent_at", alias = "created_at", alias = "createdAt", alias = "timestamp")]
    pub sent_at: DateTime<Utc>,
    #[serde(default, alias = "is_read", alias = "read")]
    pub is_read: bool,
}

impl RemoteMessage {
    /// Normalize into the canonical model type. Remote messages are by
    /// definition confirmed by the backend of record.
    pub fn into_message(self) -> Message {
        let conversation_id = self
            .conversation_id
            .unwrap_or_else(|| conversation_id(&self.sender_id, &self.receiver_id));
        let media = match (self.media_url, self.media_type) {
            (Some(url), kind) => Some(crate::models::MediaRef {
                url,
                kind: kind.unwrap_or_else(|| "file".to_string()),
            }),
            _ => None,
        };
        Message {
            id: self.id,
            conversation_id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            content: self.content,
            media,
            sent_at: self.sent_at,
            is_read: self.is_read,
            delivery: DeliveryState::Delivered,
        }
    }
}

/// Conversation metadata as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConversation {
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default, alias = "last_message")]
    pub last_message: Option<String>,
    #[serde(default, alias = "last_message_time", alias = "updated_at", alias = "updatedAt")]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "last_message_sender")]
    pub last_message_sender: Option<String>,
    #[serde(default, alias = "unread_count")]
    pub unread_count: Option<u32>,
}

impl RemoteConversation {
    /// Normalize for a given local user; `None` when the record does not
    /// describe a two-party thread involving that user.
    pub fn into_conversation(self, user_id: &str) -> Option<Conversation> {
        let peer = self
            .participants
            .iter()
            .find(|p| p.as_str() != user_id)?
            .clone();
        if !self.participants.iter().any(|p| p == user_id) {
            return None;
        }
        let mut conv = Conversation::new(user_id, &peer);
        conv.last_message = self.last_message;
        conv.last_message_time = self.last_message_time;
        conv.last_message_sender = self.last_message_sender;
        if let Some(n) = self.unread_count {
            conv.unread.insert(user_id.to_string(), n);
        }
        Some(conv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_message_accepts_snake_case_wire_shape() {
        let raw = r#"{
            "id": "m1",
            "sender_id": "u1",
            "receiver_id": "u2",
            "content": "hi",
            "created_at": "2026-08-30T12:00:00Z",
            "is_read": true
        }"#;
        let msg: RemoteMessage = serde_json::from_str(raw).unwrap();
        let msg = msg.into_message();
        assert_eq!(msg.conversation_id, "u1:u2");
        assert!(msg.is_read);
        assert!(msg.delivery.is_delivered());
    }

    #[test]
    fn test_remote_message_accepts_camel_case_wire_shape() {
        let raw = r#"{
            "id": "m2",
            "senderId": "u2",
            "receiverId": "u1",
            "content": "",
            "mediaUrl": "https://cdn/img.png",
            "mediaType": "image",
            "sentAt": "2026-08-30T12:00:01Z"
        }"#;
        let msg: RemoteMessage = serde_json::from_str(raw).unwrap();
        let msg = msg.into_message();
        assert_eq!(msg.media.as_ref().unwrap().kind, "image");
        assert!(!msg.is_read);
    }

    #[test]
    fn test_remote_conversation_normalizes_for_local_user() {
        let raw = r#"{
            "participants": ["u2", "u1"],
            "lastMessage": "yo",
            "lastMessageTime": "2026-08-30T12:00:00Z",
            "lastMessageSender": "u2",
            "unreadCount": 2
        }"#;
        let conv: RemoteConversation = serde_json::from_str(raw).unwrap();
        let conv = conv.into_conversation("u1").unwrap();
        assert_eq!(conv.id, "u1:u2");
        assert_eq!(conv.unread_for("u1"), 2);
        assert_eq!(conv.other_participant("u1"), "u2");
    }

    #[test]
    fn test_remote_conversation_rejects_foreign_thread() {
        let raw = r#"{"participants": ["u2", "u3"]}"#;
        let conv: RemoteConversation = serde_json::from_str(raw).unwrap();
        assert!(conv.into_conversation("u1").is_none());
    }
}
