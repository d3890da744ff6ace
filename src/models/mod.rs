//! Canonical message and conversation value types.
//!
//! Every source of message data (REST responses, push frames, the on-disk
//! store) is normalized into these types at its boundary; heterogeneous wire
//! field naming never leaks past the transport layer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix for client-generated message ids, replaced in place once the
/// backend assigns an authoritative id.
pub const TEMP_ID_PREFIX: &str = "msg-";

/// Delivery state of a message as seen by the local user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DeliveryState {
    /// Written locally, not yet confirmed by the backend.
    Pending,
    /// Confirmed by the backend of record.
    Delivered,
    /// Send rejected or timed out. The message stays in the timeline.
    Failed { reason: String },
}

impl DeliveryState {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryState::Delivered)
    }
}

/// Optional media attachment descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub url: String,
    pub kind: String,
}

/// A single direct message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    pub sent_at: DateTime<Utc>,
    pub is_read: bool,
    pub delivery: DeliveryState,
}

impl Message {
    /// Whether this message still carries a client-generated temporary id.
    pub fn has_temp_id(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

/// Generate a temporary client-side message id.
pub fn temp_message_id(now: DateTime<Utc>) -> String {
    let rand = Uuid::new_v4().simple().to_string();
    format!("{}{}-{}", TEMP_ID_PREFIX, now.timestamp_millis(), &rand[..8])
}

/// Deterministic conversation id for a participant pair.
///
/// Both participants compute the identical id regardless of who initiates:
/// the pair is sorted lexicographically and joined. Symmetry is what lets
/// two peers converge on the same conversation without a central allocator.
pub fn conversation_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

/// A two-party message thread with its denormalized last-message cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participants: [String; 2],
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_sender: Option<String>,
    /// Per-participant count of messages not yet acknowledged via mark-as-read.
    #[serde(default)]
    pub unread: HashMap<String, u32>,
}

impl Conversation {
    pub fn new(a: &str, b: &str) -> Self {
        let id = conversation_id(a, b);
        let mut participants = [a.to_string(), b.to_string()];
        participants.sort();
        Self {
            id,
            participants,
            last_message: None,
            last_message_time: None,
            last_message_sender: None,
            unread: HashMap::new(),
        }
    }

    /// The participant that is not `user_id`. Falls back to the first
    /// participant for a user outside the pair.
    pub fn other_participant(&self, user_id: &str) -> &str {
        self.participants
            .iter()
            .find(|p| p.as_str() != user_id)
            .unwrap_or(&self.participants[0])
    }

    /// Refresh the last-message cache if `msg` is newer than what we hold.
    pub fn touch(&mut self, msg: &Message) {
        let newer = self.last_message_time.map_or(true, |t| msg.sent_at >= t);
        if newer {
            self.last_message = Some(msg.content.clone());
            self.last_message_time = Some(msg.sent_at);
            self.last_message_sender = Some(msg.sender_id.clone());
        }
    }

    pub fn unread_for(&self, user_id: &str) -> u32 {
        self.unread.get(user_id).copied().unwrap_or(0)
    }

    /// UI-facing projection of this conversation for one local user.
    pub fn summary_for(&self, user_id: &str) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            other_participant_id: self.other_participant(user_id).to_string(),
            last_message: self.last_message.clone(),
            last_message_time: self.last_message_time,
            last_message_sender: self.last_message_sender.clone(),
            unread_count: self.unread_for(user_id),
        }
    }
}

/// Read-only conversation summary delivered to list listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub other_participant_id: String,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_message_sender: Option<String>,
    pub unread_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(id: &str, sender: &str, receiver: &str, content: &str, millis: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation_id(sender, receiver),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            content: content.to_string(),
            media: None,
            sent_at: Utc.timestamp_millis_opt(millis).unwrap(),
            is_read: false,
            delivery: DeliveryState::Delivered,
        }
    }

    #[test]
    fn test_conversation_id_symmetric() {
        for (a, b) in [("u1", "u2"), ("alice", "bob"), ("z", "a"), ("x", "x")] {
            assert_eq!(conversation_id(a, b), conversation_id(b, a));
        }
    }

    #[test]
    fn test_conversation_id_sorted_join() {
        assert_eq!(conversation_id("u2", "u1"), "u1:u2");
    }

    #[test]
    fn test_temp_id_detection() {
        let now = Utc::now();
        let mut m = msg("srv-1", "u1", "u2", "hi", 0);
        assert!(!m.has_temp_id());
        m.id = temp_message_id(now);
        assert!(m.has_temp_id());
    }

    #[test]
    fn test_touch_updates_last_message_cache() {
        let mut conv = Conversation::new("u1", "u2");
        conv.touch(&msg("a", "u1", "u2", "first", 1_000));
        conv.touch(&msg("b", "u2", "u1", "second", 2_000));
        // An older message must not regress the cache.
        conv.touch(&msg("c", "u1", "u2", "stale", 500));

        assert_eq!(conv.last_message.as_deref(), Some("second"));
        assert_eq!(conv.last_message_sender.as_deref(), Some("u2"));
        assert_eq!(
            conv.last_message_time,
            Some(Utc.timestamp_millis_opt(2_000).unwrap())
        );
    }

    #[test]
    fn test_summary_projects_other_participant() {
        let mut conv = Conversation::new("u2", "u1");
        conv.unread.insert("u1".to_string(), 3);

        let s = conv.summary_for("u1");
        assert_eq!(s.other_participant_id, "u2");
        assert_eq!(s.unread_count, 3);

        let s = conv.summary_for("u2");
        assert_eq!(s.other_participant_id, "u1");
        assert_eq!(s.unread_count, 0);
    }
}
