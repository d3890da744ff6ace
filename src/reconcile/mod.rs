//! Reconciliation of remote batches against local optimistic state.
//!
//! Messages arrive from three channels (local optimistic write, push frame,
//! poll result) and must fold into one per-conversation timeline with no
//! duplicates and no visible regressions. All functions here are pure over
//! the model types; the synchronization service owns the store writes.

use chrono::Duration;

use crate::models::{Conversation, DeliveryState, Message};

/// Tolerance window for folding a remote-confirmed message into its
/// optimistic local placeholder when ids differ (clock skew between the
/// client timestamp and the backend-assigned one).
pub const MATCH_TOLERANCE_MS: i64 = 1_000;

/// Result of merging a remote message batch into a local timeline.
#[derive(Debug)]
pub struct MergeOutcome {
    /// The merged, `sent_at`-ascending timeline.
    pub messages: Vec<Message>,
    /// Remote messages that were genuinely new (no id or heuristic match).
    /// The service uses these for unread accounting.
    pub new_inbound: Vec<Message>,
}

/// Merge a remote batch into the local message list for one conversation.
///
/// Matching order per remote message: identical id first, then a heuristic
/// match of sender + content + `sent_at` within [`MATCH_TOLERANCE_MS`]
/// against a local message still carrying a temporary id. Matched pairs
/// adopt the authoritative id and delivered state; read/delivered flags only
/// ever move forward. Unmatched remote messages are appended, unmatched
/// local ones (not yet acknowledged remotely) are kept as-is.
pub fn merge_messages(local: &[Message], remote: Vec<Message>) -> MergeOutcome {
    let mut merged: Vec<Message> = local.to_vec();
    let mut new_inbound = Vec::new();

    for incoming in remote {
        if let Some(existing) = merged.iter_mut().find(|m| m.id == incoming.id) {
            absorb_flags(existing, &incoming);
            continue;
        }

        if let Some(placeholder) = merged
            .iter_mut()
            .find(|m| is_optimistic_match(m, &incoming))
        {
            placeholder.id = incoming.id.clone();
            placeholder.delivery = DeliveryState::Delivered;
            placeholder.is_read |= incoming.is_read;
            continue;
        }

        new_inbound.push(incoming.clone());
        merged.push(incoming);
    }

    sort_timeline(&mut merged);
    MergeOutcome {
        messages: merged,
        new_inbound,
    }
}

/// Replace a temporary id with the backend-assigned one, in place.
///
/// If a poll or push batch already delivered the authoritative copy (and the
/// heuristic match did not fold it), the stale placeholder is dropped instead
/// so the message appears exactly once.
pub fn confirm_send(messages: &mut Vec<Message>, temp_id: &str, authoritative_id: &str) {
    if messages.iter().any(|m| m.id == authoritative_id) {
        messages.retain(|m| m.id != temp_id);
        return;
    }
    if let Some(m) = messages.iter_mut().find(|m| m.id == temp_id) {
        m.id = authoritative_id.to_string();
        m.delivery = DeliveryState::Delivered;
    }
}

/// Merge a remote conversation record against the local one.
///
/// The remote last-message cache wins only if strictly newer; the local
/// record may be ahead due to an optimistic write not yet reflected
/// remotely. Unread counters are never taken from the remote record for an
/// existing conversation: only new-inbound discovery increments them and
/// only mark-as-read resets them.
pub fn merge_conversation(local: Option<&Conversation>, remote: Conversation) -> Conversation {
    let Some(local) = local else {
        return remote;
    };

    let mut out = local.clone();
    let remote_newer = match (remote.last_message_time, out.last_message_time) {
        (Some(r), Some(l)) => r > l,
        (Some(_), None) => true,
        _ => false,
    };
    if remote_newer {
        out.last_message = remote.last_message;
        out.last_message_time = remote.last_message_time;
        out.last_message_sender = remote.last_message_sender;
    }
    out
}

/// Sort a timeline by `sent_at` ascending, breaking ties by id so repeated
/// merges are deterministic.
pub fn sort_timeline(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
}

/// Move read/delivered flags forward only; true never reverts to false.
fn absorb_flags(existing: &mut Message, incoming: &Message) {
    existing.is_read |= incoming.is_read;
    if incoming.delivery.is_delivered() && !existing.delivery.is_delivered() {
        existing.delivery = DeliveryState::Delivered;
    }
}

fn is_optimistic_match(local: &Message, remote: &Message) -> bool {
    local.has_temp_id()
        && local.sender_id == remote.sender_id
        && local.content == remote.content
        && within_tolerance(local, remote)
}

fn within_tolerance(a: &Message, b: &Message) -> bool {
    let delta = a.sent_at.signed_duration_since(b.sent_at);
    delta.abs() <= Duration::milliseconds(MATCH_TOLERANCE_MS)
}
