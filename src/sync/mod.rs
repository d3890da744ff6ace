//! The synchronization service: owner of the current-user scope, the local
//! store, and the background sync task.
//!
//! All mutations funnel through this service; transports only deliver data.
//! Every mutating operation writes to the store before any callback fires,
//! so by the time a listener observes an update the store already reflects
//! it. Callbacks are invoked outside the state lock, which makes it safe to
//! call back into the service (including `cleanup`) from inside a callback.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time;

use crate::error::SyncError;
use crate::models::{
    conversation_id, temp_message_id, Conversation, ConversationSummary, DeliveryState, MediaRef,
    Message,
};
use crate::reconcile;
use crate::store::Store;
use crate::transport::{ConnectionStatus, RemoteConversation, RemoteEvent, RemoteMessage, Transport};

/// Reference poll cadence for the REST transport.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Backoff base when a sync pass fails; doubles per consecutive failure.
const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(2);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Consecutive failures before the session is reported degraded.
const DEGRADE_AFTER_FAILURES: u32 = 3;

pub type MessagesCallback = dyn Fn(&[Message]) + Send + Sync;
pub type ConversationsCallback = dyn Fn(&[ConversationSummary]) + Send + Sync;
pub type StatusCallback = dyn Fn(ConnectionStatus) + Send + Sync;

/// Input for [`SyncService::send_message`].
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub recipient_id: String,
    pub content: String,
    pub media: Option<MediaRef>,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub poll_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Messages,
    ConversationList,
}

/// Handle returned by `listen_*`; unsubscribes on drop. `unsubscribe` is
/// idempotent and never invalidates already-delivered data.
pub struct ListenerGuard {
    inner: Weak<Mutex<Inner>>,
    id: u64,
    kind: ListenerKind,
}

impl ListenerGuard {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
            match self.kind {
                ListenerKind::Messages => {
                    state.msg_listeners.remove(&self.id);
                }
                ListenerKind::ConversationList => {
                    state.conv_listeners.remove(&self.id);
                }
            }
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct Inner {
    current_user: Option<String>,
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<Message>>,
    msg_listeners: HashMap<u64, (String, Arc<MessagesCallback>)>,
    conv_listeners: HashMap<u64, Arc<ConversationsCallback>>,
    status_cb: Option<Arc<StatusCallback>>,
    status: ConnectionStatus,
    next_listener_id: u64,
    /// Temp ids with a send currently on the wire; keeps the retry sweep
    /// from double-sending.
    in_flight: HashSet<String>,
    /// Temporary id -> authoritative id, for the current session only.
    id_map: HashMap<String, String>,
    /// Set when a send was rejected for authentication; suspends the retry
    /// sweep until the user rebinds with fresh credentials.
    auth_failed: bool,
    shutdown: Option<watch::Sender<bool>>,
    store: Box<dyn Store>,
}

/// Cheap-to-clone handle; all clones share one state.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<Mutex<Inner>>,
    transport: Arc<dyn Transport>,
    options: SyncOptions,
}

impl SyncService {
    pub fn new(store: Box<dyn Store>, transport: Arc<dyn Transport>, options: SyncOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                current_user: None,
                conversations: HashMap::new(),
                messages: HashMap::new(),
                msg_listeners: HashMap::new(),
                conv_listeners: HashMap::new(),
                status_cb: None,
                status: ConnectionStatus::Connecting,
                next_listener_id: 0,
                in_flight: HashSet::new(),
                id_map: HashMap::new(),
                auth_failed: false,
                shutdown: None,
                store,
            })),
            transport,
            options,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind the service to a local user (or unbind with `None`).
    ///
    /// Idempotent for a repeated bind to the same user. Binding loads the
    /// persisted scope and starts background synchronization; unbinding
    /// stops it and drops in-memory state.
    pub fn set_current_user(&self, user_id: Option<&str>) {
        let user = user_id
            .map(str::to_string)
            .filter(|u| !u.trim().is_empty());

        {
            let mut state = self.lock();
            if state.current_user == user && state.shutdown.is_some() {
                return;
            }

            if let Some(tx) = state.shutdown.take() {
                let _ = tx.send(true);
            }
            state.conversations.clear();
            state.messages.clear();
            state.in_flight.clear();
            state.id_map.clear();
            state.auth_failed = false;
            state.current_user = user.clone();

            if let Some(ref u) = user {
                let conversations = state.store.load_conversations(u);
                let mut scopes: HashSet<String> =
                    state.store.message_scopes(u).into_iter().collect();
                scopes.extend(conversations.keys().cloned());

                let mut messages = HashMap::new();
                for conv_id in scopes {
                    let mut list = state.store.load_messages(u, &conv_id);
                    reconcile::sort_timeline(&mut list);
                    messages.insert(conv_id, list);
                }
                state.conversations = conversations;
                state.messages = messages;

                let (tx, rx) = watch::channel(false);
                state.shutdown = Some(tx);
                let svc = self.clone();
                let u = u.clone();
                tokio::spawn(async move { run_sync(svc, u, rx).await });
                tracing::info!("Synchronization started for user");
            } else {
                tracing::info!("Synchronization stopped (no bound user)");
            }
        }

        self.emit_conversation_list();
        let conv_ids: Vec<String> = {
            let state = self.lock();
            state
                .msg_listeners
                .values()
                .map(|(c, _)| c.clone())
                .collect()
        };
        for conv_id in conv_ids {
            self.emit_conversation(&conv_id);
        }
    }

    /// Optimistically append a message and forward it in the background.
    ///
    /// The message is in the store and visible to listeners before this
    /// returns; the returned id is temporary until the backend confirms.
    pub fn send_message(&self, req: SendRequest) -> Result<String, SyncError> {
        if req.recipient_id.trim().is_empty() {
            return Err(SyncError::validation("recipient id is required"));
        }
        if req.content.trim().is_empty() && req.media.is_none() {
            return Err(SyncError::validation(
                "message needs content or a media attachment",
            ));
        }

        let now = Utc::now();
        let temp_id = temp_message_id(now);

        let (message, conv_id) = {
            let mut state = self.lock();
            let user = state
                .current_user
                .clone()
                .ok_or_else(|| SyncError::validation("no current user bound"))?;

            let conv_id = conversation_id(&user, &req.recipient_id);
            let message = Message {
                id: temp_id.clone(),
                conversation_id: conv_id.clone(),
                sender_id: user.clone(),
                receiver_id: req.recipient_id.clone(),
                content: req.content,
                media: req.media,
                sent_at: now,
                is_read: false,
                delivery: DeliveryState::Pending,
            };

            let list = state.messages.entry(conv_id.clone()).or_default();
            list.push(message.clone());
            reconcile::sort_timeline(list);

            let conv = state
                .conversations
                .entry(conv_id.clone())
                .or_insert_with(|| Conversation::new(&user, &req.recipient_id));
            conv.touch(&message);
            *conv.unread.entry(req.recipient_id.clone()).or_insert(0) += 1;

            state.in_flight.insert(temp_id.clone());
            persist(&mut state, &user, &conv_id);
            (message, conv_id)
        };

        // Local emission happens before any network I/O.
        self.emit_conversation(&conv_id);
        self.emit_conversation_list();

        let svc = self.clone();
        tokio::spawn(async move { svc.deliver(message).await });

        Ok(temp_id)
    }

    /// Register a callback for one conversation's timeline. Delivers the
    /// current list immediately and on every subsequent relevant mutation.
    /// Listening implies the conversation has been seen, so the bound
    /// user's unread state is reset.
    pub fn listen_to_conversation(
        &self,
        conversation_id: &str,
        callback: impl Fn(&[Message]) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let callback: Arc<MessagesCallback> = Arc::new(callback);
        let (id, snapshot) = {
            let mut state = self.lock();
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            state
                .msg_listeners
                .insert(id, (conversation_id.to_string(), callback.clone()));
            let snapshot = state
                .messages
                .get(conversation_id)
                .cloned()
                .unwrap_or_default();
            (id, snapshot)
        };

        callback(&snapshot);
        self.mark_as_read(conversation_id);

        ListenerGuard {
            inner: Arc::downgrade(&self.inner),
            id,
            kind: ListenerKind::Messages,
        }
    }

    /// Register a callback for the conversation list, sorted by last
    /// activity descending.
    pub fn listen_to_conversation_list(
        &self,
        callback: impl Fn(&[ConversationSummary]) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let callback: Arc<ConversationsCallback> = Arc::new(callback);
        let (id, snapshot) = {
            let mut state = self.lock();
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            state.conv_listeners.insert(id, callback.clone());
            (id, summaries(&state))
        };

        callback(&snapshot);

        ListenerGuard {
            inner: Arc::downgrade(&self.inner),
            id,
            kind: ListenerKind::ConversationList,
        }
    }

    /// Reset the bound user's unread counter and flip `is_read` on stored
    /// inbound messages for one conversation.
    pub fn mark_as_read(&self, conversation_id: &str) {
        let changed = {
            let mut state = self.lock();
            let Some(user) = state.current_user.clone() else {
                return;
            };

            let mut changed = false;
            if let Some(conv) = state.conversations.get_mut(conversation_id) {
                if conv.unread_for(&user) != 0 {
                    conv.unread.insert(user.clone(), 0);
                    changed = true;
                }
            }
            if let Some(list) = state.messages.get_mut(conversation_id) {
                for msg in list.iter_mut() {
                    if msg.receiver_id == user && !msg.is_read {
                        msg.is_read = true;
                        changed = true;
                    }
                }
            }
            if changed {
                persist(&mut state, &user, conversation_id);
            }
            changed
        };

        if changed {
            self.emit_conversation(conversation_id);
            self.emit_conversation_list();
        }
    }

    /// Observe connection-status transitions. The current status is
    /// delivered immediately, then only changes.
    pub fn set_connection_status_callback(
        &self,
        callback: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) {
        let callback: Arc<StatusCallback> = Arc::new(callback);
        let status = {
            let mut state = self.lock();
            state.status_cb = Some(callback.clone());
            state.status
        };
        callback(status);
    }

    /// Stop background synchronization, drop all subscriptions and
    /// in-memory state. Safe to call repeatedly, and from inside a callback
    /// this service triggered. Persisted data is untouched.
    pub fn cleanup(&self) {
        let mut state = self.lock();
        if let Some(tx) = state.shutdown.take() {
            let _ = tx.send(true);
        }
        state.msg_listeners.clear();
        state.conv_listeners.clear();
        state.conversations.clear();
        state.messages.clear();
        state.in_flight.clear();
        state.id_map.clear();
        // A later operation must rebind (and so reload the store scope)
        // rather than write the now-empty memory image over persisted data.
        state.current_user = None;
    }

    /// Read-only snapshot of one conversation's timeline.
    pub fn conversation_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Read-only snapshot of the bound user's conversation list.
    pub fn conversation_summaries(&self) -> Vec<ConversationSummary> {
        summaries(&self.lock())
    }

    /// Delivery state for a message, resolving a temporary id through its
    /// confirmed replacement if one exists.
    pub fn delivery_state(&self, conversation_id: &str, message_id: &str) -> Option<DeliveryState> {
        let state = self.lock();
        let resolved = state
            .id_map
            .get(message_id)
            .map(String::as_str)
            .unwrap_or(message_id);
        state
            .messages
            .get(conversation_id)?
            .iter()
            .find(|m| m.id == resolved)
            .map(|m| m.delivery.clone())
    }

    /// One full reconcile pass against the remote: conversation list, then
    /// each peer's timeline, then a retry sweep over undelivered sends.
    pub async fn sync_once(&self) -> Result<(), SyncError> {
        let Some(user) = self.lock().current_user.clone() else {
            return Ok(());
        };

        let remote_convs = self.transport.fetch_conversations(&user).await?;
        self.apply_remote_conversations(remote_convs);

        let peers: Vec<String> = {
            let state = self.lock();
            state
                .conversations
                .values()
                .map(|c| c.other_participant(&user).to_string())
                .collect()
        };
        for peer in peers {
            let batch = self.transport.fetch_messages(&user, &peer).await?;
            self.apply_remote_messages(&peer, batch);
        }

        self.flush_pending().await;
        Ok(())
    }

    /// Re-send messages that are still pending or previously failed.
    /// Failed sends stay in the timeline; this is the path that completes
    /// them once the transport recovers.
    pub async fn flush_pending(&self) {
        let pending: Vec<Message> = {
            let mut state = self.lock();
            if state.current_user.is_none() || state.auth_failed {
                return;
            }
            let candidates: Vec<Message> = state
                .messages
                .values()
                .flatten()
                .filter(|m| {
                    !m.delivery.is_delivered() && !state.in_flight.contains(&m.id)
                })
                .cloned()
                .collect();
            for msg in &candidates {
                state.in_flight.insert(msg.id.clone());
            }
            candidates
        };

        for msg in pending {
            self.deliver(msg).await;
        }
    }

    /// Merge a remote message batch for one peer conversation.
    pub(crate) fn apply_remote_messages(&self, peer_id: &str, batch: Vec<RemoteMessage>) {
        let emitted = {
            let mut state = self.lock();
            let Some(user) = state.current_user.clone() else {
                return;
            };
            let conv_id = conversation_id(&user, peer_id);

            let local = state.messages.get(&conv_id).cloned().unwrap_or_default();
            let incoming: Vec<Message> = batch.into_iter().map(RemoteMessage::into_message).collect();
            let outcome = reconcile::merge_messages(&local, incoming);

            let new_for_user = outcome
                .new_inbound
                .iter()
                .filter(|m| m.receiver_id == user)
                .count() as u32;
            let mut merged = outcome.messages;
            let mut changed = merged != local;
            if merged.is_empty() && !changed {
                return;
            }

            let has_listener = state
                .msg_listeners
                .values()
                .any(|(c, _)| c == &conv_id);

            let conv = state
                .conversations
                .entry(conv_id.clone())
                .or_insert_with(|| Conversation::new(&user, peer_id));
            if let Some(last) = merged.last() {
                conv.touch(last);
            }
            if new_for_user > 0 {
                if has_listener {
                    // The user is looking at this conversation; new inbound
                    // is immediately seen.
                    conv.unread.insert(user.clone(), 0);
                    for msg in merged.iter_mut() {
                        if msg.receiver_id == user {
                            msg.is_read = true;
                        }
                    }
                } else {
                    *conv.unread.entry(user.clone()).or_insert(0) += new_for_user;
                }
                changed = true;
            }

            state.messages.insert(conv_id.clone(), merged);
            if changed {
                persist(&mut state, &user, &conv_id);
                Some(conv_id)
            } else {
                None
            }
        };

        if let Some(conv_id) = emitted {
            self.emit_conversation(&conv_id);
            self.emit_conversation_list();
        }
    }

    /// Merge remote conversation metadata into the local list.
    pub(crate) fn apply_remote_conversations(&self, batch: Vec<RemoteConversation>) {
        let changed = {
            let mut state = self.lock();
            let Some(user) = state.current_user.clone() else {
                return;
            };

            let mut changed = false;
            for remote in batch {
                let Some(remote) = remote.into_conversation(&user) else {
                    continue;
                };
                let merged =
                    reconcile::merge_conversation(state.conversations.get(&remote.id), remote);
                if state.conversations.get(&merged.id) != Some(&merged) {
                    state.conversations.insert(merged.id.clone(), merged);
                    changed = true;
                }
            }
            if changed {
                if let Err(e) = persist_conversations(&mut state, &user) {
                    tracing::warn!("Failed to persist conversations: {e}");
                }
            }
            changed
        };

        if changed {
            self.emit_conversation_list();
        }
    }

    /// Forward one message to the transport and fold the outcome back in.
    async fn deliver(&self, msg: Message) {
        let result = self.transport.send(&msg).await;
        let conv_id = msg.conversation_id.clone();

        {
            let mut state = self.lock();
            state.in_flight.remove(&msg.id);
            let Some(user) = state.current_user.clone() else {
                return;
            };

            match result {
                Ok(remote) => {
                    state.id_map.insert(msg.id.clone(), remote.id.clone());
                    if let Some(list) = state.messages.get_mut(&conv_id) {
                        reconcile::confirm_send(list, &msg.id, &remote.id);
                    }
                    persist(&mut state, &user, &conv_id);
                }
                Err(e) => {
                    tracing::warn!("Send failed, keeping message in timeline: {e}");
                    if let Some(m) = state
                        .messages
                        .get_mut(&conv_id)
                        .and_then(|l| l.iter_mut().find(|m| m.id == msg.id))
                    {
                        m.delivery = DeliveryState::Failed {
                            reason: e.to_string(),
                        };
                    }
                    persist(&mut state, &user, &conv_id);
                    if matches!(e, SyncError::Auth(_)) {
                        state.auth_failed = true;
                        drop(state);
                        self.set_status(ConnectionStatus::Error);
                        self.emit_conversation(&conv_id);
                        self.emit_conversation_list();
                        return;
                    }
                }
            }
        }

        self.emit_conversation(&conv_id);
        self.emit_conversation_list();
    }

    fn set_status(&self, status: ConnectionStatus) {
        let callback = {
            let mut state = self.lock();
            if state.status == status {
                return;
            }
            state.status = status;
            state.status_cb.clone()
        };
        tracing::debug!("Connection status -> {}", status.as_str());
        if let Some(cb) = callback {
            cb(status);
        }
    }

    fn emit_conversation(&self, conversation_id: &str) {
        let (callbacks, snapshot) = {
            let state = self.lock();
            let callbacks: Vec<Arc<MessagesCallback>> = state
                .msg_listeners
                .values()
                .filter(|(c, _)| c == conversation_id)
                .map(|(_, cb)| cb.clone())
                .collect();
            let snapshot = state
                .messages
                .get(conversation_id)
                .cloned()
                .unwrap_or_default();
            (callbacks, snapshot)
        };
        for cb in callbacks {
            cb(&snapshot);
        }
    }

    fn emit_conversation_list(&self) {
        let (callbacks, snapshot) = {
            let state = self.lock();
            let callbacks: Vec<Arc<ConversationsCallback>> =
                state.conv_listeners.values().cloned().collect();
            (callbacks, summaries(&state))
        };
        for cb in callbacks {
            cb(&snapshot);
        }
    }
}

/// Conversation summaries for the bound user, newest activity first.
fn summaries(state: &Inner) -> Vec<ConversationSummary> {
    let Some(ref user) = state.current_user else {
        return Vec::new();
    };
    let mut list: Vec<ConversationSummary> = state
        .conversations
        .values()
        .map(|c| c.summary_for(user))
        .collect();
    list.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time).then_with(|| a.id.cmp(&b.id)));
    list
}

fn persist(state: &mut Inner, user: &str, conversation_id: &str) {
    if let Some(list) = state.messages.get(conversation_id) {
        if let Err(e) = state.store.save_messages(user, conversation_id, list) {
            tracing::warn!("Failed to persist messages: {e}");
        }
    }
    if let Err(e) = persist_conversations(state, user) {
        tracing::warn!("Failed to persist conversations: {e}");
    }
}

fn persist_conversations(state: &mut Inner, user: &str) -> Result<(), SyncError> {
    state.store.save_conversations(user, &state.conversations)
}

/// Background sync driver. Push transports hand us an event stream; the
/// polling transport has none and we fetch on an interval. One transport
/// per session, never both.
async fn run_sync(svc: SyncService, user: String, mut shutdown: watch::Receiver<bool>) {
    svc.set_status(ConnectionStatus::Connecting);

    let stream = match svc.transport.subscribe(&user).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Subscription unavailable, serving local-only data: {e}");
            svc.set_status(ConnectionStatus::Error);
            None
        }
    };

    match stream {
        Some(mut events) => {
            // Seed from the backend of record, then follow pushes.
            match svc.sync_once().await {
                Ok(()) => svc.set_status(ConnectionStatus::Connected),
                Err(e) => {
                    tracing::warn!("Initial sync failed: {e}");
                    svc.set_status(ConnectionStatus::Error);
                }
            }

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Some(RemoteEvent::Messages { peer_id, messages }) => {
                            svc.set_status(ConnectionStatus::Connected);
                            svc.apply_remote_messages(&peer_id, messages);
                            svc.flush_pending().await;
                        }
                        Some(RemoteEvent::Conversations(conversations)) => {
                            svc.set_status(ConnectionStatus::Connected);
                            svc.apply_remote_conversations(conversations);
                        }
                        None => {
                            // Stream exhausted its retry budget; degrade.
                            svc.set_status(ConnectionStatus::Error);
                            break;
                        }
                    }
                }
            }
        }
        None => {
            let mut failures: u32 = 0;
            loop {
                let delay = match svc.sync_once().await {
                    Ok(()) => {
                        failures = 0;
                        svc.set_status(ConnectionStatus::Connected);
                        svc.options.poll_interval
                    }
                    Err(e) => {
                        if matches!(e, SyncError::Auth(_)) {
                            // Non-transient; wait for re-authentication.
                            tracing::warn!("Sync stopped on auth failure: {e}");
                            svc.set_status(ConnectionStatus::Error);
                            break;
                        }
                        failures += 1;
                        tracing::warn!("Sync pass failed ({failures} in a row): {e}");
                        if failures >= DEGRADE_AFTER_FAILURES {
                            svc.set_status(ConnectionStatus::Error);
                        }
                        backoff_delay(failures)
                    }
                };

                tokio::select! {
                    _ = time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }

    tracing::debug!("Sync task for user ended");
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(5);
    (RETRY_BACKOFF_BASE * 2u32.saturating_pow(exp)).min(RETRY_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn remote_msg(id: &str, sender: &str, receiver: &str, content: &str, sent_at: DateTime<Utc>) -> RemoteMessage {
        RemoteMessage {
            id: id.to_string(),
            conversation_id: None,
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            content: content.to_string(),
            media_url: None,
            media_type: None,
            sent_at,
            is_read: false,
        }
    }

    /// Scriptable transport: queued send results, fixed fetch data, and an
    /// optional stall switch that makes sends hang forever.
    #[derive(Default)]
    struct StubTransport {
        send_results: Mutex<VecDeque<Result<String, SyncError>>>,
        stall_sends: AtomicBool,
        send_calls: AtomicU32,
    }

    impl StubTransport {
        fn stalled() -> Self {
            let stub = Self::default();
            stub.stall_sends.store(true, Ordering::SeqCst);
            stub
        }

        fn with_send_results(results: Vec<Result<String, SyncError>>) -> Self {
            Self {
                send_results: Mutex::new(results.into_iter().collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn send(&self, msg: &Message) -> Result<RemoteMessage, SyncError> {
            self.send_calls.fetch_add(1, Ordering::SeqCst);
            if self.stall_sends.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
                unreachable!();
            }
            let scripted = self
                .send_results
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            match scripted {
                Some(Ok(id)) => Ok(remote_msg(
                    &id,
                    &msg.sender_id,
                    &msg.receiver_id,
                    &msg.content,
                    msg.sent_at,
                )),
                Some(Err(e)) => Err(e),
                None => Err(SyncError::network("no scripted send result")),
            }
        }

        async fn fetch_messages(
            &self,
            _user_id: &str,
            _peer_id: &str,
        ) -> Result<Vec<RemoteMessage>, SyncError> {
            Ok(Vec::new())
        }

        async fn fetch_conversations(
            &self,
            _user_id: &str,
        ) -> Result<Vec<RemoteConversation>, SyncError> {
            Ok(Vec::new())
        }
    }

    fn service(transport: StubTransport) -> SyncService {
        SyncService::new(
            Box::new(MemoryStore::new()),
            Arc::new(transport),
            SyncOptions::default(),
        )
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_visibility_before_network() {
        let svc = service(StubTransport::stalled());
        svc.set_current_user(Some("u1"));

        let seen: Arc<Mutex<Vec<Vec<Message>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let conv_id = conversation_id("u1", "u2");
        let _guard = svc.listen_to_conversation(&conv_id, move |msgs| {
            seen2.lock().unwrap().push(msgs.to_vec());
        });

        let temp_id = svc
            .send_message(SendRequest {
                recipient_id: "u2".to_string(),
                content: "hi".to_string(),
                media: None,
            })
            .unwrap();

        // Transport is stalled: visibility must not depend on it.
        let snapshot = svc.conversation_messages(&conv_id);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, temp_id);
        assert_eq!(snapshot[0].delivery, DeliveryState::Pending);

        let emissions = seen.lock().unwrap();
        assert!(emissions
            .last()
            .map(|msgs| msgs.iter().any(|m| m.id == temp_id))
            .unwrap_or(false));
        drop(emissions);

        svc.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_errors() {
        let svc = service(StubTransport::default());

        // No bound user.
        let err = svc
            .send_message(SendRequest {
                recipient_id: "u2".to_string(),
                content: "hi".to_string(),
                media: None,
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        svc.set_current_user(Some("u1"));

        // Empty content, no media.
        let err = svc
            .send_message(SendRequest {
                recipient_id: "u2".to_string(),
                content: "   ".to_string(),
                media: None,
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        // No state was created by the rejected sends.
        assert!(svc.conversation_summaries().is_empty());
        svc.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_accounting() {
        let svc = service(StubTransport::default());
        svc.set_current_user(Some("u1"));
        let conv_id = conversation_id("u1", "u2");

        // Three inbound messages while u1 has no listener on the thread.
        let base = Utc::now();
        let batch: Vec<RemoteMessage> = (0..3)
            .map(|i| {
                remote_msg(
                    &format!("srv-{i}"),
                    "u2",
                    "u1",
                    &format!("m{i}"),
                    base + ChronoDuration::milliseconds(i * 10),
                )
            })
            .collect();
        svc.apply_remote_messages("u2", batch);

        let summary = &svc.conversation_summaries()[0];
        assert_eq!(summary.id, conv_id);
        assert_eq!(summary.unread_count, 3);

        svc.mark_as_read(&conv_id);
        assert_eq!(svc.conversation_summaries()[0].unread_count, 0);
        assert!(svc
            .conversation_messages(&conv_id)
            .iter()
            .all(|m| m.is_read));

        // Re-delivering the same batch must not resurrect the counter.
        let batch: Vec<RemoteMessage> = (0..3)
            .map(|i| {
                remote_msg(
                    &format!("srv-{i}"),
                    "u2",
                    "u1",
                    &format!("m{i}"),
                    base + ChronoDuration::milliseconds(i * 10),
                )
            })
            .collect();
        svc.apply_remote_messages("u2", batch);
        assert_eq!(svc.conversation_summaries()[0].unread_count, 0);

        svc.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_temp_id_replacement() {
        let svc = service(StubTransport::with_send_results(vec![Ok(
            "srv-42".to_string()
        )]));
        svc.set_current_user(Some("u1"));
        let conv_id = conversation_id("u1", "u2");

        let temp_id = svc
            .send_message(SendRequest {
                recipient_id: "u2".to_string(),
                content: "hello".to_string(),
                media: None,
            })
            .unwrap();

        let svc2 = svc.clone();
        let conv = conv_id.clone();
        wait_for(move || {
            svc2.conversation_messages(&conv)
                .iter()
                .any(|m| m.id == "srv-42" && m.delivery.is_delivered())
        })
        .await;

        let timeline = svc.conversation_messages(&conv_id);
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].id, "srv-42");
        // The temporary id still resolves for callers that kept it.
        assert_eq!(
            svc.delivery_state(&conv_id, &temp_id),
            Some(DeliveryState::Delivered)
        );

        svc.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_send_then_reconnect() {
        let svc = service(StubTransport::with_send_results(vec![
            Err(SyncError::network("offline")),
            Ok("srv-9".to_string()),
        ]));
        svc.set_current_user(Some("u1"));
        let conv_id = conversation_id("u1", "u2");

        svc.send_message(SendRequest {
            recipient_id: "u2".to_string(),
            content: "hi".to_string(),
            media: None,
        })
        .unwrap();

        // First attempt fails; the message stays visible, flagged failed.
        let svc2 = svc.clone();
        let conv = conv_id.clone();
        wait_for(move || {
            svc2.conversation_messages(&conv)
                .iter()
                .any(|m| matches!(m.delivery, DeliveryState::Failed { .. }))
        })
        .await;
        assert_eq!(svc.conversation_messages(&conv_id).len(), 1);

        // The retry sweep picks it up once the transport recovers.
        let svc2 = svc.clone();
        let conv = conv_id.clone();
        wait_for(move || {
            svc2.conversation_messages(&conv)
                .iter()
                .any(|m| m.id == "srv-9" && m.delivery.is_delivered())
        })
        .await;
        assert_eq!(svc.conversation_messages(&conv_id).len(), 1);

        svc.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_suspends_retries_until_rebind() {
        let transport = Arc::new(StubTransport::with_send_results(vec![
            Err(SyncError::auth("token expired")),
            Err(SyncError::auth("token expired")),
        ]));
        let svc = SyncService::new(
            Box::new(MemoryStore::new()),
            transport.clone(),
            SyncOptions::default(),
        );
        svc.set_current_user(Some("u1"));
        let conv_id = conversation_id("u1", "u2");

        svc.send_message(SendRequest {
            recipient_id: "u2".to_string(),
            content: "hi".to_string(),
            media: None,
        })
        .unwrap();

        let svc2 = svc.clone();
        let conv = conv_id.clone();
        wait_for(move || {
            svc2.conversation_messages(&conv)
                .iter()
                .any(|m| matches!(m.delivery, DeliveryState::Failed { .. }))
        })
        .await;

        // The sweep must not hammer an expired credential.
        svc.flush_pending().await;
        svc.flush_pending().await;
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.send_calls.load(Ordering::SeqCst), 1);

        // Rebinding with fresh credentials re-arms delivery.
        svc.set_current_user(None);
        svc.set_current_user(Some("u1"));
        svc.flush_pending().await;
        assert_eq!(transport.send_calls.load(Ordering::SeqCst), 2);

        svc.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_and_outbound_order_by_sent_at() {
        let svc = service(StubTransport::stalled());
        svc.set_current_user(Some("u1"));
        let conv_id = conversation_id("u1", "u2");
        let _guard = svc.listen_to_conversation(&conv_id, |_| {});

        svc.send_message(SendRequest {
            recipient_id: "u2".to_string(),
            content: "first".to_string(),
            media: None,
        })
        .unwrap();
        let local_sent = svc.conversation_messages(&conv_id)[0].sent_at;

        // Remote message stamped 1ms after the pending local send arrives
        // afterwards; order must follow sent_at, not arrival.
        svc.apply_remote_messages(
            "u2",
            vec![remote_msg(
                "srv-1",
                "u2",
                "u1",
                "second",
                local_sent + ChronoDuration::milliseconds(1),
            )],
        );

        let timeline = svc.conversation_messages(&conv_id);
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].content, "first");
        assert_eq!(timeline[1].content, "second");

        svc.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_with_active_conversation_suppresses_unread() {
        let svc = service(StubTransport::default());
        svc.set_current_user(Some("u1"));
        let conv_id = conversation_id("u1", "u2");
        let _guard = svc.listen_to_conversation(&conv_id, |_| {});

        svc.apply_remote_messages(
            "u2",
            vec![remote_msg("srv-1", "u2", "u1", "hi", Utc::now())],
        );

        // Viewing the conversation implies it has been seen.
        assert_eq!(svc.conversation_summaries()[0].unread_count, 0);
        assert!(svc.conversation_messages(&conv_id)[0].is_read);

        svc.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_emissions() {
        let svc = service(StubTransport::default());
        svc.set_current_user(Some("u1"));
        let conv_id = conversation_id("u1", "u2");

        let count = Arc::new(Mutex::new(0usize));
        let count2 = count.clone();
        let guard = svc.listen_to_conversation(&conv_id, move |_| {
            *count2.lock().unwrap() += 1;
        });
        let after_register = *count.lock().unwrap();
        assert!(after_register >= 1);

        guard.unsubscribe();
        guard.unsubscribe(); // idempotent

        svc.apply_remote_messages(
            "u2",
            vec![remote_msg("srv-1", "u2", "u1", "hi", Utc::now())],
        );
        assert_eq!(*count.lock().unwrap(), after_register);

        svc.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_from_callback_and_repeated() {
        let svc = service(StubTransport::default());
        svc.set_current_user(Some("u1"));

        let inner = svc.clone();
        let _guard = svc.listen_to_conversation_list(move |_| {
            // Re-entrant call while a callback is executing.
            inner.cleanup();
        });

        svc.apply_remote_messages(
            "u2",
            vec![remote_msg("srv-1", "u2", "u1", "hi", Utc::now())],
        );

        svc.cleanup();
        svc.cleanup();
        assert!(svc.conversation_summaries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebind_reloads_persisted_scope() {
        let store = Box::new(MemoryStore::new());
        let svc = SyncService::new(
            store,
            Arc::new(StubTransport::with_send_results(vec![Ok(
                "srv-1".to_string()
            )])),
            SyncOptions::default(),
        );
        svc.set_current_user(Some("u1"));
        let conv_id = conversation_id("u1", "u2");

        svc.send_message(SendRequest {
            recipient_id: "u2".to_string(),
            content: "persisted".to_string(),
            media: None,
        })
        .unwrap();

        let svc2 = svc.clone();
        let conv = conv_id.clone();
        wait_for(move || {
            svc2.conversation_messages(&conv)
                .iter()
                .any(|m| m.delivery.is_delivered())
        })
        .await;

        // Unbind drops memory; rebinding the same user reloads from disk.
        svc.set_current_user(None);
        assert!(svc.conversation_messages(&conv_id).is_empty());
        svc.set_current_user(Some("u1"));
        let timeline = svc.conversation_messages(&conv_id);
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].content, "persisted");

        svc.cleanup();
    }
}
