//! Durable local store for conversations and message timelines.
//!
//! Layout on disk, scoped per local user:
//!
//! ```text
//! <data_dir>/dm-cli/store/<user_id>/conversations.json
//! <data_dir>/dm-cli/store/<user_id>/messages/<conversation_id>.json
//! ```
//!
//! Corrupt or unparseable content is recovered by resetting the affected
//! scope to empty rather than failing; the sync core must keep working with
//! whatever survives. Writes go through a temp-file rename so readers never
//! observe a partial list.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

use crate::error::SyncError;
use crate::models::{Conversation, Message};

/// Persistence contract used by the synchronization service. The service
/// and reconciler are the only writers; transports never touch the store.
pub trait Store: Send {
    fn load_conversations(&self, user_id: &str) -> HashMap<String, Conversation>;
    fn save_conversations(
        &self,
        user_id: &str,
        conversations: &HashMap<String, Conversation>,
    ) -> Result<(), SyncError>;
    fn load_messages(&self, user_id: &str, conversation_id: &str) -> Vec<Message>;
    fn save_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
        messages: &[Message],
    ) -> Result<(), SyncError>;
    /// List conversation ids that have a persisted timeline for this user.
    fn message_scopes(&self, user_id: &str) -> Vec<String>;
    fn clear_user(&self, user_id: &str) -> Result<(), SyncError>;
}

/// Filesystem-backed store rooted in the platform data directory.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open the store at the default platform location.
    pub fn open() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("com", "dm-cli", "dm-cli")
            .context("Could not determine data directory")?;
        Ok(Self {
            root: proj_dirs.data_dir().join("store"),
        })
    }

    /// Open the store at an explicit root (tests, alternate profiles).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        // User ids land in path segments; keep them filesystem safe.
        self.root.join(encode_id(user_id))
    }

    fn conversations_path(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("conversations.json")
    }

    fn messages_path(&self, user_id: &str, conversation_id: &str) -> PathBuf {
        self.user_dir(user_id)
            .join("messages")
            .join(format!("{}.json", encode_id(conversation_id)))
    }
}

impl Store for FsStore {
    fn load_conversations(&self, user_id: &str) -> HashMap<String, Conversation> {
        read_json_or_reset(&self.conversations_path(user_id))
    }

    fn save_conversations(
        &self,
        user_id: &str,
        conversations: &HashMap<String, Conversation>,
    ) -> Result<(), SyncError> {
        write_json(&self.conversations_path(user_id), conversations)
    }

    fn load_messages(&self, user_id: &str, conversation_id: &str) -> Vec<Message> {
        read_json_or_reset(&self.messages_path(user_id, conversation_id))
    }

    fn save_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
        messages: &[Message],
    ) -> Result<(), SyncError> {
        write_json(&self.messages_path(user_id, conversation_id), &messages)
    }

    fn message_scopes(&self, user_id: &str) -> Vec<String> {
        let dir = self.user_dir(user_id).join("messages");
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").map(decode_id)
            })
            .collect()
    }

    fn clear_user(&self, user_id: &str) -> Result<(), SyncError> {
        let dir = self.user_dir(user_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| SyncError::corrupt(format!("failed to clear {}: {e}", dir.display())))?;
        }
        Ok(())
    }
}

/// Read a JSON file, resetting the scope to empty on any parse failure.
fn read_json_or_reset<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Failed to read {}: {e}", path.display());
            return T::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(
                "Corrupt store file {} ({e}), resetting scope to empty",
                path.display()
            );
            let _ = fs::remove_file(path);
            T::default()
        }
    }
}

/// Serialize to a temp file in the same directory, then rename into place.
fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), SyncError> {
    let dir = path
        .parent()
        .ok_or_else(|| SyncError::corrupt("store path has no parent directory"))?;
    fs::create_dir_all(dir)
        .map_err(|e| SyncError::corrupt(format!("failed to create {}: {e}", dir.display())))?;

    let content = serde_json::to_string_pretty(value)
        .map_err(|e| SyncError::corrupt(format!("serialize failed: {e}")))?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)
        .map_err(|e| SyncError::corrupt(format!("failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| SyncError::corrupt(format!("failed to replace {}: {e}", path.display())))?;
    Ok(())
}

/// Encode an id for use as a file name. Anything outside a conservative
/// cross-platform set (`:` is reserved on Windows) becomes `%XX`; the
/// mapping is reversible so directory listings map back to ids.
fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for &b in id.as_bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn decode_id(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// In-memory store used by tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
    conversations: std::sync::Mutex<HashMap<String, HashMap<String, Conversation>>>,
    messages: std::sync::Mutex<HashMap<(String, String), Vec<Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load_conversations(&self, user_id: &str) -> HashMap<String, Conversation> {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    fn save_conversations(
        &self,
        user_id: &str,
        conversations: &HashMap<String, Conversation>,
    ) -> Result<(), SyncError> {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.to_string(), conversations.clone());
        Ok(())
    }

    fn load_messages(&self, user_id: &str, conversation_id: &str) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(user_id.to_string(), conversation_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn save_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
        messages: &[Message],
    ) -> Result<(), SyncError> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                (user_id.to_string(), conversation_id.to_string()),
                messages.to_vec(),
            );
        Ok(())
    }

    fn message_scopes(&self, user_id: &str) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|(u, _)| u == user_id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn clear_user(&self, user_id: &str) -> Result<(), SyncError> {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user_id);
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(u, _), _| u != user_id);
        Ok(())
    }
}
