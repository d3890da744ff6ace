//! Offline-first direct-message synchronization.
//!
//! Messages flow in from three channels (local optimistic writes, push
//! frames, poll results) and converge into one ordered, deduplicated
//! timeline per conversation. The [`sync::SyncService`] owns all state and
//! exposes the operation surface a UI consumes: send, listen, mark-as-read,
//! plus a connection-status observable.

pub mod config;
pub mod error;
pub mod models;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod transport;

pub use error::SyncError;
pub use models::{Conversation, ConversationSummary, DeliveryState, MediaRef, Message};
pub use sync::{ListenerGuard, SendRequest, SyncOptions, SyncService};
pub use transport::ConnectionStatus;
