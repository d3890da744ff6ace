//! Error taxonomy for the synchronization core.
//!
//! Only `Validation` crosses the public contract as a synchronous error.
//! Transport failures are converted into connection-status signals and
//! per-message delivery flags; corrupt store content is recovered internally.

use std::borrow::Cow;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Caller supplied invalid input (empty message, missing ids). No state
    /// mutation has occurred when this is returned.
    #[error("validation: {0}")]
    Validation(Cow<'static, str>),

    /// Credential missing, expired, or rejected. Non-transient: the remote
    /// operation is not retried until re-authentication.
    #[error("auth: {0}")]
    Auth(Cow<'static, str>),

    /// Transient transport failure (timeout, unreachable). Retried with
    /// backoff; optimistic local state is preserved.
    #[error("network: {0}")]
    Network(Cow<'static, str>),

    /// Stored local data failed to parse. Recovered by resetting the scope.
    #[error("corrupt state: {0}")]
    CorruptState(Cow<'static, str>),
}

impl SyncError {
    pub fn validation(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn auth(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn network(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Network(msg.into())
    }

    pub fn corrupt(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::CorruptState(msg.into())
    }

    /// Whether retrying the failed operation can succeed without user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            SyncError::Auth(format!("{e}").into())
        } else {
            SyncError::Network(format!("{e}").into())
        }
    }
}
