//! Polling REST transport.
//!
//! Wraps `reqwest::Client` with bearer-token injection and a per-request
//! timeout. The synchronization service drives `fetch_*` on a fixed
//! interval; this adapter performs no change detection of its own.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{RemoteConversation, RemoteMessage, Transport};
use crate::error::SyncError;
use crate::models::Message;

/// Upper bound on any single request. A timeout is a `Network` error and
/// never rolls back optimistic local state.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RestTransport {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<RemoteMessage>,
}

#[derive(Debug, Deserialize)]
struct ConversationsResponse {
    #[serde(default)]
    conversations: Vec<RemoteConversation>,
}

impl RestTransport {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token,
        }
    }

    fn token(&self) -> Result<&str, SyncError> {
        self.bearer_token
            .as_deref()
            .ok_or_else(|| SyncError::auth("no bearer credential configured"))
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, SyncError> {
        let token = self.token()?;
        tracing::debug!("GET {}", url);
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SyncError::network(format!("GET {url} failed: {e}")))?;
        check_response(resp, url).await
    }

    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, SyncError> {
        let token = self.token()?;
        tracing::debug!("POST {}", url);
        let resp = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::network(format!("POST {url} failed: {e}")))?;
        check_response(resp, url).await
    }
}

#[async_trait]
impl Transport for RestTransport {
    async fn send(&self, msg: &Message) -> Result<RemoteMessage, SyncError> {
        let url = format!("{}/api/messages/{}", self.base_url, msg.receiver_id);
        let body = serde_json::json!({
            "content": msg.content,
            "mediaUrl": msg.media.as_ref().map(|m| m.url.clone()),
            "mediaType": msg.media.as_ref().map(|m| m.kind.clone()),
            "sentAt": msg.sent_at,
        });
        let resp = self.post(&url, &body).await?;
        resp.json::<RemoteMessage>()
            .await
            .map_err(|e| SyncError::network(format!("invalid send response: {e}")))
    }

    async fn fetch_messages(
        &self,
        _user_id: &str,
        peer_id: &str,
    ) -> Result<Vec<RemoteMessage>, SyncError> {
        let url = format!("{}/api/messages/{}", self.base_url, peer_id);
        let resp = self.get(&url).await?;
        let body: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::network(format!("invalid messages response: {e}")))?;
        Ok(body.messages)
    }

    async fn fetch_conversations(
        &self,
        _user_id: &str,
    ) -> Result<Vec<RemoteConversation>, SyncError> {
        let url = format!("{}/api/conversations", self.base_url);
        let resp = self.get(&url).await?;
        let body: ConversationsResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::network(format!("invalid conversations response: {e}")))?;
        Ok(body.conversations)
    }
}

/// Map HTTP status to the error taxonomy. 401/403 are non-transient auth
/// failures; everything else non-success is treated as transient.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response, SyncError> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(SyncError::auth(format!("HTTP {} for {url}", status.as_u16())));
    }
    if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
        let body = resp.text().await.unwrap_or_default();
        return Err(SyncError::validation(format!(
            "backend rejected request: {body}"
        )));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(SyncError::network(format!(
            "HTTP {} for {url}: {body}",
            status.as_u16()
        )));
    }
    Ok(resp)
}
