//! Push-style websocket transport.
//!
//! Maintains a standing subscription that fires on every remote write: the
//! backend streams JSON frames carrying full message/conversation sets,
//! which are forwarded to the synchronization service as [`RemoteEvent`]s.
//! Sends and on-demand fetches go over the same REST surface as the polling
//! transport; only the inbound path differs.
//!
//! Reconnects with exponential backoff (2s, 4s, 8s). After three consecutive
//! failed connection attempts the stream ends and the service degrades to
//! local-only operation; a stable connection resets the attempt counter.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use super::rest::RestTransport;
use super::{RemoteConversation, RemoteEvent, RemoteMessage, Transport};
use crate::error::SyncError;
use crate::models::Message;

const BACKOFF_BASE: Duration = Duration::from_secs(2);
const MAX_CONNECT_ATTEMPTS: u32 = 3;
/// A connection alive this long is considered stable; the attempt counter
/// resets so a later drop gets a fresh retry budget.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

pub struct PushTransport {
    rest: RestTransport,
    stream_url: String,
    bearer_token: Option<String>,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Inbound frame shapes on the stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum PushFrame {
    #[serde(rename_all = "camelCase")]
    Messages {
        #[serde(alias = "peer_id")]
        peer_id: String,
        #[serde(default)]
        messages: Vec<RemoteMessage>,
    },
    Conversations {
        #[serde(default)]
        conversations: Vec<RemoteConversation>,
    },
}

impl PushTransport {
    pub fn new(
        api_base: impl Into<String>,
        stream_url: impl Into<String>,
        bearer_token: Option<String>,
    ) -> Self {
        Self {
            rest: RestTransport::new(api_base, bearer_token.clone()),
            stream_url: stream_url.into().trim_end_matches('/').to_string(),
            bearer_token,
        }
    }

    fn ws_url(&self, user_id: &str) -> Result<String, SyncError> {
        let token = self
            .bearer_token
            .as_deref()
            .ok_or_else(|| SyncError::auth("no bearer credential configured"))?;
        let url = format!(
            "{}/v1/stream?user={}&token={}",
            self.stream_url, user_id, token
        );
        Ok(url
            .replace("https://", "wss://")
            .replace("http://", "ws://"))
    }
}

#[async_trait]
impl Transport for PushTransport {
    async fn send(&self, msg: &Message) -> Result<RemoteMessage, SyncError> {
        self.rest.send(msg).await
    }

    async fn fetch_messages(
        &self,
        user_id: &str,
        peer_id: &str,
    ) -> Result<Vec<RemoteMessage>, SyncError> {
        self.rest.fetch_messages(user_id, peer_id).await
    }

    async fn fetch_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<RemoteConversation>, SyncError> {
        self.rest.fetch_conversations(user_id).await
    }

    async fn subscribe(
        &self,
        user_id: &str,
    ) -> Result<Option<mpsc::Receiver<RemoteEvent>>, SyncError> {
        // Credential problems surface here synchronously; connection problems
        // surface later as a closed stream, never as a panic in the task.
        let url = self.ws_url(user_id)?;
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(stream_loop(url, tx));
        Ok(Some(rx))
    }
}

/// Connection loop with backoff. Exits when the receiver is dropped or the
/// retry budget is exhausted.
async fn stream_loop(url: String, tx: mpsc::Sender<RemoteEvent>) {
    let mut attempts = 0u32;

    loop {
        match connect_async(&url).await {
            Ok((stream, response)) => {
                tracing::info!("Push stream connected (status={})", response.status());
                let connected_at = Instant::now();

                let closed = drive_connection(stream, &tx).await;
                if connected_at.elapsed() >= STABILITY_THRESHOLD {
                    attempts = 0;
                }
                if closed {
                    // Receiver gone; the session is over.
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Push stream connection failed: {e}");
            }
        }

        attempts += 1;
        if attempts >= MAX_CONNECT_ATTEMPTS {
            tracing::warn!(
                "Push stream gave up after {} attempts, degrading to local-only",
                attempts
            );
            return;
        }

        let backoff = BACKOFF_BASE * 2u32.saturating_pow(attempts - 1);
        tracing::info!("Push stream reconnecting in {:?}", backoff);
        time::sleep(backoff).await;
    }
}

/// Pump one websocket connection until it drops. Returns true when the
/// event receiver has been dropped (no reconnect wanted).
async fn drive_connection(mut stream: WsStream, tx: &mpsc::Sender<RemoteEvent>) -> bool {
    let mut heartbeat = time::interval(Duration::from_secs(30));
    heartbeat.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match parse_frame(&text) {
                            Ok(Some(event)) => {
                                if tx.send(event).await.is_err() {
                                    return true;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                tracing::debug!("Unparseable push frame ({e:#}): {text}");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = stream.send(WsMessage::Pong(data)).await {
                            tracing::warn!("Failed to send pong: {e}");
                            return false;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        tracing::info!("Push stream closed by server: {:?}", frame);
                        return false;
                    }
                    Some(Ok(other)) => {
                        tracing::debug!("Push frame (ignored): {:?}", other);
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Push stream receive error: {e}");
                        return false;
                    }
                    None => return false,
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = stream.send(WsMessage::Text("ping".to_string())).await {
                    tracing::warn!("Heartbeat send failed: {e}");
                    return false;
                }
            }
            _ = tx.closed() => {
                return true;
            }
        }
    }
}

/// Parse one text frame into an event. Heartbeat echoes yield `None`.
fn parse_frame(text: &str) -> Result<Option<RemoteEvent>> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "ping" || trimmed == "pong" {
        return Ok(None);
    }
    let frame: PushFrame = serde_json::from_str(trimmed).context("Failed to parse push frame")?;
    Ok(Some(match frame {
        PushFrame::Messages { peer_id, messages } => RemoteEvent::Messages { peer_id, messages },
        PushFrame::Conversations { conversations } => RemoteEvent::Conversations(conversations),
    }))
}
