//! HTTP sidecar implementation of the messaging-client capability.
//!
//! The messaging library itself runs in a sidecar process that exposes a
//! small JSON API:
//! - `POST   /sessions`                       create or resume a session
//! - `GET    /sessions/{id}/events?cursor=N`  lifecycle events after `cursor`
//! - `POST   /sessions/{id}/messages`         send a message
//! - `GET    /sessions/{id}/account`          account metadata
//! - `DELETE /sessions/{id}`                  close the session
//!
//! Each session gets a poll task that forwards events into a bounded channel,
//! preserving the sidecar's emission order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tokio_util::sync::CancellationToken;

use crate::client::{
    ClientError, MessageContent, MessagingClient, SendAck, SessionEvent, SessionHandle,
    SessionOptions, SessionParts,
};
use crate::config::SidecarConfig;
use crate::models::AccountInfo;

/// Env var holding the optional bearer token for the sidecar API.
pub const SIDECAR_TOKEN_ENV: &str = "TETHER_SIDECAR_TOKEN";

// ============================================================================
// Wire types (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    session_id: &'a str,
    auth_dir: String,
    cache_dir: String,
    resume: bool,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    jid: &'a str,
    content: &'a MessageContent,
}

#[derive(Debug, Deserialize)]
struct EventBatch {
    events: Vec<WireEvent>,
    cursor: u64,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    seq: u64,
    #[serde(rename = "type")]
    kind: String,
    data: Option<String>,
}

impl WireEvent {
    fn into_event(self) -> Option<SessionEvent> {
        let data = self.data.unwrap_or_default();
        match self.kind.as_str() {
            "qr" => Some(SessionEvent::Qr(data)),
            "ready" => Some(SessionEvent::Ready),
            "auth_failure" => Some(SessionEvent::AuthFailure(data)),
            "disconnected" => Some(SessionEvent::Disconnected(data)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

// ============================================================================
// SidecarClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct SidecarClient {
    http: Client,
    config: SidecarConfig,
    base_url: String,
    token: Option<String>,
    event_buffer: usize,
}

impl SidecarClient {
    pub fn new(config: SidecarConfig, event_buffer: usize) -> Result<Self, ClientError> {
        let base_url = config.base_url.clone();
        Self::with_base_url(config, base_url, event_buffer)
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(
        config: SidecarConfig,
        base_url: String,
        event_buffer: usize,
    ) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let token = std::env::var(SIDECAR_TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty());

        Ok(Self {
            http,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            event_buffer: event_buffer.max(1),
        })
    }

    /// Total session-creation requests: the first try plus `max_retries`.
    pub fn create_attempts(&self) -> usize {
        self.config.max_retries + 1
    }

    async fn create_once(&self, request: &CreateSessionRequest<'_>) -> Result<(), ClientError> {
        let url = format!("{}/sessions", self.base_url);
        let builder = authorize(self.http.post(&url), self.token.as_deref());
        let response = builder.json(request).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl MessagingClient for SidecarClient {
    async fn create_session(
        &self,
        connection_id: &str,
        options: SessionOptions,
    ) -> Result<SessionParts, ClientError> {
        let request = CreateSessionRequest {
            session_id: connection_id,
            auth_dir: options.auth_dir.display().to_string(),
            cache_dir: options.cache_dir.display().to_string(),
            resume: options.resume,
        };

        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        if let Err(e) = Retry::spawn(retry_strategy, || self.create_once(&request)).await {
            tracing::error!(
                connection_id = %connection_id,
                attempts = self.create_attempts(),
                error = %e,
                "Sidecar session creation failed"
            );
            return Err(e);
        }

        let session = Arc::new(SidecarSession {
            http: self.http.clone(),
            session_url: format!("{}/sessions/{}", self.base_url, connection_id),
            token: self.token.clone(),
            connection_id: connection_id.to_string(),
            cancel: CancellationToken::new(),
        });

        let (tx, rx) = mpsc::channel(self.event_buffer);
        tokio::spawn(poll_events(
            session.clone(),
            tx,
            Duration::from_millis(self.config.poll_interval_ms),
            self.config.max_poll_failures.max(1),
        ));

        tracing::info!(connection_id = %connection_id, resume = options.resume, "Sidecar session created");

        Ok(SessionParts {
            handle: session,
            events: rx,
        })
    }

    fn name(&self) -> &str {
        "sidecar"
    }
}

// ============================================================================
// SidecarSession
// ============================================================================

struct SidecarSession {
    http: Client,
    session_url: String,
    token: Option<String>,
    connection_id: String,
    cancel: CancellationToken,
}

impl SidecarSession {
    async fn fetch_events(&self, cursor: u64) -> Result<EventBatch, ClientError> {
        let url = format!("{}/events", self.session_url);
        let builder = authorize(self.http.get(&url), self.token.as_deref())
            .query(&[("cursor", cursor)]);
        let response = check_status(builder.send().await?).await?;
        response
            .json::<EventBatch>()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl SessionHandle for SidecarSession {
    async fn send_message(&self, jid: &str, content: &MessageContent) -> Result<SendAck, ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let url = format!("{}/messages", self.session_url);
        let builder = authorize(self.http.post(&url), self.token.as_deref());
        let response = builder
            .json(&SendMessageRequest { jid, content })
            .send()
            .await?;
        check_status(response)
            .await?
            .json::<SendAck>()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn account_info(&self) -> Result<AccountInfo, ClientError> {
        let url = format!("{}/account", self.session_url);
        let builder = authorize(self.http.get(&url), self.token.as_deref());
        check_status(builder.send().await?)
            .await?
            .json::<AccountInfo>()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        self.cancel.cancel();
        let builder = authorize(self.http.delete(&self.session_url), self.token.as_deref());
        let response = builder.send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(connection_id = %self.connection_id, "Sidecar session already gone");
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }
}

/// Forward sidecar events into the session channel until the session ends,
/// the receiver is dropped, or the session is destroyed.
async fn poll_events(
    session: Arc<SidecarSession>,
    tx: mpsc::Sender<SessionEvent>,
    poll_interval: Duration,
    max_failures: u32,
) {
    let mut cursor = 0u64;
    let mut failures = 0u32;

    loop {
        let batch = tokio::select! {
            _ = session.cancel.cancelled() => return,
            batch = session.fetch_events(cursor) => batch,
        };

        match batch {
            Ok(batch) => {
                failures = 0;
                cursor = cursor.max(batch.cursor);
                for wire in batch.events {
                    let seq = wire.seq;
                    let Some(event) = wire.into_event() else {
                        tracing::warn!(connection_id = %session.connection_id, seq, "Ignoring unknown sidecar event");
                        continue;
                    };
                    let terminal = matches!(
                        event,
                        SessionEvent::AuthFailure(_) | SessionEvent::Disconnected(_)
                    );
                    if tx.send(event).await.is_err() {
                        return;
                    }
                    if terminal {
                        return;
                    }
                }
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    connection_id = %session.connection_id,
                    failures,
                    error = %e,
                    "Sidecar event poll failed"
                );
                if failures >= max_failures {
                    let _ = tx
                        .send(SessionEvent::Disconnected("sidecar unreachable".to_string()))
                        .await;
                    return;
                }
            }
        }

        tokio::select! {
            _ = session.cancel.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn authorize(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or(body);

    tracing::debug!(code = status.as_u16(), message = %message, "Sidecar API error");
    Err(ClientError::Api {
        code: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_events_map_to_session_events() {
        let qr = WireEvent { seq: 1, kind: "qr".into(), data: Some("QR1".into()) };
        assert_eq!(qr.into_event(), Some(SessionEvent::Qr("QR1".into())));

        let ready = WireEvent { seq: 2, kind: "ready".into(), data: None };
        assert_eq!(ready.into_event(), Some(SessionEvent::Ready));

        let gone = WireEvent { seq: 3, kind: "disconnected".into(), data: Some("LOGOUT".into()) };
        assert_eq!(gone.into_event(), Some(SessionEvent::Disconnected("LOGOUT".into())));

        let unknown = WireEvent { seq: 4, kind: "battery".into(), data: None };
        assert_eq!(unknown.into_event(), None);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = SidecarClient::with_base_url(
            SidecarConfig::default(),
            "http://localhost:3100/".to_string(),
            8,
        )
        .unwrap();
        assert_eq!(client.base_url, "http://localhost:3100");
    }

    #[test]
    fn create_attempts_include_first_try() {
        let config = SidecarConfig {
            max_retries: 3,
            ..SidecarConfig::default()
        };
        let client =
            SidecarClient::with_base_url(config, "http://localhost:3100".to_string(), 8).unwrap();
        assert_eq!(client.create_attempts(), 4);
    }
}
