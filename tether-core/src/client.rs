//! Capability interface onto the external messaging-client library.
//!
//! The lifecycle core never talks to the messaging platform directly. It asks a
//! `MessagingClient` for a session and gets back a `SessionHandle` (send,
//! account metadata, destroy) plus the receiving end of the session's event
//! channel. Events for one session arrive in emission order.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::AccountInfo;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Session closed")]
    Closed,
}

/// Lifecycle events emitted by an external session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A (possibly rotated) QR payload to be scanned.
    Qr(String),
    Ready,
    /// The platform explicitly rejected authentication.
    AuthFailure(String),
    Disconnected(String),
}

/// Where a session keeps its credentials and cache, and whether it should try
/// to resume from stored credentials instead of pairing from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub auth_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Media {
        mime_type: String,
        /// Base64-encoded payload
        data: String,
        filename: Option<String>,
        caption: Option<String>,
    },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        MessageContent::Text { body: body.into() }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text { body } => body.trim().is_empty(),
            MessageContent::Media { data, mime_type, .. } => {
                data.is_empty() || mime_type.trim().is_empty()
            }
        }
    }
}

/// Acknowledgement returned by the client once a send is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAck {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

/// A freshly created session: its handle plus its event stream.
pub struct SessionParts {
    pub handle: Arc<dyn SessionHandle>,
    pub events: mpsc::Receiver<SessionEvent>,
}

#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn create_session(
        &self,
        connection_id: &str,
        options: SessionOptions,
    ) -> Result<SessionParts, ClientError>;

    /// Client name for logging.
    fn name(&self) -> &str;
}

#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn send_message(&self, jid: &str, content: &MessageContent) -> Result<SendAck, ClientError>;

    async fn account_info(&self) -> Result<AccountInfo, ClientError>;

    /// Close the session. Stored credentials stay on disk.
    async fn destroy(&self) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_serializes_with_type_tag() {
        let json = serde_json::to_value(MessageContent::text("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "body": "hi"}));
    }

    #[test]
    fn blank_content_is_empty() {
        assert!(MessageContent::text("   ").is_empty());
        assert!(!MessageContent::text("hi").is_empty());
        let media = MessageContent::Media {
            mime_type: "image/png".into(),
            data: String::new(),
            filename: None,
            caption: Some("pic".into()),
        };
        assert!(media.is_empty());
    }
}
