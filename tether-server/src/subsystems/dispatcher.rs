//! Outbound message dispatch through a connection's live session.

use std::sync::Arc;

use tether_core::{ConnectionStatus, MessageContent, SendAck, TetherError, TetherResult};

use super::registry::ClientRegistry;

/// Normalize a user-supplied recipient into a platform address.
///
/// Phone numbers lose a leading `+`, spaces and dashes, and get
/// `@<suffix>` appended. Anything already containing `@` is kept as is.
pub fn normalize_recipient(to: &str, suffix: &str) -> TetherResult<String> {
    let trimmed = to.trim();
    let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if trimmed.contains('@') {
        return Ok(trimmed.to_string());
    }

    let number: String = trimmed
        .chars()
        .filter(|c| *c != ' ' && *c != '-')
        .collect();
    if number.is_empty() {
        return Err(TetherError::Validation("recipient is required".to_string()));
    }
    Ok(format!("{}@{}", number, suffix))
}

pub struct MessageDispatcher {
    registry: Arc<ClientRegistry>,
    jid_suffix: String,
}

impl MessageDispatcher {
    pub fn new(registry: Arc<ClientRegistry>, jid_suffix: impl Into<String>) -> Self {
        Self {
            registry,
            jid_suffix: jid_suffix.into(),
        }
    }

    pub async fn send(
        &self,
        connection_id: &str,
        to: &str,
        content: &MessageContent,
    ) -> TetherResult<SendAck> {
        if to.trim().is_empty() {
            return Err(TetherError::Validation("recipient is required".to_string()));
        }
        if content.is_empty() {
            return Err(TetherError::Validation("message content is required".to_string()));
        }

        let session = self.registry.get(connection_id).ok_or_else(|| {
            TetherError::NotFound(format!("no active session for connection {}", connection_id))
        })?;
        if session.status != ConnectionStatus::Ready {
            return Err(TetherError::NotReady {
                connection_id: connection_id.to_string(),
                status: session.status,
            });
        }

        let jid = normalize_recipient(to, &self.jid_suffix)?;
        let ack = session
            .handle
            .send_message(&jid, content)
            .await
            .map_err(|e| TetherError::Delivery {
                connection_id: connection_id.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(connection_id = %connection_id, message_id = %ack.id, "Message sent");
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_number_gets_suffix() {
        assert_eq!(
            normalize_recipient("15551234567", "c.us").unwrap(),
            "15551234567@c.us"
        );
    }

    #[test]
    fn formatting_is_stripped() {
        assert_eq!(
            normalize_recipient("  +1 555-123-4567 ", "c.us").unwrap(),
            "15551234567@c.us"
        );
    }

    #[test]
    fn existing_address_is_kept() {
        assert_eq!(
            normalize_recipient("120363000000@g.us", "c.us").unwrap(),
            "120363000000@g.us"
        );
    }

    #[test]
    fn custom_suffix_is_used() {
        assert_eq!(
            normalize_recipient("4477", "s.whatsapp.net").unwrap(),
            "4477@s.whatsapp.net"
        );
    }

    #[test]
    fn blank_recipient_is_rejected() {
        let err = normalize_recipient(" + - ", "c.us").unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let dispatcher = MessageDispatcher::new(Arc::new(ClientRegistry::new()), "c.us");
        let err = dispatcher
            .send("c2", "15551234567", &MessageContent::text("hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn empty_content_is_rejected_first() {
        let dispatcher = MessageDispatcher::new(Arc::new(ClientRegistry::new()), "c.us");
        let err = dispatcher
            .send("c2", "15551234567", &MessageContent::text(""))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }
}
