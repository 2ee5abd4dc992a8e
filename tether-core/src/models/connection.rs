use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::{ConnectionStatus, TransitionKind};
use crate::error::{TetherError, TetherResult};

/// Account metadata captured best-effort once a session is ready.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub phone_number: Option<String>,
    pub external_id: Option<String>,
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub profile_picture_url: Option<String>,
    pub status_message: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Durable record of one tenant's messaging connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub owner_id: String,
    pub status: ConnectionStatus,
    pub qr_code: Option<String>,
    pub account_info: Option<AccountInfo>,
    pub created_at: DateTime<Utc>,
    pub last_qr_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub auth_failed_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub disconnect_reason: Option<String>,
}

impl Connection {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            status: ConnectionStatus::RequestingQr,
            qr_code: None,
            account_info: None,
            created_at: Utc::now(),
            last_qr_at: None,
            ready_at: None,
            disconnected_at: None,
            auth_failed_at: None,
            last_activity: None,
            error: None,
            disconnect_reason: None,
        }
    }

    /// Move to `next`, rejecting edges the state machine does not allow.
    /// The record is left untouched on rejection.
    pub fn transition(&mut self, next: ConnectionStatus, kind: TransitionKind) -> TetherResult<()> {
        if !self.status.can_transition_to(next, kind) {
            return Err(TetherError::Validation(format!(
                "illegal status transition for {}: {} -> {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if !next.is_handshaking() {
            self.qr_code = None;
        }
        Ok(())
    }

    pub fn mark_qr(&mut self, qr: String, kind: TransitionKind, at: DateTime<Utc>) -> TetherResult<()> {
        self.transition(ConnectionStatus::WaitingConnection, kind)?;
        self.qr_code = Some(qr);
        self.last_qr_at = Some(at);
        Ok(())
    }

    pub fn mark_ready(&mut self, kind: TransitionKind, at: DateTime<Utc>) -> TetherResult<()> {
        self.transition(ConnectionStatus::Ready, kind)?;
        self.ready_at = Some(at);
        self.last_activity = Some(at);
        self.error = None;
        self.disconnect_reason = None;
        Ok(())
    }

    pub fn mark_disconnected(
        &mut self,
        reason: impl Into<String>,
        kind: TransitionKind,
        at: DateTime<Utc>,
    ) -> TetherResult<()> {
        self.transition(ConnectionStatus::Disconnected, kind)?;
        self.disconnected_at = Some(at);
        self.disconnect_reason = Some(reason.into());
        Ok(())
    }

    pub fn mark_auth_failed(&mut self, message: impl Into<String>, at: DateTime<Utc>) -> TetherResult<()> {
        self.transition(ConnectionStatus::AuthFailed, TransitionKind::Automatic)?;
        self.auth_failed_at = Some(at);
        self.error = Some(message.into());
        Ok(())
    }

    pub fn mark_needs_restore(&mut self, message: impl Into<String>) -> TetherResult<()> {
        self.transition(ConnectionStatus::NeedsRestore, TransitionKind::Automatic)?;
        self.error = Some(message.into());
        Ok(())
    }
}

/// Live, in-memory state of a connection's session, if one is registered.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSnapshot {
    pub status: ConnectionStatus,
    pub last_qr: Option<String>,
}

/// Read model handed to the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionView {
    pub id: String,
    pub owner_id: String,
    pub status: ConnectionStatus,
    pub active: bool,
    pub live_status: Option<ConnectionStatus>,
    pub qr_code: Option<String>,
    pub account_info: Option<AccountInfo>,
    pub created_at: DateTime<Utc>,
    pub last_qr_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub auth_failed_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub disconnect_reason: Option<String>,
}

impl ConnectionView {
    pub fn new(connection: Connection, live: Option<LiveSnapshot>) -> Self {
        let qr_code = match &live {
            Some(snapshot) if snapshot.status.is_handshaking() => {
                snapshot.last_qr.clone().or(connection.qr_code.clone())
            }
            _ if connection.status.is_handshaking() => connection.qr_code.clone(),
            _ => None,
        };

        Self {
            id: connection.id,
            owner_id: connection.owner_id,
            status: connection.status,
            active: live.is_some(),
            live_status: live.map(|s| s.status),
            qr_code,
            account_info: connection.account_info,
            created_at: connection.created_at,
            last_qr_at: connection.last_qr_at,
            ready_at: connection.ready_at,
            disconnected_at: connection.disconnected_at,
            auth_failed_at: connection.auth_failed_at,
            last_activity: connection.last_activity,
            error: connection.error,
            disconnect_reason: connection.disconnect_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_requests_qr() {
        let conn = Connection::new("c1", "key-1");
        assert_eq!(conn.status, ConnectionStatus::RequestingQr);
        assert!(conn.qr_code.is_none());
    }

    #[test]
    fn ready_clears_qr_and_errors() {
        let mut conn = Connection::new("c1", "key-1");
        let now = Utc::now();
        conn.mark_qr("data:qr".into(), TransitionKind::Automatic, now).unwrap();
        conn.error = Some("old".into());
        conn.mark_ready(TransitionKind::Automatic, now).unwrap();

        assert_eq!(conn.status, ConnectionStatus::Ready);
        assert_eq!(conn.ready_at, Some(now));
        assert!(conn.qr_code.is_none());
        assert!(conn.error.is_none());
    }

    #[test]
    fn rejected_transition_leaves_record_untouched() {
        let mut conn = Connection::new("c1", "key-1");
        conn.status = ConnectionStatus::Disconnected;
        let before = conn.clone();

        let err = conn
            .mark_qr("data:qr".into(), TransitionKind::Automatic, Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "validation");
        assert_eq!(conn, before);
    }

    #[test]
    fn view_prefers_live_qr_while_handshaking() {
        let mut conn = Connection::new("c1", "key-1");
        conn.mark_qr("persisted".into(), TransitionKind::Automatic, Utc::now()).unwrap();
        let live = LiveSnapshot {
            status: ConnectionStatus::WaitingConnection,
            last_qr: Some("fresh".into()),
        };

        let view = ConnectionView::new(conn, Some(live));
        assert!(view.active);
        assert_eq!(view.qr_code.as_deref(), Some("fresh"));
        assert_eq!(view.live_status, Some(ConnectionStatus::WaitingConnection));
    }

    #[test]
    fn view_hides_qr_once_ready() {
        let mut conn = Connection::new("c1", "key-1");
        conn.status = ConnectionStatus::Ready;
        conn.qr_code = Some("stale".into());

        let view = ConnectionView::new(conn, None);
        assert!(!view.active);
        assert!(view.qr_code.is_none());
    }
}
