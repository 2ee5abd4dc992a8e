use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Persisted lifecycle status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    RequestingQr,
    WaitingConnection,
    Ready,
    Disconnected,
    NeedsRestore,
    AuthFailed,
    Error,
}

/// How a status change was triggered.
///
/// `Restore` is only used for sessions launched by an explicit restore call;
/// it unlocks the `disconnected | needs_restore -> waiting_connection | ready`
/// edges that are never taken automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Automatic,
    Restore,
}

impl ConnectionStatus {
    pub const ALL: [ConnectionStatus; 7] = [
        ConnectionStatus::RequestingQr,
        ConnectionStatus::WaitingConnection,
        ConnectionStatus::Ready,
        ConnectionStatus::Disconnected,
        ConnectionStatus::NeedsRestore,
        ConnectionStatus::AuthFailed,
        ConnectionStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::RequestingQr => "requesting_qr",
            ConnectionStatus::WaitingConnection => "waiting_connection",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::NeedsRestore => "needs_restore",
            ConnectionStatus::AuthFailed => "auth_failed",
            ConnectionStatus::Error => "error",
        }
    }

    /// QR payloads are only meaningful in these states.
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            ConnectionStatus::RequestingQr | ConnectionStatus::WaitingConnection
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionStatus::Error
    }

    pub fn can_transition_to(self, next: ConnectionStatus, kind: TransitionKind) -> bool {
        use ConnectionStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == Error {
            return true;
        }
        if next == AuthFailed {
            return self != AuthFailed;
        }

        let automatic = matches!(
            (self, next),
            (RequestingQr, WaitingConnection)
                | (RequestingQr, Ready)
                | (RequestingQr, Disconnected)
                | (WaitingConnection, WaitingConnection)
                | (WaitingConnection, Ready)
                | (WaitingConnection, Disconnected)
                | (Ready, Ready)
                | (Ready, Disconnected)
                | (Ready, NeedsRestore)
                | (Disconnected, Disconnected)
        );
        if automatic {
            return true;
        }

        kind == TransitionKind::Restore
            && matches!(self, Disconnected | NeedsRestore)
            && matches!(next, WaitingConnection | Ready | Disconnected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown connection status '{}'", s))
    }
}
