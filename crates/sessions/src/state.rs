use std::fmt;

use serde::Serialize;

/// Authentication state of a session.
///
/// ```text
/// UNAUTHENTICATED ──► RESTORING ─────────► AUTHENTICATED
///        │                │ (restore failed)     ▲
///        └────────────────┴─► AWAITING_QR_SCAN ──┘
/// ```
///
/// Any failure drops the session back to `Unauthenticated`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Unauthenticated,
    Restoring,
    AwaitingQrScan,
    Authenticated,
}

impl SessionState {
    pub fn is_authenticated(self) -> bool {
        self == Self::Authenticated
    }

    /// Login is running (restore or waiting for a scan).
    pub fn is_logging_in(self) -> bool {
        matches!(self, Self::Restoring | Self::AwaitingQrScan)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Restoring => "restoring",
            Self::AwaitingQrScan => "awaiting_qr_scan",
            Self::Authenticated => "authenticated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
