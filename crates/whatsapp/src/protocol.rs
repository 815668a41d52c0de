//! JSON frames exchanged with the WhatsApp Web bridge sidecar.
//!
//! Requests carry a numeric `id` which the sidecar echoes back in the matching
//! `response` frame. Everything else the sidecar sends is unsolicited.

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
    wapi_channels::ConnectionError,
    wapi_common::{CredentialRecord, InboundMessage},
};

/// A request from us to the sidecar, before an id is assigned.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    LoginQr,
    Restore { credentials: CredentialRecord },
    SendText { to: String, text: String },
    Disconnect,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoginQr => "login_qr",
            Self::Restore { .. } => "restore",
            Self::SendText { .. } => "send_text",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Wire form of a [`Request`].
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub id: u64,
    #[serde(flatten)]
    pub request: &'a Request,
}

/// Any frame the sidecar may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarFrame {
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<SidecarError>,
    },
    Qr {
        code: String,
    },
    Message {
        message: InboundMessage,
    },
    ConnectionFailed {
        reason: String,
    },
}

/// Error payload of a failed request.
#[derive(Debug, Clone, Deserialize)]
pub struct SidecarError {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl From<SidecarError> for ConnectionError {
    fn from(err: SidecarError) -> Self {
        match err.code.as_str() {
            "rejected" | "logged_out" => Self::Rejected(err.message),
            "qr_timeout" => Self::QrTimeout,
            "not_logged_in" => Self::NotLoggedIn,
            "not_connected" => Self::NotConnected,
            _ => Self::Protocol(format!("{}: {}", err.code, err.message)),
        }
    }
}

/// Result body of `login_qr`, `restore` and `disconnect`.
#[derive(Debug, Deserialize)]
pub struct CredentialsReply {
    pub credentials: CredentialRecord,
}
