use {
    axum::{
        Json,
        extract::rejection::JsonRejection,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    serde_json::json,
    tracing::warn,
    wapi_channels::ConnectionError,
    wapi_sessions::InvalidSessionName,
};

use crate::{login::LoginError, relay::SendError};

/// Error returned by HTTP handlers, rendered as `{"ok": false, "error": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    InvalidSession(#[from] InvalidSessionName),
    #[error(transparent)]
    Login(#[from] LoginError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        warn!(error = %rejection.body_text(), "rejected request body");
        Self::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::InvalidSession(_) => StatusCode::BAD_REQUEST,
            Self::Login(e) => login_status(e),
            Self::Send(SendError::InvalidSession(_)) => StatusCode::BAD_REQUEST,
            Self::Send(SendError::Login(e)) => login_status(e),
            Self::Send(SendError::Connection(e)) => connection_status(e),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn login_status(e: &LoginError) -> StatusCode {
    match e {
        LoginError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        LoginError::Rejected(_) => StatusCode::BAD_GATEWAY,
        LoginError::Connection(e) => connection_status(e),
        LoginError::Credentials(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn connection_status(e: &ConnectionError) -> StatusCode {
    match e {
        ConnectionError::NotConnected
        | ConnectionError::NotLoggedIn
        | ConnectionError::Transport(_)
        | ConnectionError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        ConnectionError::QrTimeout => StatusCode::GATEWAY_TIMEOUT,
        ConnectionError::Rejected(_) | ConnectionError::Protocol(_) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(%status, error = %self, "request failed");
        }
        (status, Json(json!({ "ok": false, "error": self.to_string() }))).into_response()
    }
}
