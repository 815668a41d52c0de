use std::sync::Arc;

use {
    async_trait::async_trait,
    tokio::sync::mpsc,
    wapi_common::{CredentialRecord, InboundMessage, SentMessage},
};

/// Receiver half of a connection's event stream.
pub type EventStream = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Failures reported by the messaging network or its transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection is not established")]
    NotConnected,
    #[error("connection is not logged in")]
    NotLoggedIn,
    #[error("transport failure: {0}")]
    Transport(String),
    /// The network refused the login or restore (e.g. revoked credentials).
    #[error("login rejected: {0}")]
    Rejected(String),
    /// No QR code was issued or scanned within the network's timeout.
    #[error("timed out waiting for QR scan")]
    QrTimeout,
    #[error("connection closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Something the network pushed to us, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Message(InboundMessage),
    /// The transport broke underneath us. Distinct from [`ConnectionEvent::Closed`].
    Failed(String),
    /// The connection was shut down on request.
    Closed,
}

/// One live link to the messaging network for a single account.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open the transport. Does not authenticate.
    async fn connect(&self) -> Result<(), ConnectionError>;

    fn is_connected(&self) -> bool;

    /// Interactive login. Every code the network issues is sent on `codes`;
    /// resolves once a code has been scanned.
    async fn login_with_qr(
        &self,
        codes: mpsc::Sender<String>,
    ) -> Result<CredentialRecord, ConnectionError>;

    /// Log in with a previously persisted record. Returns the refreshed record.
    async fn restore_with_session(
        &self,
        record: &CredentialRecord,
    ) -> Result<CredentialRecord, ConnectionError>;

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<SentMessage, ConnectionError>;

    /// Clean shutdown. Returns the final credential state for persistence.
    async fn disconnect(&self) -> Result<CredentialRecord, ConnectionError>;

    /// Take the event stream. Events are buffered from creation, so nothing
    /// emitted during connect or restore is lost. Returns `None` once taken.
    fn take_events(&self) -> Option<EventStream>;
}

/// Opens fresh, unconnected [`Connection`]s.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, session: &str) -> Result<Arc<dyn Connection>, ConnectionError>;
}
