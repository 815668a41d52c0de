//! WhatsApp Web connector.
//!
//! The multi-device protocol runs in a bridge sidecar. Each session gets its
//! own WebSocket to the sidecar; see [`protocol`] for the frames.

pub mod connection;
pub mod protocol;

pub use connection::{SidecarConnection, SidecarConnector};
