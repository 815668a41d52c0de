//! Messaging-network connection seam.
//!
//! The wire protocol, handshake and framing of the network live behind the
//! [`Connection`] trait. A [`Connector`] opens one connection per session;
//! the gateway drives login, sending and event consumption through it.

pub mod connection;

pub use connection::{Connection, ConnectionError, ConnectionEvent, Connector, EventStream};
