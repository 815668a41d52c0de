//! Session registry and credential persistence.
//!
//! Sessions live in memory for the lifetime of the process, keyed by the
//! exact caller-chosen name. Credential records are stored one file per
//! session under a fixed directory and replaced atomically on every save.

pub mod credentials;
pub mod name;
pub mod state;
pub mod store;

pub use {
    credentials::{CredentialError, CredentialStore},
    name::{InvalidSessionName, validate_session_name},
    state::SessionState,
    store::{Session, SessionGuard, SessionHandle, SessionStore},
};
