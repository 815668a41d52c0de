//! Value types shared by every wapi crate.

pub mod types;

pub use types::{CredentialRecord, InboundMessage, SentMessage, now_secs};
