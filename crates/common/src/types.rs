use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    serde::{Deserialize, Deserializer, Serialize, Serializer},
};

/// Current wall-clock time in epoch seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// A text message delivered to one of our sessions by the network.
///
/// Transient: it only lives while the relay processes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Network-assigned message identifier, the dedup key.
    pub id: String,
    /// Chat the message belongs to.
    pub remote_jid: String,
    /// Author of the message (differs from `remote_jid` in groups).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_jid: Option<String>,
    /// Set when the message was written by the session's own account.
    #[serde(default)]
    pub from_me: bool,
    /// Epoch seconds, as reported by the network.
    pub timestamp: u64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_message_id: Option<String>,
}

/// Result of an outbound send, echoed back to the HTTP caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: String,
    pub chat_id: String,
    pub text: String,
    pub timestamp: u64,
}

// ── Credentials ──────────────────────────────────────────────────────────────

/// Opaque proof of a successful login, issued by the network.
///
/// Serialized as base64 so it can sit inside JSON documents.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord(Vec<u8>);

impl CredentialRecord {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialRecord([REDACTED; {} bytes])", self.0.len())
    }
}

impl Serialize for CredentialRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for CredentialRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}
