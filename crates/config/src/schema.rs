/// Config schema types (server, webhook, dedup, sessions, whatsapp bridge).
use std::{path::PathBuf, time::Duration};

use {secrecy::Secret, serde::Deserialize};

/// Root configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WapiConfig {
    pub server: ServerConfig,
    pub webhook: WebhookConfig,
    pub dedup: DedupConfig,
    pub sessions: SessionsConfig,
    pub whatsapp: WhatsAppConfig,
}

/// HTTP surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host or IP to bind. Required.
    pub bind: String,
    pub port: u16,
    /// PEM certificate; TLS is enabled when both cert and key are set.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Externally reachable host, used when logging the QR page URL.
    pub public_url: Option<String>,
    /// Directory served under `/static/`; QR images land in `qr-codes/`.
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: String::new(),
            port: 443,
            tls_cert: None,
            tls_key: None,
            public_url: None,
            static_dir: PathBuf::from("static"),
        }
    }
}

/// Outbound webhook for relayed messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Base URL; the session name is appended verbatim. Required.
    pub base_url: String,
    pub timeout_secs: u64,
    pub accept_invalid_certs: bool,
    /// Treat non-2xx responses as delivery failures.
    pub fail_on_status: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: 10,
            accept_invalid_certs: true,
            fail_on_status: false,
        }
    }
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Shared dedup ledger.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// `redis://…` URL or bare `host:port`. Required.
    pub redis_url: Option<Secret<String>>,
    pub ttl_days: u64,
    pub key_prefix: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl_days: 30,
            key_prefix: "wapi_sent_message:".into(),
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_days * 24 * 60 * 60)
    }
}

/// Session lifecycle tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Where credential records are stored. Defaults to `~/.wapi/sessions`.
    pub credentials_dir: Option<PathBuf>,
    pub login_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_cooldown_secs: u64,
    pub send_settle_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            credentials_dir: None,
            login_timeout_secs: 120,
            connect_timeout_secs: 20,
            reconnect_cooldown_secs: 30,
            send_settle_ms: 3000,
            shutdown_grace_secs: 10,
        }
    }
}

impl SessionsConfig {
    pub fn credentials_dir(&self) -> PathBuf {
        self.credentials_dir
            .clone()
            .unwrap_or_else(|| crate::loader::data_dir().join("sessions"))
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_secs(self.reconnect_cooldown_secs)
    }

    pub fn send_settle_delay(&self) -> Duration {
        Duration::from_millis(self.send_settle_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// WhatsApp Web bridge sidecar.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// WebSocket base URL of the bridge.
    pub sidecar_url: String,
    pub request_timeout_secs: u64,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            sidecar_url: "ws://127.0.0.1:3000".into(),
            request_timeout_secs: 30,
        }
    }
}

impl WhatsAppConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
