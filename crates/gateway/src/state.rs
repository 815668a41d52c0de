use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    wapi_channels::Connector,
    wapi_config::{WapiConfig, WebhookConfig},
    wapi_sessions::{CredentialStore, SessionState, SessionStore},
};

use crate::{
    dedup::DedupLedger,
    login::LoginOrchestrator,
    qr::QrRenderer,
    relay::{InboundRelay, MessageRelay},
    supervisor::{Supervisor, SupervisorSettings},
    webhook::WebhookClient,
};

// ── Settings ─────────────────────────────────────────────────────────────────

/// Runtime knobs resolved from [`WapiConfig`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub webhook_base: String,
    pub webhook: WebhookConfig,
    pub static_dir: PathBuf,
    pub public_url: Option<String>,
    pub credentials_dir: PathBuf,
    pub login_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_cooldown: Duration,
    pub send_settle_delay: Duration,
    pub shutdown_grace: Duration,
}

impl GatewaySettings {
    pub fn from_config(config: &WapiConfig) -> Self {
        Self {
            webhook_base: config.webhook.base_url.clone(),
            webhook: config.webhook.clone(),
            static_dir: config.server.static_dir.clone(),
            public_url: config.server.public_url.clone(),
            credentials_dir: config.sessions.credentials_dir(),
            login_timeout: config.sessions.login_timeout(),
            connect_timeout: config.sessions.connect_timeout(),
            reconnect_cooldown: config.sessions.reconnect_cooldown(),
            send_settle_delay: config.sessions.send_settle_delay(),
            shutdown_grace: config.sessions.shutdown_grace(),
        }
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across handlers.
pub struct GatewayState {
    /// Server version string.
    pub version: String,
    pub settings: GatewaySettings,
    pub sessions: Arc<SessionStore>,
    pub login: Arc<LoginOrchestrator>,
    pub supervisor: Arc<Supervisor>,
    /// Inbound filter, dedup and webhook delivery.
    pub inbound: Arc<InboundRelay>,
    /// Outbound sends.
    pub messages: MessageRelay,
    pub qr: Arc<QrRenderer>,
    /// Prometheus scrape handle, when a recorder was installed.
    #[cfg(feature = "prometheus")]
    pub metrics: Option<wapi_metrics::PrometheusHandle>,
}

impl GatewayState {
    /// Wire the session registry, login orchestrator, supervisor and relays.
    pub fn new(
        settings: GatewaySettings,
        connector: Arc<dyn Connector>,
        ledger: Arc<dyn DedupLedger>,
    ) -> Result<Self, reqwest::Error> {
        let credentials = CredentialStore::new(&settings.credentials_dir);
        let sessions = Arc::new(SessionStore::new(settings.webhook_base.clone()));
        let qr = Arc::new(QrRenderer::new(
            settings.static_dir.clone(),
            settings.public_url.clone(),
        ));

        let inbound = Arc::new(InboundRelay::new(
            ledger,
            WebhookClient::new(&settings.webhook)?,
        ));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&connector),
            credentials.clone(),
            Arc::clone(&inbound),
            SupervisorSettings {
                reconnect_cooldown: settings.reconnect_cooldown,
                connect_timeout: settings.connect_timeout,
                restore_timeout: settings.login_timeout,
            },
        ));
        let login = Arc::new(LoginOrchestrator::new(
            connector,
            credentials,
            Arc::clone(&qr),
            Arc::clone(&supervisor),
            settings.login_timeout,
            settings.connect_timeout,
        ));
        let messages = MessageRelay::new(
            Arc::clone(&sessions),
            Arc::clone(&login),
            settings.send_settle_delay,
        );

        Ok(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            settings,
            sessions,
            login,
            supervisor,
            inbound,
            messages,
            qr,
            #[cfg(feature = "prometheus")]
            metrics: None,
        })
    }

    /// Number of sessions in each state.
    pub fn state_counts(&self) -> Vec<(SessionState, usize)> {
        let all = self.sessions.list();
        [
            SessionState::Unauthenticated,
            SessionState::Restoring,
            SessionState::AwaitingQrScan,
            SessionState::Authenticated,
        ]
        .into_iter()
        .map(|state| (state, all.iter().filter(|s| s.state() == state).count()))
        .collect()
    }
}
