//! Metric names and recorder setup.
//!
//! Call sites use the re-exported `metrics` macros with the constants in
//! [`names`], so every metric is declared in one place. Without a recorder
//! installed the macros are no-ops.

pub use metrics::{counter, gauge, histogram};

pub mod names {
    /// Inbound messages by relay outcome (`outcome` label).
    pub const RELAY_MESSAGES_TOTAL: &str = "wapi_relay_messages_total";
    /// Webhook POST latency.
    pub const WEBHOOK_DURATION_SECONDS: &str = "wapi_webhook_duration_seconds";
    /// Login attempts by `method` (restore|qr) and `result`.
    pub const LOGINS_TOTAL: &str = "wapi_logins_total";
    /// Automatic reconnects by `result`.
    pub const RECONNECTS_TOTAL: &str = "wapi_reconnects_total";
    /// Outbound sends by `result`.
    pub const SENDS_TOTAL: &str = "wapi_sends_total";
    /// Sessions currently authenticated.
    pub const SESSIONS_AUTHENTICATED: &str = "wapi_sessions_authenticated";
}

#[cfg(feature = "prometheus")]
pub use metrics_exporter_prometheus::PrometheusHandle;

#[derive(Debug, thiserror::Error)]
#[error("failed to install metrics recorder: {0}")]
pub struct RecorderError(String);

/// Install the Prometheus recorder; the handle renders the scrape body.
#[cfg(feature = "prometheus")]
pub fn install_prometheus() -> Result<PrometheusHandle, RecorderError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| RecorderError(e.to_string()))
}
