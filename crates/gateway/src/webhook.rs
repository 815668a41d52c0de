use {
    reqwest::StatusCode,
    serde::Serialize,
    tracing::{debug, warn},
    wapi_common::InboundMessage,
    wapi_config::WebhookConfig,
};

/// Version of the JSON body POSTed to webhooks.
pub const WEBHOOK_CONTRACT_VERSION: u32 = 1;

/// Header carrying [`WEBHOOK_CONTRACT_VERSION`] on every delivery.
pub const VERSION_HEADER: &str = "X-Wapi-Webhook-Version";

/// Body of one webhook delivery.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub version: u32,
    pub session: &'a str,
    pub message: &'a InboundMessage,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayDeliveryError {
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webhook answered {0}")]
    Status(StatusCode),
}

/// HTTP client for webhook deliveries.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    fail_on_status: bool,
}

impl WebhookClient {
    pub fn new(config: &WebhookConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self {
            http,
            fail_on_status: config.fail_on_status,
        })
    }

    /// POST `message` to `url`.
    ///
    /// A response of any status counts as delivered unless the client was
    /// configured with `fail_on_status`.
    pub async fn deliver(
        &self,
        url: &str,
        session: &str,
        message: &InboundMessage,
    ) -> Result<StatusCode, RelayDeliveryError> {
        let payload = WebhookPayload {
            version: WEBHOOK_CONTRACT_VERSION,
            session,
            message,
        };
        let resp = self
            .http
            .post(url)
            .header(VERSION_HEADER, WEBHOOK_CONTRACT_VERSION.to_string())
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        // Drain so the connection can go back to the pool.
        if let Err(e) = resp.bytes().await {
            debug!(session, message_id = %message.id, error = %e, "failed to read webhook response body");
        }

        if status.is_success() {
            debug!(session, message_id = %message.id, %status, "webhook accepted message");
        } else if self.fail_on_status {
            return Err(RelayDeliveryError::Status(status));
        } else {
            warn!(session, message_id = %message.id, %status, "webhook answered non-2xx");
        }
        Ok(status)
    }
}
