use std::{sync::Arc, time::Duration};

use {
    tracing::{debug, error, info, warn},
    wapi_channels::ConnectionError,
    wapi_common::{InboundMessage, SentMessage, now_secs},
    wapi_sessions::{InvalidSessionName, Session, SessionStore},
};

#[cfg(feature = "metrics")]
use wapi_metrics::{
    counter, histogram,
    names::{RELAY_MESSAGES_TOTAL, SENDS_TOTAL, WEBHOOK_DURATION_SECONDS},
};

use crate::{
    dedup::DedupLedger,
    login::{LoginError, LoginOrchestrator},
    webhook::WebhookClient,
};

// ── Inbound ──────────────────────────────────────────────────────────────────

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    /// At or before the session's first activity: history replay.
    Stale,
    FromMe,
    Duplicate,
    /// The dedup ledger could not be consulted; the message was skipped.
    LedgerUnavailable,
    DeliveryFailed,
}

impl RelayOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Stale => "stale",
            Self::FromMe => "from_me",
            Self::Duplicate => "duplicate",
            Self::LedgerUnavailable => "ledger_unavailable",
            Self::DeliveryFailed => "delivery_failed",
        }
    }
}

/// Filters inbound messages and forwards the survivors to the session's
/// webhook, at most once per message ID.
pub struct InboundRelay {
    ledger: Arc<dyn DedupLedger>,
    webhook: WebhookClient,
}

impl InboundRelay {
    pub fn new(ledger: Arc<dyn DedupLedger>, webhook: WebhookClient) -> Self {
        Self { ledger, webhook }
    }

    pub async fn relay(&self, session: &Session, message: InboundMessage) -> RelayOutcome {
        let outcome = self.process(session, &message).await;
        debug!(
            session = session.name(),
            message_id = %message.id,
            outcome = outcome.as_str(),
            "inbound message handled"
        );

        #[cfg(feature = "metrics")]
        counter!(RELAY_MESSAGES_TOTAL, "outcome" => outcome.as_str()).increment(1);

        outcome
    }

    async fn process(&self, session: &Session, message: &InboundMessage) -> RelayOutcome {
        let since = session.mark_first_activity(now_secs());
        if message.timestamp <= since {
            return RelayOutcome::Stale;
        }
        if message.from_me {
            return RelayOutcome::FromMe;
        }

        match self.ledger.already_relayed(&message.id).await {
            Ok(true) => return RelayOutcome::Duplicate,
            Ok(false) => {},
            Err(e) => {
                error!(session = session.name(), message_id = %message.id, error = %e, "skipping message");
                return RelayOutcome::LedgerUnavailable;
            },
        }

        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let delivered = self
            .webhook
            .deliver(session.webhook_url(), session.name(), message)
            .await;

        #[cfg(feature = "metrics")]
        histogram!(WEBHOOK_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        if let Err(e) = delivered {
            warn!(session = session.name(), message_id = %message.id, error = %e, "webhook delivery failed");
            return RelayOutcome::DeliveryFailed;
        }

        if let Err(e) = self.ledger.mark_relayed(&message.id).await {
            error!(
                session = session.name(),
                message_id = %message.id,
                error = %e,
                "delivered but not recorded, a redelivery may be relayed again"
            );
        }
        RelayOutcome::Delivered
    }
}

// ── Outbound ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    InvalidSession(#[from] InvalidSessionName),
    #[error(transparent)]
    Login(#[from] LoginError),
    #[error("send failed: {0}")]
    Connection(#[from] ConnectionError),
}

/// Sends text on behalf of a session, logging it in first when needed.
pub struct MessageRelay {
    sessions: Arc<SessionStore>,
    login: Arc<LoginOrchestrator>,
    settle_delay: Duration,
}

impl MessageRelay {
    pub fn new(
        sessions: Arc<SessionStore>,
        login: Arc<LoginOrchestrator>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            sessions,
            login,
            settle_delay,
        }
    }

    pub async fn send(
        &self,
        session_name: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<SentMessage, SendError> {
        let result = self.try_send(session_name, chat_id, text).await;

        #[cfg(feature = "metrics")]
        counter!(SENDS_TOTAL, "result" => crate::login::result_label(&result)).increment(1);

        result
    }

    async fn try_send(
        &self,
        session_name: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<SentMessage, SendError> {
        let session = self.sessions.get_or_create(session_name)?;
        let conn = self.login.ensure_authenticated(&session).await?;

        // The network drops sends issued right after connecting.
        tokio::time::sleep(self.settle_delay).await;

        let sent = conn.send_text(chat_id, text).await?;
        info!(session = session_name, chat_id, message_id = %sent.id, "message sent");
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use wapi_sessions::SessionState;

    use super::*;
    use crate::testing::{Harness, QrScan};

    fn message(id: &str, timestamp: u64) -> InboundMessage {
        InboundMessage {
            id: id.into(),
            remote_jid: "15551234567@s.whatsapp.net".into(),
            sender_jid: None,
            from_me: false,
            timestamp,
            text: "hi".into(),
            quoted_message_id: None,
        }
    }

    #[tokio::test]
    async fn duplicate_ids_are_posted_once() {
        let mut server = mockito::Server::new_async().await;
        let hook = server
            .mock("POST", "/in/alice")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let h = Harness::new(&format!("{}/in/", server.url()));
        let session = h.state.sessions.get_or_create("alice").unwrap();
        let relay = h.inbound();
        session.mark_first_activity(100);

        assert_eq!(relay.relay(&session, message("m1", 101)).await, RelayOutcome::Delivered);
        assert_eq!(relay.relay(&session, message("m1", 101)).await, RelayOutcome::Duplicate);
        hook.assert_async().await;
    }

    #[tokio::test]
    async fn history_and_own_messages_are_dropped() {
        let h = Harness::new("http://127.0.0.1:1/");
        let session = h.state.sessions.get_or_create("alice").unwrap();
        let relay = h.inbound();
        session.mark_first_activity(100);

        assert_eq!(relay.relay(&session, message("old", 99)).await, RelayOutcome::Stale);
        assert_eq!(relay.relay(&session, message("edge", 100)).await, RelayOutcome::Stale);
        let mut own = message("own", 150);
        own.from_me = true;
        assert_eq!(relay.relay(&session, own).await, RelayOutcome::FromMe);
        assert_eq!(h.ledger.len(), 0);
    }

    #[tokio::test]
    async fn ledger_outage_skips_message() {
        let mut server = mockito::Server::new_async().await;
        let hook = server
            .mock("POST", "/in/alice")
            .expect(0)
            .create_async()
            .await;
        let h = Harness::new(&format!("{}/in/", server.url()));
        let session = h.state.sessions.get_or_create("alice").unwrap();
        session.mark_first_activity(100);
        h.ledger.set_unavailable(true);

        let outcome = h.inbound().relay(&session, message("m1", 101)).await;

        assert_eq!(outcome, RelayOutcome::LedgerUnavailable);
        hook.assert_async().await;
    }

    #[tokio::test]
    async fn failed_delivery_is_not_recorded() {
        let h = Harness::new("http://127.0.0.1:1/");
        let session = h.state.sessions.get_or_create("alice").unwrap();
        session.mark_first_activity(100);

        let outcome = h.inbound().relay(&session, message("m1", 101)).await;

        assert_eq!(outcome, RelayOutcome::DeliveryFailed);
        assert_eq!(h.ledger.len(), 0);
    }

    #[tokio::test]
    async fn send_logs_in_and_sends_once() {
        let h = Harness::new("http://127.0.0.1:1/");

        let sent = h
            .state
            .messages
            .send("alice", "15551234567@s.whatsapp.net", "hello there")
            .await
            .unwrap();

        assert_eq!(sent.text, "hello there");
        assert_eq!(sent.chat_id, "15551234567@s.whatsapp.net");
        let conn = h.connector.last();
        assert_eq!(conn.sent(), vec![(
            "15551234567@s.whatsapp.net".to_string(),
            "hello there".to_string()
        )]);
        assert_eq!(conn.qr_logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_to_authenticated_session_reuses_connection() {
        let h = Harness::new("http://127.0.0.1:1/");
        let session = h.state.sessions.get_or_create("alice").unwrap();
        h.state.login.ensure_authenticated(&session).await.unwrap();

        h.state.messages.send("alice", "chat", "one").await.unwrap();
        h.state.messages.send("alice", "chat", "two").await.unwrap();

        assert_eq!(h.connector.opened(), 1);
        assert_eq!(h.connector.last().sent().len(), 2);
    }

    #[tokio::test]
    async fn send_with_invalid_session_name_fails() {
        let h = Harness::new("http://127.0.0.1:1/");
        let err = h.state.messages.send("../x", "chat", "hi").await.unwrap_err();
        assert!(matches!(err, SendError::InvalidSession(_)));
        assert_eq!(h.connector.opened(), 0);
    }

    #[tokio::test]
    async fn send_applies_settle_delay() {
        let h = Harness::with_settings("http://127.0.0.1:1/", |s| {
            s.send_settle_delay = Duration::from_millis(150);
        });
        let started = std::time::Instant::now();
        h.state.messages.send("alice", "chat", "hi").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn send_during_pending_login_is_bounded_by_login_timeout() {
        let h = Harness::with_settings("http://127.0.0.1:1/", |s| {
            s.login_timeout = Duration::from_millis(300);
        });
        h.connector.update(|b| b.qr_scan = QrScan::Never);
        let session = h.state.sessions.get_or_create("alice").unwrap();
        h.state.login.start(Arc::clone(&session));
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.state() != SessionState::AwaitingQrScan {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let started = std::time::Instant::now();
        let err = h.state.messages.send("alice", "chat", "hi").await.unwrap_err();

        assert!(matches!(err, SendError::Login(LoginError::Timeout)));
        assert!(started.elapsed() < Duration::from_millis(450));
    }
}
