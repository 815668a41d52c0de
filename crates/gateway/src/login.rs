//! Login orchestration: connect, restore from stored credentials, fall back
//! to QR login.

use std::{sync::Arc, time::Duration};

use {
    tokio::{
        sync::mpsc,
        task::JoinHandle,
        time::{Instant, timeout, timeout_at},
    },
    tracing::{debug, error, info, warn},
    wapi_channels::{Connection, ConnectionError, Connector},
    wapi_common::CredentialRecord,
    wapi_sessions::{CredentialError, CredentialStore, SessionGuard, SessionHandle, SessionState},
};

#[cfg(feature = "metrics")]
use wapi_metrics::{counter, names::LOGINS_TOTAL};

use crate::{qr::QrRenderer, supervisor::Supervisor};

/// How long to wait for queued QR renders after login finishes.
const RENDER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("login timed out")]
    Timeout,
    #[error("login rejected: {0}")]
    Rejected(String),
    #[error("connection unavailable: {0}")]
    Connection(ConnectionError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl From<ConnectionError> for LoginError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Rejected(reason) => Self::Rejected(reason),
            ConnectionError::QrTimeout => Self::Timeout,
            other => Self::Connection(other),
        }
    }
}

/// Outcome of [`LoginOrchestrator::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStart {
    AlreadyAuthenticated,
    InProgress,
    Started,
}

/// Brings sessions to `Authenticated`.
///
/// Every step runs under the session lock, so concurrent callers for the
/// same name share one connection and one login.
pub struct LoginOrchestrator {
    connector: Arc<dyn Connector>,
    credentials: CredentialStore,
    qr: Arc<QrRenderer>,
    supervisor: Arc<Supervisor>,
    login_timeout: Duration,
    connect_timeout: Duration,
}

impl LoginOrchestrator {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: CredentialStore,
        qr: Arc<QrRenderer>,
        supervisor: Arc<Supervisor>,
        login_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            credentials,
            qr,
            supervisor,
            login_timeout,
            connect_timeout,
        }
    }

    /// Log `session` in on a background task and return immediately.
    pub fn start(self: &Arc<Self>, session: SessionHandle) -> LoginStart {
        if session.is_ready() {
            return LoginStart::AlreadyAuthenticated;
        }
        if session.state().is_logging_in() {
            return LoginStart::InProgress;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Some(mut guard) = session.try_lock() else {
                debug!(session = session.name(), "login already in progress");
                return;
            };
            if let Err(e) = this.authenticate(&session, &mut guard).await {
                warn!(session = session.name(), error = %e, "login failed");
            }
        });
        LoginStart::Started
    }

    /// Return a connected, authenticated connection for `session`, logging
    /// in first when needed. Blocks for at most the login timeout.
    pub async fn ensure_authenticated(
        &self,
        session: &SessionHandle,
    ) -> Result<Arc<dyn Connection>, LoginError> {
        if session.is_ready()
            && let Some(conn) = session.connection()
        {
            return Ok(conn);
        }

        // One deadline covers waiting for a login already in flight and
        // running our own.
        let deadline = Instant::now() + self.login_timeout;
        let mut guard = timeout_at(deadline, session.lock())
            .await
            .map_err(|_| LoginError::Timeout)?;
        let outcome = timeout_at(deadline, self.authenticate(session, &mut guard)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                guard.set_state(SessionState::Unauthenticated);
                self.qr.remove(session.name());
                warn!(session = session.name(), "login cut short by the login timeout");
                Err(LoginError::Timeout)
            },
        }
    }

    async fn authenticate(
        &self,
        session: &SessionHandle,
        guard: &mut SessionGuard<'_>,
    ) -> Result<Arc<dyn Connection>, LoginError> {
        let name = session.name();
        let mut conn = self.connected(name, guard).await?;

        if !session.state().is_authenticated() {
            let restored = match self.credentials.load(name) {
                Ok(record) => match self.restore(name, guard, &conn, &record).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(session = name, error = %e, "restore failed, falling back to QR login");
                        conn = self.open_connection(name, guard).await?;
                        false
                    },
                },
                Err(CredentialError::NotFound(_)) => {
                    debug!(session = name, "no stored credentials");
                    false
                },
                Err(e) => {
                    warn!(session = name, error = %e, "stored credentials unusable, falling back to QR login");
                    false
                },
            };
            if !restored {
                self.qr_login(name, guard, &conn).await?;
            }
        }

        self.supervisor.watch(Arc::clone(session));
        Ok(conn)
    }

    /// Reuse the current connection if it is up and logged in, otherwise
    /// open a new one. A connection left over from a failed login may still
    /// have that login pending on the network side.
    async fn connected(
        &self,
        name: &str,
        guard: &mut SessionGuard<'_>,
    ) -> Result<Arc<dyn Connection>, LoginError> {
        if let Some(conn) = guard.connection()
            && conn.is_connected()
            && guard.session().state().is_authenticated()
        {
            return Ok(conn);
        }
        self.open_connection(name, guard).await
    }

    async fn open_connection(
        &self,
        name: &str,
        guard: &mut SessionGuard<'_>,
    ) -> Result<Arc<dyn Connection>, LoginError> {
        let conn = self.connector.open(name).await?;
        match timeout(self.connect_timeout, conn.connect()).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(LoginError::Connection(ConnectionError::Transport(format!(
                    "connect timed out after {}s",
                    self.connect_timeout.as_secs()
                ))));
            },
        }
        guard.replace_connection(Arc::clone(&conn));
        info!(session = name, "connected");
        Ok(conn)
    }

    async fn restore(
        &self,
        name: &str,
        guard: &mut SessionGuard<'_>,
        conn: &Arc<dyn Connection>,
        record: &CredentialRecord,
    ) -> Result<(), LoginError> {
        guard.set_state(SessionState::Restoring);
        let result = match timeout(self.login_timeout, conn.restore_with_session(record)).await {
            Ok(r) => r.map_err(LoginError::from),
            Err(_) => Err(LoginError::Timeout),
        };

        #[cfg(feature = "metrics")]
        counter!(LOGINS_TOTAL, "method" => "restore", "result" => result_label(&result)).increment(1);

        match result {
            Ok(refreshed) => {
                self.persist(name, &refreshed);
                guard.set_state(SessionState::Authenticated);
                info!(session = name, "session restored");
                Ok(())
            },
            Err(e) => {
                guard.set_state(SessionState::Unauthenticated);
                Err(e)
            },
        }
    }

    async fn qr_login(
        &self,
        name: &str,
        guard: &mut SessionGuard<'_>,
        conn: &Arc<dyn Connection>,
    ) -> Result<(), LoginError> {
        guard.set_state(SessionState::AwaitingQrScan);

        let (codes_tx, codes_rx) = mpsc::channel(4);
        let mut renderer = self.spawn_renderer(name, codes_rx);

        let result = match timeout(self.login_timeout, conn.login_with_qr(codes_tx)).await {
            Ok(r) => r.map_err(LoginError::from),
            Err(_) => Err(LoginError::Timeout),
        };

        if timeout(RENDER_DRAIN, &mut renderer).await.is_err() {
            renderer.abort();
        }
        self.qr.remove(name);

        #[cfg(feature = "metrics")]
        counter!(LOGINS_TOTAL, "method" => "qr", "result" => result_label(&result)).increment(1);

        match result {
            Ok(record) => {
                self.persist(name, &record);
                guard.set_state(SessionState::Authenticated);
                info!(session = name, "QR login complete");
                Ok(())
            },
            Err(e) => {
                guard.set_state(SessionState::Unauthenticated);
                warn!(session = name, error = %e, "QR login failed");
                Err(e)
            },
        }
    }

    /// Render each code the network issues; announce the page once.
    fn spawn_renderer(&self, name: &str, mut codes: mpsc::Receiver<String>) -> JoinHandle<()> {
        let qr = Arc::clone(&self.qr);
        let session = name.to_string();
        tokio::spawn(async move {
            let mut announced = false;
            while let Some(code) = codes.recv().await {
                let (renderer, target) = (Arc::clone(&qr), session.clone());
                match tokio::task::spawn_blocking(move || renderer.render(&target, &code)).await {
                    Ok(Ok(_)) if !announced => {
                        announced = true;
                        let url = qr
                            .page_url(&session)
                            .unwrap_or_else(|| QrRenderer::url_path(&session));
                        info!(session = %session, %url, "scan the QR code to link this session");
                    },
                    Ok(Ok(_)) => debug!(session = %session, "QR code rotated"),
                    Ok(Err(e)) => warn!(session = %session, error = %e, "failed to render QR code"),
                    Err(e) => warn!(session = %session, error = %e, "QR render task failed"),
                }
            }
        })
    }

    fn persist(&self, name: &str, record: &CredentialRecord) {
        if let Err(e) = self.credentials.save(name, record) {
            error!(session = name, error = %e, "failed to persist credentials");
        }
    }
}

#[cfg(feature = "metrics")]
pub(crate) fn result_label<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() { "ok" } else { "error" }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::{Harness, QrScan};

    #[tokio::test]
    async fn qr_login_persists_credentials() {
        let h = Harness::new("http://127.0.0.1:1/");
        let session = h.state.sessions.get_or_create("alice").unwrap();

        h.state.login.ensure_authenticated(&session).await.unwrap();

        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(session.is_ready());
        let stored = h.credentials().load("alice").unwrap();
        assert_eq!(stored.as_bytes(), b"qr:alice:1");
        // Image is removed once the scan completed.
        assert!(!h.state.qr.file_path("alice").exists());
    }

    #[tokio::test]
    async fn stored_credentials_restore_without_qr() {
        let h = Harness::new("http://127.0.0.1:1/");
        h.credentials()
            .save("alice", &CredentialRecord::new(b"stored".to_vec()))
            .unwrap();
        let session = h.state.sessions.get_or_create("alice").unwrap();

        h.state.login.ensure_authenticated(&session).await.unwrap();

        let conn = h.connector.last();
        assert_eq!(conn.restored_with(), vec![CredentialRecord::new(b"stored".to_vec())]);
        assert_eq!(conn.qr_logins.load(Ordering::SeqCst), 0);
        assert_eq!(h.credentials().load("alice").unwrap().as_bytes(), b"stored+");
    }

    #[tokio::test]
    async fn failed_restore_falls_back_to_qr() {
        let h = Harness::new("http://127.0.0.1:1/");
        h.connector.update(|b| b.restore_ok = false);
        h.credentials()
            .save("alice", &CredentialRecord::new(b"revoked".to_vec()))
            .unwrap();
        let session = h.state.sessions.get_or_create("alice").unwrap();

        h.state.login.ensure_authenticated(&session).await.unwrap();

        // Restore ran on the first connection, QR on a fresh one.
        assert_eq!(h.connector.opened(), 2);
        assert_eq!(h.connector.last().qr_logins.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(h.credentials().load("alice").unwrap().as_bytes(), b"qr:alice:2");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_connection() {
        let h = Harness::new("http://127.0.0.1:1/");
        h.credentials()
            .save("alice", &CredentialRecord::new(b"stored".to_vec()))
            .unwrap();
        let session = h.state.sessions.get_or_create("alice").unwrap();

        let calls = (0..8).map(|_| {
            let login = Arc::clone(&h.state.login);
            let session = Arc::clone(&session);
            tokio::spawn(async move { login.ensure_authenticated(&session).await.map(|_| ()) })
        });
        for call in futures::future::join_all(calls).await {
            call.unwrap().unwrap();
        }

        assert_eq!(h.connector.opened(), 1);
        assert_eq!(h.connector.last().restored_with().len(), 1);
    }

    #[tokio::test]
    async fn qr_image_is_served_while_waiting_for_scan() {
        let h = Harness::new("http://127.0.0.1:1/");
        h.connector.update(|b| b.qr_scan = QrScan::Never);
        let session = h.state.sessions.get_or_create("alice").unwrap();

        assert_eq!(h.state.login.start(Arc::clone(&session)), LoginStart::Started);

        let path = h.state.qr.file_path("alice");
        let appeared = timeout(Duration::from_secs(5), async {
            while !path.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(appeared.is_ok(), "QR image never rendered");
        assert_eq!(session.state(), SessionState::AwaitingQrScan);
        assert_eq!(h.state.login.start(Arc::clone(&session)), LoginStart::InProgress);
    }

    #[tokio::test]
    async fn unscanned_code_times_out() {
        let h = Harness::with_settings("http://127.0.0.1:1/", |s| {
            s.login_timeout = Duration::from_millis(200);
        });
        h.connector.update(|b| b.qr_scan = QrScan::Never);
        let session = h.state.sessions.get_or_create("alice").unwrap();

        let err = h.state.login.ensure_authenticated(&session).await.map(|_| ()).unwrap_err();

        assert!(matches!(err, LoginError::Timeout));
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(h.credentials().load("alice").is_err());
        assert!(!h.state.qr.file_path("alice").exists());
    }

    #[tokio::test]
    async fn rejected_scan_is_reported() {
        let h = Harness::new("http://127.0.0.1:1/");
        h.connector.update(|b| b.qr_scan = QrScan::Rejected);
        let session = h.state.sessions.get_or_create("alice").unwrap();

        let err = h.state.login.ensure_authenticated(&session).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, LoginError::Rejected(_)));
        assert_eq!(session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn connect_failure_is_connection_error() {
        let h = Harness::new("http://127.0.0.1:1/");
        h.connector.update(|b| b.connect_ok = false);
        let session = h.state.sessions.get_or_create("alice").unwrap();

        let err = h.state.login.ensure_authenticated(&session).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, LoginError::Connection(ConnectionError::Transport(_))));
        assert!(session.connection().is_none());
    }

    #[tokio::test]
    async fn authenticated_session_is_not_logged_in_again() {
        let h = Harness::new("http://127.0.0.1:1/");
        let session = h.state.sessions.get_or_create("alice").unwrap();
        h.state.login.ensure_authenticated(&session).await.unwrap();

        assert_eq!(
            h.state.login.start(Arc::clone(&session)),
            LoginStart::AlreadyAuthenticated
        );
        h.state.login.ensure_authenticated(&session).await.unwrap();
        assert_eq!(h.connector.opened(), 1);
    }
}
