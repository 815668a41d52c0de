//! Per-session connection supervision.
//!
//! One task per authenticated session consumes the connection's events,
//! hands messages to the inbound relay in delivery order, and replaces a
//! failed connection after a cooldown by restoring from the last persisted
//! credentials.

use std::{sync::Arc, time::Duration};

use {
    dashmap::DashMap,
    tokio::{sync::watch, task::JoinHandle, time::timeout},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
    wapi_channels::{Connection, ConnectionError, ConnectionEvent, Connector, EventStream},
    wapi_common::now_secs,
    wapi_sessions::{CredentialStore, Session, SessionGuard, SessionHandle, SessionState},
};

#[cfg(feature = "metrics")]
use wapi_metrics::{counter, names::RECONNECTS_TOTAL};

use crate::{login::LoginError, relay::InboundRelay};

type ConnectionWatch = watch::Receiver<Option<Arc<dyn Connection>>>;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub reconnect_cooldown: Duration,
    pub connect_timeout: Duration,
    pub restore_timeout: Duration,
}

/// Sessions whose task ended within the shutdown grace period, and those
/// that had to be abandoned.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub completed: Vec<String>,
    pub abandoned: Vec<String>,
}

/// Why the event pump returned.
enum PumpExit {
    Shutdown,
    Replaced,
    Closed,
    Failed(String),
}

pub struct Supervisor {
    connector: Arc<dyn Connector>,
    credentials: CredentialStore,
    relay: Arc<InboundRelay>,
    settings: SupervisorSettings,
    cancel: CancellationToken,
    tasks: DashMap<String, JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: CredentialStore,
        relay: Arc<InboundRelay>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            connector,
            credentials,
            relay,
            settings,
            cancel: CancellationToken::new(),
            tasks: DashMap::new(),
        }
    }

    /// Start supervising `session` unless a task for it is already running.
    /// Returns whether a new task was spawned.
    pub fn watch(self: &Arc<Self>, session: SessionHandle) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let name = session.name().to_string();
        session.mark_first_activity(now_secs());
        if let Some(task) = self.tasks.get(&name)
            && !task.is_finished()
        {
            return false;
        }

        let this = Arc::clone(self);
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move { this.run(session, cancel).await });
        debug!(session = %name, "supervision started");
        self.tasks.insert(name, handle);
        true
    }

    pub fn is_watching(&self, session: &str) -> bool {
        self.tasks.get(session).is_some_and(|t| !t.is_finished())
    }

    async fn run(&self, session: SessionHandle, cancel: CancellationToken) {
        let name = session.name().to_string();
        let since = session.mark_first_activity(now_secs());
        info!(session = %name, since, "listening for messages");

        let mut conn_rx = session.subscribe_connection();
        loop {
            let current = conn_rx.borrow_and_update().clone();
            let Some(conn) = current else {
                if !wait_for_replacement(&mut conn_rx, &cancel).await {
                    return;
                }
                continue;
            };
            let Some(mut events) = conn.take_events() else {
                debug!(session = %name, "event stream already taken, waiting for a new connection");
                if !wait_for_replacement(&mut conn_rx, &cancel).await {
                    self.flush(&session).await;
                    return;
                }
                continue;
            };

            match self.pump(&session, &conn, &mut events, &mut conn_rx, &cancel).await {
                PumpExit::Shutdown => {
                    self.flush(&session).await;
                    return;
                },
                PumpExit::Replaced => continue,
                PumpExit::Closed => {
                    info!(session = %name, "connection closed");
                    let mut guard = session.lock().await;
                    if guard.connection().is_some_and(|c| same_connection(&c, &conn)) {
                        guard.set_state(SessionState::Unauthenticated);
                    }
                    return;
                },
                PumpExit::Failed(reason) => {
                    warn!(
                        session = %name,
                        %reason,
                        cooldown_secs = self.settings.reconnect_cooldown.as_secs(),
                        "connection failed, reconnecting after cooldown"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        changed = conn_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            continue;
                        },
                        _ = tokio::time::sleep(self.settings.reconnect_cooldown) => {},
                    }

                    let result = self.recover(&session, &conn).await;

                    #[cfg(feature = "metrics")]
                    counter!(RECONNECTS_TOTAL, "result" => crate::login::result_label(&result))
                        .increment(1);

                    if let Err(e) = result {
                        error!(session = %name, error = %e, "reconnect failed, session needs a new login");
                        return;
                    }
                },
            }
        }
    }

    /// Relay events until the connection fails, closes, or is replaced.
    async fn pump(
        &self,
        session: &Session,
        conn: &Arc<dyn Connection>,
        events: &mut EventStream,
        conn_rx: &mut ConnectionWatch,
        cancel: &CancellationToken,
    ) -> PumpExit {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PumpExit::Shutdown,
                changed = conn_rx.changed() => {
                    if changed.is_err() {
                        return PumpExit::Shutdown;
                    }
                    let replaced = conn_rx
                        .borrow()
                        .as_ref()
                        .is_none_or(|c| !same_connection(c, conn));
                    if replaced {
                        return PumpExit::Replaced;
                    }
                },
                event = events.recv() => match event {
                    Some(ConnectionEvent::Message(message)) => {
                        self.relay.relay(session, message).await;
                    },
                    Some(ConnectionEvent::Failed(reason)) => return PumpExit::Failed(reason),
                    Some(ConnectionEvent::Closed) => return PumpExit::Closed,
                    None => return PumpExit::Failed("event stream ended".into()),
                },
            }
        }
    }

    /// Replace `failed` with a fresh connection restored from the last
    /// persisted credentials.
    async fn recover(
        &self,
        session: &SessionHandle,
        failed: &Arc<dyn Connection>,
    ) -> Result<(), LoginError> {
        let name = session.name();
        let mut guard = session.lock().await;
        if let Some(current) = guard.connection()
            && !same_connection(&current, failed)
            && session.is_ready()
        {
            debug!(session = name, "connection already replaced");
            return Ok(());
        }

        let result = self.restore_fresh(name, &mut guard).await;
        if result.is_err() {
            guard.set_state(SessionState::Unauthenticated);
        }
        result
    }

    async fn restore_fresh(&self, name: &str, guard: &mut SessionGuard<'_>) -> Result<(), LoginError> {
        let record = self.credentials.load(name)?;

        let conn = self.connector.open(name).await?;
        match timeout(self.settings.connect_timeout, conn.connect()).await {
            Ok(r) => r?,
            Err(_) => return Err(LoginError::Timeout),
        }
        guard.replace_connection(Arc::clone(&conn));
        guard.set_state(SessionState::Restoring);

        let refreshed = match timeout(self.settings.restore_timeout, conn.restore_with_session(&record)).await {
            Ok(r) => r?,
            Err(_) => return Err(LoginError::Timeout),
        };
        if let Err(e) = self.credentials.save(name, &refreshed) {
            error!(session = name, error = %e, "failed to persist credentials");
        }
        guard.set_state(SessionState::Authenticated);
        info!(session = name, "reconnected");
        Ok(())
    }

    /// Disconnect cleanly and persist the final credential state.
    async fn flush(&self, session: &Session) {
        let name = session.name();
        let guard = session.lock().await;
        let Some(conn) = guard.connection() else {
            return;
        };
        if !session.state().is_authenticated() {
            return;
        }
        match conn.disconnect().await {
            Ok(record) => match self.credentials.save(name, &record) {
                Ok(()) => info!(session = name, "session flushed"),
                Err(e) => error!(session = name, error = %e, "failed to persist credentials on shutdown"),
            },
            Err(ConnectionError::NotConnected) => debug!(session = name, "already disconnected"),
            Err(e) => warn!(session = name, error = %e, "disconnect failed"),
        }
    }

    /// Stop every task, giving sessions until `grace` elapses to flush.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.cancel.cancel();

        let names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        let deadline = tokio::time::Instant::now() + grace;
        let mut report = ShutdownReport::default();

        for name in names {
            let Some((_, mut handle)) = self.tasks.remove(&name) else {
                continue;
            };
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => report.completed.push(name),
                Err(_) => {
                    handle.abort();
                    report.abandoned.push(name);
                },
            }
        }

        if report.abandoned.is_empty() {
            info!(sessions = report.completed.len(), "all sessions flushed");
        } else {
            warn!(
                abandoned = ?report.abandoned,
                "shutdown grace period elapsed before these sessions flushed"
            );
        }
        report
    }
}

fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Wait until the connection handle changes. `false` on shutdown.
async fn wait_for_replacement(conn_rx: &mut ConnectionWatch, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        changed = conn_rx.changed() => changed.is_ok(),
    }
}
