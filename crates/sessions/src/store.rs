use std::sync::{Arc, OnceLock};

use {
    dashmap::DashMap,
    tokio::sync::{Mutex, MutexGuard, watch},
    tracing::{debug, info},
    wapi_channels::Connection,
};

use crate::{
    name::{InvalidSessionName, validate_session_name},
    state::SessionState,
};

pub type SessionHandle = Arc<Session>;

type ConnectionSlot = Option<Arc<dyn Connection>>;

// ── Session ──────────────────────────────────────────────────────────────────

/// One named account on the messaging network.
///
/// Readers may look at the state and current connection at any time.
/// Anything that swaps the connection or moves the state machine must hold
/// the session's [`SessionGuard`], so there is at most one in-flight
/// connect/login/reconnect per name.
pub struct Session {
    name: String,
    webhook_url: String,
    state: watch::Sender<SessionState>,
    connection: watch::Sender<ConnectionSlot>,
    lock: Mutex<()>,
    /// Epoch seconds of the first relay activity; messages at or before it
    /// are history replay. Set once per process lifetime.
    first_activity: OnceLock<u64>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("has_connection", &self.connection().is_some())
            .finish()
    }
}

impl Session {
    fn new(name: &str, webhook_url: String) -> Self {
        Self {
            name: name.to_string(),
            webhook_url,
            state: watch::channel(SessionState::Unauthenticated).0,
            connection: watch::channel(None).0,
            lock: Mutex::new(()),
            first_activity: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where inbound messages for this session are relayed.
    pub fn webhook_url(&self) -> &str {
        &self.webhook_url
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Current connection handle, if one was ever established.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.borrow().clone()
    }

    /// Notified whenever the connection handle is replaced.
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionSlot> {
        self.connection.subscribe()
    }

    /// Connected and authenticated: ready to send.
    pub fn is_ready(&self) -> bool {
        self.state().is_authenticated() && self.connection().is_some_and(|c| c.is_connected())
    }

    pub fn first_activity(&self) -> Option<u64> {
        self.first_activity.get().copied()
    }

    /// Record the first-activity timestamp unless already set; returns the
    /// effective value.
    pub fn mark_first_activity(&self, at: u64) -> u64 {
        *self.first_activity.get_or_init(|| {
            debug!(session = %self.name, at, "first activity recorded");
            at
        })
    }

    /// Exclusive access for connection replacement and state transitions.
    pub async fn lock(&self) -> SessionGuard<'_> {
        SessionGuard {
            session: self,
            _guard: self.lock.lock().await,
        }
    }

    /// Like [`Session::lock`] but gives up if someone else holds the session.
    pub fn try_lock(&self) -> Option<SessionGuard<'_>> {
        self.lock.try_lock().ok().map(|guard| SessionGuard {
            session: self,
            _guard: guard,
        })
    }
}

/// Proof that the caller holds a session's lock.
pub struct SessionGuard<'a> {
    session: &'a Session,
    _guard: MutexGuard<'a, ()>,
}

impl SessionGuard<'_> {
    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.session.connection()
    }

    /// Swap in a fresh connection. A new connection is unauthenticated, so
    /// the state machine resets. Returns the previous handle.
    pub fn replace_connection(&mut self, conn: Arc<dyn Connection>) -> ConnectionSlot {
        let old = self.session.connection.send_replace(Some(conn));
        self.set_state(SessionState::Unauthenticated);
        debug!(session = %self.session.name, replaced = old.is_some(), "connection replaced");
        old
    }

    pub fn set_state(&mut self, next: SessionState) {
        let prev = self.session.state.send_replace(next);
        if prev != next {
            info!(session = %self.session.name, from = %prev, to = %next, "session state changed");
        }
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

/// In-memory registry of sessions keyed by exact name.
///
/// Sharded map: lookups for different names never contend on a global lock.
/// Entries are never removed while the process runs.
pub struct SessionStore {
    sessions: DashMap<String, SessionHandle>,
    webhook_base: String,
}

impl SessionStore {
    /// `webhook_base` gets the session name appended to form each session's
    /// webhook URL.
    pub fn new(webhook_base: impl Into<String>) -> Self {
        Self {
            sessions: DashMap::new(),
            webhook_base: webhook_base.into(),
        }
    }

    /// Look up `name`, creating an unauthenticated entry on first use.
    pub fn get_or_create(&self, name: &str) -> Result<SessionHandle, InvalidSessionName> {
        if let Some(existing) = self.sessions.get(name) {
            return Ok(Arc::clone(existing.value()));
        }
        validate_session_name(name)?;
        let entry = self.sessions.entry(name.to_string()).or_insert_with(|| {
            debug!(session = name, "session created");
            Arc::new(Session::new(name, format!("{}{name}", self.webhook_base)))
        });
        Ok(Arc::clone(entry.value()))
    }

    pub fn get(&self, name: &str) -> Option<SessionHandle> {
        self.sessions.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn is_connected(&self, session: &Session) -> bool {
        session.connection().is_some_and(|c| c.is_connected())
    }

    /// Swap the connection for `session`, waiting for any in-flight
    /// reconnect on the same session to finish first.
    pub async fn replace_connection(
        &self,
        session: &Session,
        conn: Arc<dyn Connection>,
    ) -> ConnectionSlot {
        session.lock().await.replace_connection(conn)
    }

    /// Snapshot of all sessions, sorted by name.
    pub fn list(&self) -> Vec<SessionHandle> {
        let mut all: Vec<_> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use {
        async_trait::async_trait,
        tokio::sync::mpsc,
        wapi_channels::{ConnectionError, EventStream},
        wapi_common::{CredentialRecord, SentMessage},
    };

    use super::*;

    struct StubConnection {
        connected: AtomicBool,
    }

    impl StubConnection {
        fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(connected),
            })
        }
    }

    #[async_trait]
    impl Connection for StubConnection {
        async fn connect(&self) -> Result<(), ConnectionError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn login_with_qr(
            &self,
            _codes: mpsc::Sender<String>,
        ) -> Result<CredentialRecord, ConnectionError> {
            Err(ConnectionError::QrTimeout)
        }

        async fn restore_with_session(
            &self,
            record: &CredentialRecord,
        ) -> Result<CredentialRecord, ConnectionError> {
            Ok(record.clone())
        }

        async fn send_text(
            &self,
            _chat_id: &str,
            _text: &str,
        ) -> Result<SentMessage, ConnectionError> {
            Err(ConnectionError::NotLoggedIn)
        }

        async fn disconnect(&self) -> Result<CredentialRecord, ConnectionError> {
            Err(ConnectionError::NotConnected)
        }

        fn take_events(&self) -> Option<EventStream> {
            None
        }
    }

    #[test]
    fn get_or_create_returns_same_handle() {
        let store = SessionStore::new("https://hooks.local/in/");
        let a = store.get_or_create("alice").unwrap();
        let again = store.get_or_create("alice").unwrap();
        let b = store.get_or_create("bob").unwrap();

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 2);
        assert_eq!(a.webhook_url(), "https://hooks.local/in/alice");
        assert_eq!(a.state(), SessionState::Unauthenticated);
        assert!(a.connection().is_none());
    }

    #[test]
    fn lookups_are_exact_match() {
        let store = SessionStore::new("http://h/");
        store.get_or_create("Alice").unwrap();
        assert!(store.get("alice").is_none());
        assert!(store.get("Alice").is_some());
    }

    #[test]
    fn invalid_names_are_not_registered() {
        let store = SessionStore::new("http://h/");
        assert!(store.get_or_create("../etc").is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn replacing_connection_resets_state() {
        let store = SessionStore::new("http://h/");
        let session = store.get_or_create("alice").unwrap();

        {
            let mut guard = session.lock().await;
            guard.replace_connection(StubConnection::new(true));
            guard.set_state(SessionState::Authenticated);
        }
        assert!(session.is_ready());
        assert!(store.is_connected(&session));

        let old = store
            .replace_connection(&session, StubConnection::new(false))
            .await;
        assert!(old.is_some());
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(!store.is_connected(&session));
    }

    #[tokio::test]
    async fn per_session_lock_does_not_block_other_sessions() {
        let store = SessionStore::new("http://h/");
        let alice = store.get_or_create("alice").unwrap();
        let bob = store.get_or_create("bob").unwrap();

        let _held = alice.lock().await;
        assert!(alice.try_lock().is_none());
        assert!(bob.try_lock().is_some());
        assert!(store.get("bob").is_some());
    }

    #[tokio::test]
    async fn connection_watchers_see_replacement() {
        let store = SessionStore::new("http://h/");
        let session = store.get_or_create("alice").unwrap();
        let mut rx = session.subscribe_connection();

        store
            .replace_connection(&session, StubConnection::new(true))
            .await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_some());
    }

    #[test]
    fn first_activity_is_never_reset() {
        let store = SessionStore::new("http://h/");
        let session = store.get_or_create("alice").unwrap();
        assert!(session.first_activity().is_none());
        assert_eq!(session.mark_first_activity(100), 100);
        assert_eq!(session.mark_first_activity(200), 100);
        assert_eq!(session.first_activity(), Some(100));
    }
}
