//! In-process fakes for orchestration, supervision and router tests.

use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tempfile::TempDir,
    tokio::sync::mpsc,
    wapi_channels::{Connection, ConnectionError, ConnectionEvent, Connector, EventStream},
    wapi_common::{CredentialRecord, InboundMessage, SentMessage, now_secs},
    wapi_config::WebhookConfig,
    wapi_sessions::CredentialStore,
};

use crate::{
    dedup::MemoryLedger,
    relay::InboundRelay,
    state::{GatewaySettings, GatewayState},
};

#[derive(Debug, Clone, Copy)]
pub(crate) enum QrScan {
    Scanned,
    Never,
    Rejected,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeBehavior {
    pub connect_ok: bool,
    pub restore_ok: bool,
    pub qr_codes: Vec<String>,
    pub qr_scan: QrScan,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            connect_ok: true,
            restore_ok: true,
            qr_codes: vec!["2@fake-qr-payload".into()],
            qr_scan: QrScan::Scanned,
        }
    }
}

pub(crate) struct FakeConnection {
    session: String,
    generation: usize,
    behavior: FakeBehavior,
    connected: AtomicBool,
    logged_in: AtomicBool,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<EventStream>>,
    sent: Mutex<Vec<(String, String)>>,
    restored_with: Mutex<Vec<CredentialRecord>>,
    pub qr_logins: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl FakeConnection {
    fn new(session: &str, generation: usize, behavior: FakeBehavior) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session: session.to_string(),
            generation,
            behavior,
            connected: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            sent: Mutex::new(Vec::new()),
            restored_with: Mutex::new(Vec::new()),
            qr_logins: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn deliver(&self, message: InboundMessage) {
        self.emit(ConnectionEvent::Message(message));
    }

    /// Simulate the transport dropping underneath us.
    pub fn break_transport(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(ConnectionEvent::Failed(reason.to_string()));
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn restored_with(&self) -> Vec<CredentialRecord> {
        self.restored_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn connect(&self) -> Result<(), ConnectionError> {
        // Widen the window for racing callers.
        tokio::time::sleep(Duration::from_millis(5)).await;
        if !self.behavior.connect_ok {
            return Err(ConnectionError::Transport("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn login_with_qr(
        &self,
        codes: mpsc::Sender<String>,
    ) -> Result<CredentialRecord, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.qr_logins.fetch_add(1, Ordering::SeqCst);
        for code in &self.behavior.qr_codes {
            let _ = codes.send(code.clone()).await;
        }
        match self.behavior.qr_scan {
            QrScan::Scanned => {
                self.logged_in.store(true, Ordering::SeqCst);
                Ok(CredentialRecord::new(format!(
                    "qr:{}:{}",
                    self.session, self.generation
                )))
            },
            QrScan::Never => std::future::pending().await,
            QrScan::Rejected => Err(ConnectionError::Rejected("scan refused".into())),
        }
    }

    async fn restore_with_session(
        &self,
        record: &CredentialRecord,
    ) -> Result<CredentialRecord, ConnectionError> {
        self.restored_with.lock().unwrap().push(record.clone());
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        if !self.behavior.restore_ok {
            return Err(ConnectionError::Rejected("credentials revoked".into()));
        }
        self.logged_in.store(true, Ordering::SeqCst);
        Ok(CredentialRecord::new([record.as_bytes(), b"+"].concat()))
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<SentMessage, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        if !self.logged_in.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotLoggedIn);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((chat_id.to_string(), text.to_string()));
        Ok(SentMessage {
            id: format!("sent-{}", sent.len()),
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            timestamp: now_secs(),
        })
    }

    async fn disconnect(&self) -> Result<CredentialRecord, ConnectionError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.emit(ConnectionEvent::Closed);
        Ok(CredentialRecord::new(format!("final:{}", self.session)))
    }

    fn take_events(&self) -> Option<EventStream> {
        self.events_rx.lock().unwrap().take()
    }
}

/// Hands out [`FakeConnection`]s and remembers every one it opened.
#[derive(Default)]
pub(crate) struct FakeConnector {
    behavior: Mutex<FakeBehavior>,
    opened: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeConnector {
    /// Change the behavior of connections opened from now on.
    pub fn update(&self, f: impl FnOnce(&mut FakeBehavior)) {
        f(&mut self.behavior.lock().unwrap());
    }

    pub fn opened(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakeConnection> {
        Arc::clone(self.opened.lock().unwrap().last().unwrap())
    }

    pub fn all(&self) -> Vec<Arc<FakeConnection>> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, session: &str) -> Result<Arc<dyn Connection>, ConnectionError> {
        let behavior = self.behavior.lock().unwrap().clone();
        let mut opened = self.opened.lock().unwrap();
        let conn = Arc::new(FakeConnection::new(session, opened.len() + 1, behavior));
        opened.push(Arc::clone(&conn));
        Ok(conn as Arc<dyn Connection>)
    }
}

/// A fully wired [`GatewayState`] over fakes, rooted in a temp directory.
pub(crate) struct Harness {
    _dir: TempDir,
    pub connector: Arc<FakeConnector>,
    pub ledger: Arc<MemoryLedger>,
    pub state: Arc<GatewayState>,
}

pub(crate) fn test_settings(root: &Path, webhook_base: &str) -> GatewaySettings {
    GatewaySettings {
        webhook_base: webhook_base.to_string(),
        webhook: WebhookConfig {
            base_url: webhook_base.to_string(),
            timeout_secs: 5,
            accept_invalid_certs: true,
            fail_on_status: false,
        },
        static_dir: root.join("static"),
        public_url: None,
        credentials_dir: root.join("sessions"),
        login_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
        reconnect_cooldown: Duration::from_millis(50),
        send_settle_delay: Duration::ZERO,
        shutdown_grace: Duration::from_secs(2),
    }
}

impl Harness {
    pub fn new(webhook_base: &str) -> Self {
        Self::with_settings(webhook_base, |_| {})
    }

    pub fn with_settings(webhook_base: &str, tweak: impl FnOnce(&mut GatewaySettings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path(), webhook_base);
        tweak(&mut settings);

        let connector = Arc::new(FakeConnector::default());
        let ledger = Arc::new(MemoryLedger::new(Duration::from_secs(3600)));
        let state = GatewayState::new(
            settings,
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::clone(&ledger) as _,
        )
        .unwrap();

        Self {
            _dir: dir,
            connector,
            ledger,
            state: Arc::new(state),
        }
    }

    pub fn credentials(&self) -> CredentialStore {
        CredentialStore::new(&self.state.settings.credentials_dir)
    }

    pub fn inbound(&self) -> Arc<InboundRelay> {
        Arc::clone(&self.state.inbound)
    }
}
