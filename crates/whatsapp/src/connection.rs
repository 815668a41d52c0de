use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    serde::de::DeserializeOwned,
    serde_json::Value,
    tokio::{
        net::TcpStream,
        sync::{Mutex, mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
    tracing::{debug, info, warn},
    wapi_channels::{Connection, ConnectionError, ConnectionEvent, Connector, EventStream},
    wapi_common::{CredentialRecord, SentMessage},
    wapi_config::WhatsAppConfig,
};

use crate::protocol::{CredentialsReply, Envelope, Request, SidecarFrame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = oneshot::Sender<Result<Value, ConnectionError>>;

struct Command {
    request: Request,
    reply: Reply,
}

// ── Connector ────────────────────────────────────────────────────────────────

/// Opens one bridge socket per session at `<sidecar_url>/sessions/<name>`.
pub struct SidecarConnector {
    base_url: String,
    request_timeout: Duration,
}

impl SidecarConnector {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout,
        }
    }

    pub fn from_config(config: &WhatsAppConfig) -> Self {
        Self::new(config.sidecar_url.clone(), config.request_timeout())
    }

    pub fn session_url(&self, session: &str) -> String {
        format!("{}/sessions/{session}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Connector for SidecarConnector {
    async fn open(&self, session: &str) -> Result<Arc<dyn Connection>, ConnectionError> {
        Ok(Arc::new(SidecarConnection::new(
            session,
            self.session_url(session),
            self.request_timeout,
        )))
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

/// State shared between a [`SidecarConnection`] and its socket task.
struct Shared {
    session: String,
    connected: AtomicBool,
    /// Set once we asked for the disconnect, so the socket ending is a close.
    closing: AtomicBool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    /// Where `qr` frames go while a QR login is pending.
    qr_sink: std::sync::Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Shared {
    fn set_qr_sink(&self, sink: Option<mpsc::UnboundedSender<String>>) {
        if let Ok(mut slot) = self.qr_sink.lock() {
            *slot = sink;
        }
    }

    fn forward_qr(&self, code: String) {
        match self.qr_sink.lock().ok().as_deref().and_then(Option::as_ref) {
            Some(sink) => {
                let _ = sink.send(code);
            },
            None => debug!(session = %self.session, "qr code with no login pending"),
        }
    }
}

/// Uninstalls the QR sink when a login finishes or is cancelled.
struct QrSinkGuard<'a>(&'a Shared);

impl Drop for QrSinkGuard<'_> {
    fn drop(&mut self) {
        self.0.set_qr_sink(None);
    }
}

/// A session's link to the network, proxied through the bridge sidecar.
pub struct SidecarConnection {
    url: String,
    request_timeout: Duration,
    shared: Arc<Shared>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    events_rx: std::sync::Mutex<Option<EventStream>>,
    socket_task: Mutex<Option<JoinHandle<()>>>,
}

impl SidecarConnection {
    pub fn new(session: &str, url: String, request_timeout: Duration) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        Self {
            url,
            request_timeout,
            shared: Arc::new(Shared {
                session: session.to_string(),
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                events,
                qr_sink: std::sync::Mutex::new(None),
            }),
            commands: Mutex::new(None),
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            socket_task: Mutex::new(None),
        }
    }

    /// Issue a request and wait for its response. `limit` of `None` waits as
    /// long as the socket lives.
    async fn call(
        &self,
        request: Request,
        limit: Option<Duration>,
    ) -> Result<Value, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let commands = self
            .commands
            .lock()
            .await
            .clone()
            .ok_or(ConnectionError::NotConnected)?;

        let kind = request.kind();
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command { request, reply })
            .await
            .map_err(|_| ConnectionError::Closed)?;

        let answer = match limit {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                ConnectionError::Transport(format!(
                    "sidecar did not answer {kind} within {}s",
                    limit.as_secs()
                ))
            })?,
            None => rx.await,
        };
        answer.map_err(|_| ConnectionError::Closed)?
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ConnectionError> {
    serde_json::from_value(value).map_err(|e| ConnectionError::Protocol(e.to_string()))
}

#[async_trait]
impl Connection for SidecarConnection {
    async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::channel(32);
        *self.commands.lock().await = Some(tx);
        self.shared.closing.store(false, Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);

        let task = tokio::spawn(run_socket(socket, rx, Arc::clone(&self.shared)));
        if let Some(previous) = self.socket_task.lock().await.replace(task) {
            previous.abort();
        }
        info!(session = %self.shared.session, url = %self.url, "bridge socket open");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn login_with_qr(
        &self,
        codes: mpsc::Sender<String>,
    ) -> Result<CredentialRecord, ConnectionError> {
        let (sink, mut qr_rx) = mpsc::unbounded_channel();
        self.shared.set_qr_sink(Some(sink));
        let _sink_guard = QrSinkGuard(&self.shared);

        // The sidecar answers only once a code was scanned or it gave up.
        let call = self.call(Request::LoginQr, None);
        tokio::pin!(call);
        let result = loop {
            tokio::select! {
                biased;
                // Codes queued ahead of the response go out first.
                Some(code) = qr_rx.recv() => {
                    let _ = codes.send(code).await;
                },
                result = &mut call => break result,
            }
        };

        let reply: CredentialsReply = decode(result?)?;
        Ok(reply.credentials)
    }

    async fn restore_with_session(
        &self,
        record: &CredentialRecord,
    ) -> Result<CredentialRecord, ConnectionError> {
        let request = Request::Restore {
            credentials: record.clone(),
        };
        let reply: CredentialsReply =
            decode(self.call(request, Some(self.request_timeout)).await?)?;
        Ok(reply.credentials)
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<SentMessage, ConnectionError> {
        let request = Request::SendText {
            to: chat_id.to_string(),
            text: text.to_string(),
        };
        decode(self.call(request, Some(self.request_timeout)).await?)
    }

    async fn disconnect(&self) -> Result<CredentialRecord, ConnectionError> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let result = self
            .call(Request::Disconnect, Some(self.request_timeout))
            .await;

        // Dropping the command sender ends the socket task.
        self.commands.lock().await.take();
        self.shared.connected.store(false, Ordering::SeqCst);

        let reply: CredentialsReply = decode(result?)?;
        Ok(reply.credentials)
    }

    fn take_events(&self) -> Option<EventStream> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

// ── Socket task ──────────────────────────────────────────────────────────────

async fn run_socket(socket: Socket, mut commands: mpsc::Receiver<Command>, shared: Arc<Shared>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut pending: HashMap<u64, Reply> = HashMap::new();
    let mut next_id: u64 = 1;

    let failure: Option<String> = loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(Command { request, reply }) = command else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break None;
                };
                let id = next_id;
                next_id += 1;

                let text = match serde_json::to_string(&Envelope { id, request: &request }) {
                    Ok(text) => text,
                    Err(e) => {
                        let _ = reply.send(Err(ConnectionError::Protocol(e.to_string())));
                        continue;
                    },
                };
                pending.insert(id, reply);
                debug!(session = %shared.session, id, kind = request.kind(), "bridge request");
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    break Some(format!("send to sidecar failed: {e}"));
                }
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reason) = handle_frame(text.as_str(), &mut pending, &shared) {
                        break Some(reason);
                    }
                },
                Some(Ok(Message::Close(_))) | None => break Some("sidecar closed the stream".into()),
                Some(Ok(_)) => {},
                Some(Err(e)) => break Some(e.to_string()),
            },
        }
    };

    shared.connected.store(false, Ordering::SeqCst);
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(ConnectionError::Closed));
    }

    let event = match failure {
        Some(reason) if !shared.closing.load(Ordering::SeqCst) => {
            warn!(session = %shared.session, %reason, "bridge socket failed");
            ConnectionEvent::Failed(reason)
        },
        _ => {
            info!(session = %shared.session, "bridge socket closed");
            ConnectionEvent::Closed
        },
    };
    let _ = shared.events.send(event);
}

/// Route one text frame. Returns the reason when the sidecar reports the
/// network connection lost.
fn handle_frame(
    text: &str,
    pending: &mut HashMap<u64, Reply>,
    shared: &Shared,
) -> Option<String> {
    let frame = match serde_json::from_str::<SidecarFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(session = %shared.session, error = %e, "ignoring unparseable bridge frame");
            return None;
        },
    };

    match frame {
        SidecarFrame::Response { id, result, error } => {
            let Some(reply) = pending.remove(&id) else {
                warn!(session = %shared.session, id, "response for unknown request");
                return None;
            };
            let outcome = match error {
                Some(error) => Err(error.into()),
                None => Ok(result.unwrap_or(Value::Null)),
            };
            let _ = reply.send(outcome);
        },
        SidecarFrame::Qr { code } => shared.forward_qr(code),
        SidecarFrame::Message { message } => {
            let _ = shared.events.send(ConnectionEvent::Message(message));
        },
        SidecarFrame::ConnectionFailed { reason } => return Some(reason),
    }
    None
}
