use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    askama::Template,
    axum::{
        Router,
        extract::{Query, State, rejection::JsonRejection},
        http::StatusCode,
        response::{Html, IntoResponse, Json, Response},
        routing::{get, post},
    },
    serde::Deserialize,
    serde_json::{Value, json},
    tokio::{task::JoinHandle, time::timeout},
    tokio_util::sync::CancellationToken,
    tower_http::{
        cors::{Any, CorsLayer},
        services::ServeDir,
        trace::TraceLayer,
    },
    tracing::{info, warn},
    wapi_channels::Connector,
    wapi_common::SentMessage,
    wapi_config::WapiConfig,
};

use crate::{
    dedup::RedisLedger,
    error::ApiError,
    qr::QrPage,
    state::{GatewaySettings, GatewayState},
    supervisor::Supervisor,
};

// ── Request bodies ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterSessionRequest {
    #[serde(alias = "session_name")]
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub chat_id: String,
    pub text: String,
    pub session_name: String,
}

#[derive(Debug, Deserialize)]
pub struct QrPageQuery {
    pub session_name: Option<String>,
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/register-session", post(register_session_handler))
        .route("/register-session/", post(register_session_handler))
        .route("/send-message", post(send_message_handler))
        .route("/send-message/", post(send_message_handler))
        .route("/get-qr-code", get(qr_page_handler))
        .route("/get-qr-code/", get(qr_page_handler))
        .nest_service("/static", ServeDir::new(state.qr.static_dir()));

    #[cfg(feature = "prometheus")]
    let router = router.route("/metrics", get(metrics_handler));

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let states: serde_json::Map<String, Value> = state
        .state_counts()
        .into_iter()
        .map(|(s, n)| (s.as_str().to_string(), json!(n)))
        .collect();
    Json(json!({
        "status": "ok",
        "version": state.version,
        "sessions": state.sessions.len(),
        "states": states,
    }))
}

/// Accept a registration and start login in the background.
async fn register_session_handler(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<RegisterSessionRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = body?;
    let session = state.sessions.get_or_create(&req.session_id)?;
    let login = state.login.start(Arc::clone(&session));
    info!(session = %req.session_id, ?login, "session registration accepted");

    Ok(Json(json!({
        "ok": true,
        "session_id": session.name(),
        "state": session.state(),
    })))
}

async fn send_message_handler(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<SentMessage>, ApiError> {
    let Json(req) = body?;
    let sent = state
        .messages
        .send(&req.session_name, &req.chat_id, &req.text)
        .await
        .inspect_err(|e| warn!(session = %req.session_name, error = %e, "send failed"))?;
    Ok(Json(sent))
}

async fn qr_page_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<QrPageQuery>,
) -> Result<Response, ApiError> {
    let Some(name) = query.session_name.filter(|n| !n.is_empty()) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    wapi_sessions::validate_session_name(&name)?;
    if state.sessions.get(&name).is_none() {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let html = QrPage::new(&name)
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Html(html).into_response())
}

#[cfg(feature = "prometheus")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    use wapi_metrics::{gauge, names::SESSIONS_AUTHENTICATED};

    let authenticated = state
        .state_counts()
        .into_iter()
        .find(|(s, _)| *s == wapi_sessions::SessionState::Authenticated)
        .map_or(0, |(_, n)| n);
    gauge!(SESSIONS_AUTHENTICATED).set(authenticated as f64);

    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Connect the dedup store, start the HTTP server and run until a shutdown
/// signal, then flush every session.
pub async fn start_gateway(config: &WapiConfig, connector: Arc<dyn Connector>) -> anyhow::Result<()> {
    let ledger = RedisLedger::connect(
        &config.redis_url()?,
        config.dedup.key_prefix.clone(),
        config.dedup.ttl(),
    )
    .await?;

    let settings = GatewaySettings::from_config(config);
    let grace = settings.shutdown_grace;
    #[allow(unused_mut)]
    let mut state = GatewayState::new(settings, connector, Arc::new(ledger))?;

    #[cfg(feature = "prometheus")]
    match wapi_metrics::install_prometheus() {
        Ok(handle) => state.metrics = Some(handle),
        Err(e) => warn!(error = %e, "metrics disabled"),
    }

    let state = Arc::new(state);
    let app = build_gateway_app(Arc::clone(&state));

    let addr: SocketAddr = tokio::net::lookup_host((config.server.bind.as_str(), config.server.port))
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("cannot resolve bind address {}", config.server.bind))?;
    let tls = config.tls_paths()?;

    // Startup banner.
    let lines = [
        format!("wapi gateway v{}", state.version),
        format!(
            "listening on {}://{}",
            if tls.is_some() { "https" } else { "http" },
            addr
        ),
        format!("webhook base: {}", state.settings.webhook_base),
        format!("credentials: {}", state.settings.credentials_dir.display()),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let stop = CancellationToken::new();
    let signal = stop.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.cancel();
    });

    let server: JoinHandle<std::io::Result<()>> = match tls {
        #[cfg(feature = "tls")]
        Some((cert, key)) => {
            let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
            let handle = axum_server::Handle::new();
            let signal_handle = handle.clone();
            let signal = stop.clone();
            tokio::spawn(async move {
                signal.cancelled().await;
                signal_handle.graceful_shutdown(Some(grace));
            });
            tokio::spawn(async move {
                axum_server::bind_rustls(addr, rustls)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
            })
        },
        #[cfg(not(feature = "tls"))]
        Some(_) => anyhow::bail!("TLS certificate configured but this build has no TLS support"),
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            let signal = stop.clone();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { signal.cancelled().await })
                    .await
            })
        },
    };

    serve_until_stopped(server, stop, &state.supervisor, grace).await
}

/// Wait for the stop signal, then flush sessions while in-flight requests
/// drain. Both are bounded by `grace`.
async fn serve_until_stopped(
    mut server: JoinHandle<std::io::Result<()>>,
    stop: CancellationToken,
    supervisor: &Supervisor,
    grace: Duration,
) -> anyhow::Result<()> {
    let mut finished = false;
    tokio::select! {
        result = &mut server => {
            finished = true;
            result??;
        },
        () = stop.cancelled() => {},
    }

    info!("shutting down, flushing sessions");
    if finished {
        supervisor.shutdown(grace).await;
        return Ok(());
    }

    let (_, drained) = tokio::join!(supervisor.shutdown(grace), timeout(grace, &mut server));
    match drained {
        Ok(result) => result??,
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "requests still in flight, closing server");
            server.abort();
        },
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
