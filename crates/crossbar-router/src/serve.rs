//! Axum serving glue.
//!
//! Exposes the two transport endpoints in front of a [`Router`]:
//!
//! - `GET /ws` — WebSocket upgrade; an optional `connsecret` query param
//!   resumes an existing connection's identity
//! - `GET /poll` / `POST /poll` — HTTP long-poll, keyed by `connsecret`;
//!   the GET drains at most one outbound envelope, the POST injects one
//! - `GET /health` — uptime and connection count

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use crossbar_core::{ConnectionSecret, Envelope};
use crossbar_transport::{LongPollServerTransport, ServerWebSocket, TransportError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::router::Router;

/// Long-poll sessions, keyed by `connsecret`.
struct PollSessions {
    sessions: RwLock<HashMap<String, Arc<LongPollServerTransport>>>,
}

impl PollSessions {
    fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the session for `secret`, attaching a fresh transport to the
    /// router on first contact.
    async fn get_or_create(
        &self,
        router: &Router,
        secret: &str,
    ) -> Result<Arc<LongPollServerTransport>, TransportError> {
        if let Some(session) = self.sessions.read().await.get(secret) {
            return Ok(session.clone());
        }
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(secret) {
            return Ok(session.clone());
        }
        info!("new long-poll session");
        let session = Arc::new(LongPollServerTransport::new());
        router
            .add_socket(session.clone(), Some(ConnectionSecret::from_hex(secret)))
            .await?;
        sessions.insert(secret.to_owned(), session.clone());
        Ok(session)
    }
}

/// Shared state behind the Axum handlers.
#[derive(Clone)]
pub struct AppState {
    router: Router,
    sessions: Arc<PollSessions>,
    started: Instant,
}

#[derive(Deserialize)]
struct ConnQuery {
    connsecret: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    connections: usize,
}

/// Build the Axum application serving `router`.
#[must_use]
pub fn app(router: Router) -> axum::Router {
    let state = AppState {
        router,
        sessions: Arc::new(PollSessions::new()),
        started: Instant::now(),
    };
    axum::Router::new()
        .route("/ws", get(ws_handler))
        .route("/poll", get(poll_get).post(poll_post))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind a TCP listener and serve until the returned token is cancelled.
///
/// # Errors
///
/// Socket bind failures.
pub async fn bind(
    router: Router,
    addr: &str,
) -> std::io::Result<(SocketAddr, CancellationToken, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let application = app(router);
    let token = CancellationToken::new();
    let shutdown = token.clone();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, application)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .await;
        info!("server shutdown complete");
    });
    info!(addr = %bound, "server started");
    Ok((bound, token, handle))
}

/// GET /ws — WebSocket upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnQuery>,
    State(state): State<AppState>,
) -> Response {
    let secret = query
        .connsecret
        .filter(|s| !s.is_empty())
        .map(ConnectionSecret::from_hex);
    ws.on_upgrade(move |socket| async move {
        let transport = Arc::new(ServerWebSocket::spawn(socket));
        if let Err(e) = state.router.add_socket(transport, secret).await {
            warn!(error = %e, "failed to attach websocket");
        }
    })
}

/// GET /poll — drain at most one outbound envelope.
async fn poll_get(Query(query): Query<ConnQuery>, State(state): State<AppState>) -> Response {
    let Some(secret) = query.connsecret.filter(|s| !s.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "connsecret required").into_response();
    };
    match state.sessions.get_or_create(&state.router, &secret).await {
        Ok(session) => match session.pop_outbound() {
            Some(envelope) => Json(envelope).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
        Err(e) => {
            warn!(error = %e, "long-poll session setup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// POST /poll — inject one inbound envelope.
async fn poll_post(
    Query(query): Query<ConnQuery>,
    State(state): State<AppState>,
    Json(envelope): Json<Envelope>,
) -> Response {
    let Some(secret) = query.connsecret.filter(|s| !s.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "connsecret required").into_response();
    };
    match state.sessions.get_or_create(&state.router, &secret).await {
        Ok(session) => {
            session.push_inbound(envelope).await;
            StatusCode::OK.into_response()
        }
        Err(e) => {
            warn!(error = %e, "long-poll session setup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started.elapsed().as_secs(),
        connections: state.router.connection_count().await,
    })
}
