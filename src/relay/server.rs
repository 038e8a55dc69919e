use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, Path, Request, State, ws::WebSocketUpgrade},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::relay::{
    control::{self, ControlOptions},
    dispatch::Dispatcher,
    protocol::{McServer, RegisterRequest},
    telemetry,
};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub prom: Option<telemetry::SharedPrometheusHandle>,
    pub control: ControlOptions,
    pub max_frame_bytes: usize,
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ws", get(root))
        .route("/health", get(health))
        .route("/servers", get(list_servers).post(register_server))
        .route("/servers/{id}", delete(remove_server))
        .route("/discovery", get(discovery))
        .route("/metrics", get(metrics))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("server: bind {addr}"))?;
    tracing::info!(listen_addr = %addr, "server: listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .context("server: serve")?;

    tracing::info!("server: stopped");
    Ok(())
}

/// Upgrades to the control channel when asked to; plain requests get a
/// liveness banner.
async fn root(State(st): State<Arc<AppState>>, req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();
    let remote = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &st).await {
        Ok(ws) => ws,
        Err(_) => return (StatusCode::OK, "Relay Server Running").into_response(),
    };

    let dispatcher = st.dispatcher.clone();
    let opts = st.control.clone();
    let shutdown = st.shutdown.clone();
    ws.max_message_size(ws_message_limit(st.max_frame_bytes))
        .on_upgrade(move |socket| {
            control::serve_connection(socket, remote, dispatcher, opts, shutdown)
        })
}

/// Transport cap on one WebSocket message. It sits well above
/// `max_frame_bytes` so an oversized frame still reaches the dispatcher,
/// which drops it and keeps the connection open.
fn ws_message_limit(max_frame_bytes: usize) -> usize {
    const FLOOR: usize = 64 << 20;
    max_frame_bytes.saturating_mul(4).max(FLOOR)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn list_servers(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.dispatcher.sessions().list()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    ok: bool,
    id: String,
    mc_server: McServer,
}

#[derive(Debug, Serialize)]
struct FailureResponse {
    ok: bool,
    error: String,
}

fn failure(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(FailureResponse {
            ok: false,
            error: error.into(),
        }),
    )
        .into_response()
}

async fn register_server(State(st): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: RegisterRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(err) => return failure(StatusCode::BAD_REQUEST, format!("invalid body: {err}")),
    };
    match st.dispatcher.register_from_query(req) {
        Ok(summary) => (
            StatusCode::OK,
            Json(RegisterResponse {
                ok: true,
                id: summary.id,
                mc_server: summary.mc_server,
            }),
        )
            .into_response(),
        Err(err) => failure(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

async fn remove_server(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if st.dispatcher.close_session(&id) {
        (StatusCode::OK, Json(HealthResponse { ok: true })).into_response()
    } else {
        failure(StatusCode::NOT_FOUND, format!("session not found: {id}"))
    }
}

async fn discovery(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.dispatcher.discovery().list()))
}

async fn metrics(State(st): State<Arc<AppState>>) -> Response {
    let Some(prom) = &st.prom else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics disabled").into_response();
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        prom.render(),
    )
        .into_response()
}
