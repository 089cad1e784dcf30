//! HTTP control surface.
//!
//! Three routes: a welcome endpoint for monitoring, the authenticated
//! start/stop dispatch per conversation token, and a health endpoint
//! exposing session and metrics snapshots.

use crate::auth::{self, AuthError, TrustedProxies};
use crate::capture::RecordingStatus;
use crate::metrics::Metrics;
use crate::sessions::{SessionManager, StartRequest};
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gramoconf::Registry;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Shared state for the control handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub manager: Arc<SessionManager>,
    pub metrics: Arc<Metrics>,
    pub proxies: Arc<TrustedProxies>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/welcome", get(welcome))
        .route("/api/v1/session/{token}", post(control))
        .route("/health", get(health))
        .with_state(state)
}

async fn welcome() -> Json<serde_json::Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sessions": state.manager.stats(),
        "recordings": state.metrics.snapshot(),
    }))
}

/// Request bodies on the control route.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlBody {
    Start { start: StartBody },
    Stop { stop: StopBody },
}

#[derive(Debug, Deserialize)]
struct StartBody {
    owner: String,
    actor: Actor,
    /// 1 records audio and video, 2 audio only. Defaults to audio and video.
    #[serde(default)]
    status: Option<u8>,
    /// Signaling endpoint handling the call.
    #[serde(default)]
    signaling: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Actor {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct StopBody {
    #[serde(default)]
    actor: Option<Actor>,
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Control bodies are tiny; anything beyond this is rejected outright.
const MAX_BODY_BYTES: usize = 64 * 1024;

async fn control(
    State(state): State<AppState>,
    Path(token): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();

    // Present when the server was started with connect info; absent in
    // router-level tests.
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let headers = parts.headers;
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok());
    let remote = state.proxies.remote_address(&peer, forwarded);

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => {
            tracing::warn!(session.token = %token, remote = %remote, "unreadable request body");
            return reject(StatusCode::BAD_REQUEST, "unreadable body");
        }
    };

    let header = |name: &'static str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .ok_or(AuthError::MissingHeader(name))
    };

    let authenticated = header(auth::BACKEND_HEADER).and_then(|origin| {
        let random = header(auth::RANDOM_HEADER)?;
        let checksum = header(auth::CHECKSUM_HEADER)?;
        auth::authenticate(&state.registry, origin, random, checksum, &body)
    });

    let backend = match authenticated {
        Ok(backend) => backend,
        Err(e) => {
            tracing::warn!(session.token = %token, remote = %remote, error = %e, "request rejected");
            let status = match e {
                AuthError::BodyTooLarge { .. } => StatusCode::BAD_REQUEST,
                _ => StatusCode::FORBIDDEN,
            };
            return reject(status, &e.to_string());
        }
    };

    let parsed: ControlBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(session.token = %token, remote = %remote, error = %e, "malformed request body");
            return reject(StatusCode::BAD_REQUEST, "malformed body");
        }
    };

    match parsed {
        ControlBody::Start { start } => {
            let status = match start.status {
                None => RecordingStatus::AudioAndVideo,
                Some(value) => match RecordingStatus::from_wire(value) {
                    Some(status) => status,
                    None => return reject(StatusCode::BAD_REQUEST, "invalid recording status"),
                },
            };

            tracing::info!(
                session.token = %token,
                backend = %backend.id,
                actor.kind = %start.actor.kind,
                actor.id = %start.actor.id,
                "start requested"
            );

            let request = StartRequest {
                owner: start.owner,
                actor_type: start.actor.kind,
                actor_id: start.actor.id,
                status,
                signaling_url: start.signaling,
            };
            state.manager.start_recording(backend, &token, request);
        }
        ControlBody::Stop { stop } => {
            if let Some(actor) = &stop.actor {
                tracing::info!(
                    session.token = %token,
                    backend = %backend.id,
                    actor.kind = %actor.kind,
                    actor.id = %actor.id,
                    "stop requested"
                );
            }
            state.manager.stop_recording(&token);
        }
    }

    // Accepted and duplicate requests look the same to the origin.
    Json(json!({})).into_response()
}
