use crate::metrics::{PAUSES_TOTAL, WEBHOOK_EVENTS_TOTAL, metrics_handler};
use crate::models::webhook::{ControlEvent, DockerBuildWebhook, GitHubWebhook};
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

pub type ControlSender = mpsc::UnboundedSender<ControlEvent>;
pub type ControlReceiver = mpsc::UnboundedReceiver<ControlEvent>;

/// Comment text that pauses promotions
pub const PAUSE_MARKER: &str = "[laminar pause]";

const GITHUB_EVENT_HEADER: &str = "x-github-event";
const ISSUE_COMMENT_EVENT: &str = "issue_comment";

#[derive(Clone)]
struct ControlState {
    event_tx: ControlSender,
    github_token: Arc<str>,
}

/// Build the control surface router.
///
/// The GitHub webhook only answers on its secret path; with an empty token
/// the route never matches.
pub fn router(event_tx: ControlSender, github_token: &str) -> Router {
    let state = ControlState {
        event_tx,
        github_token: Arc::from(github_token),
    };

    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/webhooks/github/{token}", post(handle_github_webhook))
        .route("/webhooks/build/docker", post(handle_docker_build_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve the control surface in the background
pub async fn start_control_server(
    addr: SocketAddr,
    event_tx: ControlSender,
    github_token: &str,
) -> Result<JoinHandle<()>> {
    let app = router(event_tx, github_token);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind control server on {}", addr))?;
    info!("Starting control server on {}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Control server failed: {}", e);
        }
    });

    Ok(handle)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn handle_github_webhook(
    State(state): State<ControlState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if state.github_token.is_empty() || token != *state.github_token {
        return (StatusCode::NOT_FOUND, "not found");
    }
    WEBHOOK_EVENTS_TOTAL.inc();

    if !is_issue_comment(&headers) {
        info!("Ignoring GitHub webhook: not a comment");
        return (StatusCode::OK, "ok");
    }

    let payload: GitHubWebhook = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Couldn't parse GitHub webhook payload: {}", e);
            return (StatusCode::OK, "ok");
        },
    };
    debug!(
        "Comment on {}#{} by {}",
        payload.repository.full_name, payload.issue.number, payload.sender.login
    );

    if !payload.comment.body.contains(PAUSE_MARKER) {
        return (StatusCode::OK, "ok");
    }

    let requested_by = Some(payload.comment.user.login)
        .filter(|login| !login.is_empty())
        .or_else(|| Some(payload.sender.login).filter(|login| !login.is_empty()));
    info!(
        "Laminar instructed to pause by {}",
        requested_by.as_deref().unwrap_or("unknown")
    );

    let event = ControlEvent::Pause {
        requested_at: Utc::now(),
        requested_by,
    };
    if let Err(e) = state.event_tx.send(event) {
        error!("Failed to send pause event: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to pause");
    }

    PAUSES_TOTAL.inc();
    (StatusCode::OK, "laminar paused")
}

async fn handle_docker_build_webhook(
    State(state): State<ControlState>,
    Json(payload): Json<DockerBuildWebhook>,
) -> impl IntoResponse {
    WEBHOOK_EVENTS_TOTAL.inc();
    info!(
        "Told about a new build of {} ({})",
        payload.docker_registry_url, payload.url
    );

    if let Err(e) = state.event_tx.send(ControlEvent::Build(payload)) {
        error!("Failed to send build event: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to process build");
    }

    (StatusCode::OK, "build webhook received")
}

fn is_issue_comment(headers: &HeaderMap) -> bool {
    headers
        .get_all(GITHUB_EVENT_HEADER)
        .iter()
        .any(|value| value.as_bytes() == ISSUE_COMMENT_EVENT.as_bytes())
}
