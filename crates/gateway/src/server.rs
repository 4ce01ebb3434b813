//! HTTP surface of the gateway.
//!
//! Routes:
//!
//! | Method   | Path                                 | Handler                      |
//! |----------|--------------------------------------|------------------------------|
//! | `GET`    | `/api/status`                        | backend health check         |
//! | `GET`    | `/api/containers/ws/:id`             | interactive terminal         |
//! | `POST`   | `/api/containers/exec-stream/:id`    | one-shot streamed exec       |
//! | `GET`    | `/api/containers/logs/stream/:id`    | log follow                   |
//! | `GET`    | `/api/logs`                          | action log entries           |
//! | `DELETE` | `/api/logs`                          | clear the action log         |
//! | `GET`    | `/api/sessions`                      | live sessions                |
//! | `DELETE` | `/api/sessions/:id`                  | cancel a session             |

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use protocol::SessionSummary;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::action_log::{ActionLog, ActionLogEntry};
use crate::config::Config;
use crate::runner::CommandRunner;
use crate::session::{CloseReason, LaunchErrorKind, SessionError, SessionRegistry};
use crate::targets::{TargetError, Targets};
use crate::transport::{exec, follow, terminal};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<Config>,
    /// Live sessions.
    pub sessions: Arc<SessionRegistry>,
    /// Record of external command invocations.
    pub action_log: Arc<ActionLog>,
    /// Launch command templates.
    pub targets: Arc<Targets>,
    /// Buffered CLI invocations.
    pub runner: CommandRunner,
}

impl AppState {
    /// Builds the shared state from configuration.
    pub fn new(config: Config) -> Self {
        let action_log = Arc::new(ActionLog::from_config(&config.action_log));
        let runner = CommandRunner::new(config.targets.program.clone(), Arc::clone(&action_log));
        Self {
            sessions: Arc::new(SessionRegistry::new(config.session.max_sessions)),
            targets: Arc::new(Targets::new(config.targets.clone())),
            config: Arc::new(config),
            action_log,
            runner,
        }
    }
}

/// Errors returned by handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request named an unusable target or command.
    #[error(transparent)]
    Target(#[from] TargetError),

    /// Session creation or lookup failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Returns the HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Target(_) => StatusCode::BAD_REQUEST,
            ApiError::Session(SessionError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Session(SessionError::LimitReached(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Session(SessionError::Launch(e)) if e.kind == LaunchErrorKind::PtyAlloc => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Session(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error description.
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = %status, error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Response of `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// `ok` when the backend CLI reports healthy, otherwise `offline`.
    pub status: String,
    /// Gateway version.
    pub version: String,
    /// RFC 3339 time of the check.
    pub timestamp: String,
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let healthy = state.runner.run(state.targets.status_args()).await.is_ok();
    Json(StatusResponse {
        status: if healthy { "ok" } else { "offline" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

async fn list_logs(State(state): State<AppState>) -> Json<Vec<ActionLogEntry>> {
    Json(state.action_log.entries())
}

async fn clear_logs(State(state): State<AppState>) -> StatusCode {
    state.action_log.clear();
    StatusCode::OK
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.list())
}

async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.cancel(&id)?;
    tracing::info!(session_id = %id, "Session cancelled via API");
    Ok(StatusCode::ACCEPTED)
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/containers/ws/:id", get(terminal::terminal_ws))
        .route("/api/containers/exec-stream/:id", post(exec::exec_stream))
        .route("/api/containers/logs/stream/:id", get(follow::follow_logs))
        .route("/api/logs", get(list_logs).delete(clear_logs))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", delete(cancel_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds the configured address.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr.parse().context("Invalid server address")?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))
}

/// Serves until `shutdown` resolves, then cancels every live session and
/// waits (bounded) for them to close.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sessions = Arc::clone(&state.sessions);
    let drain = Duration::from_millis(
        state.config.session.terminate_grace_ms + state.config.session.drain_timeout_ms,
    ) + Duration::from_secs(1);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!("HTTP server listening on http://{}", addr);
    }

    let cancel_sessions = Arc::clone(&sessions);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            cancel_sessions.cancel_all(CloseReason::Shutdown);
        })
        .await
        .context("HTTP server error")?;

    // Upgraded websockets are not tracked by the server; wait for them here.
    if !sessions.wait_idle(drain).await {
        tracing::warn!(remaining = sessions.count(), "Sessions still open at shutdown");
    }
    tracing::info!("Server stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        _ = terminate => tracing::info!("Received SIGTERM signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LaunchError;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError::from(TargetError::MissingId).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(SessionError::NotFound("x".to_string())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(SessionError::LimitReached(3)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let spawn = LaunchError {
            kind: LaunchErrorKind::Spawn,
            message: "No such file or directory".to_string(),
        };
        assert_eq!(
            ApiError::from(SessionError::Launch(spawn)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_app_state_uses_config() {
        let mut config = Config::default();
        config.targets.program = "/bin/sh".to_string();
        config.action_log.capacity = 7;

        let state = AppState::new(config);
        assert_eq!(state.runner.program(), "/bin/sh");
        assert_eq!(state.targets.program(), "/bin/sh");
        assert_eq!(state.action_log.capacity(), 7);
        assert_eq!(state.sessions.count(), 0);
    }

    #[tokio::test]
    async fn test_status_offline_when_cli_missing() {
        let mut config = Config::default();
        config.targets.program = "/nonexistent/streamgate-cli".to_string();
        let state = AppState::new(config);

        let Json(status) = get_status(State(state.clone())).await;
        assert_eq!(status.status, "offline");
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(state.action_log.len(), 1);
    }

    #[tokio::test]
    async fn test_status_ok() {
        let mut config = Config::default();
        config.targets.program = "/bin/sh".to_string();
        config.targets.status = vec!["-c".to_string(), "exit 0".to_string()];
        let state = AppState::new(config);

        let Json(status) = get_status(State(state)).await;
        assert_eq!(status.status, "ok");
    }
}
