//! Read/control HTTP surface for the daemon.
//!
//! A small axum router served from a dedicated thread running its own
//! current-thread Tokio runtime, so the rest of the system stays plain
//! threads. Read endpoints return catalog statistics, scanner progress,
//! pipeline status and recent events; control verbs drive the pipeline and
//! scanner. Every verb is idempotent within its semantics. Basic auth is
//! optional and applied to every route when enabled.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path as AxumPath, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::press_core::catalog::Catalog;
use crate::press_core::config::SharedConfig;
use crate::press_core::pipeline::{Pipeline, SessionOutcome};
use crate::press_core::scanner::Scanner;

#[derive(Clone)]
pub struct MonitorState {
    pub catalog: Arc<Catalog>,
    pub scanner: Scanner,
    pub pipeline: Pipeline,
    pub config: SharedConfig,
    /// Needed by the reload_config verb; None disables it.
    pub config_path: Option<PathBuf>,
}

/// Human-readable duration for dashboard fields ("2h 5m", "3m 20s").
pub(crate) fn format_seconds(seconds: f64) -> String {
    if seconds < 0.0 || !seconds.is_finite() {
        return "unknown".to_string();
    }
    let total = seconds as u64;
    if total < 60 {
        format!("{total}s")
    } else if total < 3600 {
        format!("{}m {}s", total / 60, total % 60)
    } else {
        format!("{}h {}m", total / 3600, (total % 3600) / 60)
    }
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn stats(State(state): State<MonitorState>) -> Response {
    match state.catalog.statistics() {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn scan_status(State(state): State<MonitorState>) -> Response {
    Json(state.scanner.progress()).into_response()
}

async fn compression_status(State(state): State<MonitorState>) -> Response {
    let config = state.config.get();
    let status = state.pipeline.status(&config);
    let mut value = match serde_json::to_value(&status) {
        Ok(value) => value,
        Err(err) => return internal_error(err),
    };
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "session_duration".to_string(),
            json!(format_seconds(status.session_duration_seconds)),
        );
        object.insert(
            "queue_eta".to_string(),
            json!(format_seconds(status.queue_eta_seconds)),
        );
    }
    Json(value).into_response()
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn events(
    State(state): State<MonitorState>,
    Query(query): Query<EventsQuery>,
) -> Response {
    match state.catalog.recent_events(query.limit.unwrap_or(100)) {
        Ok(events) => Json(events).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn control(
    State(state): State<MonitorState>,
    AxumPath(verb): AxumPath<String>,
) -> Response {
    match verb.as_str() {
        "pause" => {
            state.pipeline.pause();
            Json(json!({ "status": "ok", "action": "pause" })).into_response()
        }
        "resume" => {
            state.pipeline.resume();
            Json(json!({ "status": "ok", "action": "resume" })).into_response()
        }
        "stop" => {
            state.pipeline.stop();
            Json(json!({ "status": "ok", "action": "stop" })).into_response()
        }
        "start_scan" => {
            if state.scanner.is_scanning() {
                return Json(json!({ "status": "already_running", "action": "start_scan" }))
                    .into_response();
            }
            let scanner = state.scanner.clone();
            let config = state.config.get();
            std::thread::spawn(move || {
                if let Err(err) = scanner.run_scan(&config) {
                    warn!(error = %err, "scan launched from monitor failed");
                }
            });
            Json(json!({ "status": "ok", "action": "start_scan" })).into_response()
        }
        "start_compression" => {
            if state.pipeline.session_in_progress() {
                return Json(
                    json!({ "status": "already_running", "action": "start_compression" }),
                )
                .into_response();
            }
            let pipeline = state.pipeline.clone();
            let config = state.config.get();
            std::thread::spawn(move || {
                match pipeline.process_queue(&config, None, true) {
                    SessionOutcome::Skipped { reason } => {
                        info!(reason = %reason, "compression session launched from monitor was skipped");
                    }
                    SessionOutcome::Completed { files_processed, .. } => {
                        info!(files_processed, "compression session launched from monitor finished");
                    }
                }
            });
            Json(json!({ "status": "ok", "action": "start_compression" })).into_response()
        }
        "reload_config" => match &state.config_path {
            Some(path) => match state.config.reload_from(path) {
                Ok(()) => {
                    info!(path = %path.display(), "configuration reloaded");
                    Json(json!({ "status": "ok", "action": "reload_config" })).into_response()
                }
                Err(err) => (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "status": "error", "error": err.to_string() })),
                )
                    .into_response(),
            },
            None => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "error": "no configuration file specified" })),
            )
                .into_response(),
        },
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "error", "error": format!("unknown control verb: {verb}") })),
        )
            .into_response(),
    }
}

pub(crate) fn basic_auth_matches(header_value: &str, username: &str, password: &str) -> bool {
    let Some(encoded) = header_value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };
    user == username && pass == password
}

async fn require_auth(State(state): State<MonitorState>, req: Request, next: Next) -> Response {
    let config = state.config.get();
    let web = &config.web_interface;
    if !web.secure {
        return next.run(req).await;
    }

    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| basic_auth_matches(v, &web.username, &web.password));

    if authorized {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"mediapress\"")],
            "unauthorized",
        )
            .into_response()
    }
}

pub(crate) fn router(state: MonitorState) -> Router {
    Router::new()
        .route("/api/stats", get(stats))
        .route("/api/scan", get(scan_status))
        .route("/api/compression", get(compression_status))
        .route("/api/events", get(events))
        .route("/control/{verb}", post(control))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the monitor server on its own runtime thread. Returns immediately;
/// bind or serve failures are logged from the server thread.
pub fn spawn_monitor(state: MonitorState) -> Result<()> {
    let web = state.config.get().web_interface.clone();
    if !web.enabled {
        return Ok(());
    }

    std::thread::Builder::new()
        .name("mediapress-monitor".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!(error = %err, "failed to build monitor runtime");
                    return;
                }
            };
            runtime.block_on(async move {
                let app = router(state);
                let listener =
                    match tokio::net::TcpListener::bind((web.host.as_str(), web.port)).await {
                        Ok(listener) => listener,
                        Err(err) => {
                            error!(host = %web.host, port = web.port, error = %err,
                                "failed to bind monitor interface");
                            return;
                        }
                    };
                info!(host = %web.host, port = web.port, "monitor interface listening");
                if let Err(err) = axum::serve(listener, app).await {
                    error!(error = %err, "monitor server exited with error");
                }
            });
        })
        .context("failed to spawn monitor thread")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_seconds_covers_all_ranges() {
        assert_eq!(format_seconds(42.0), "42s");
        assert_eq!(format_seconds(200.0), "3m 20s");
        assert_eq!(format_seconds(7500.0), "2h 5m");
        assert_eq!(format_seconds(-1.0), "unknown");
    }

    #[test]
    fn basic_auth_accepts_exact_credentials_only() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:secret");
        let header_value = format!("Basic {encoded}");
        assert!(basic_auth_matches(&header_value, "admin", "secret"));
        assert!(!basic_auth_matches(&header_value, "admin", "other"));
        assert!(!basic_auth_matches("Bearer token", "admin", "secret"));
        assert!(!basic_auth_matches("Basic !!!notbase64!!!", "admin", "secret"));
    }
}
