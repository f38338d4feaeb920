//! HTTP + WebSocket surface for the operator dashboard.
//!
//! JSON REST routes under `/api` mirror the orchestrator operations one to
//! one; the push channel at `/ws` replays the full session list on connect
//! and then forwards every state and settings change as a full snapshot.

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use qmon::{MonitorError, SessionManager};
use serde_json::json;
use thiserror::Error;

mod routes;
mod ws;


/// Request-scoped failure, rendered as `{"error": ...}` with a status code.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] MonitorError);

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = match &self.0 {
			MonitorError::SessionNotFound(_) => StatusCode::NOT_FOUND,
			MonitorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
			MonitorError::PageUnavailable => StatusCode::CONFLICT,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};
		(status, Json(json!({ "error": self.0.to_string() }))).into_response()
	}
}

pub fn build_router(manager: SessionManager) -> Router {
	Router::new()
		.route("/api/sessions", get(routes::list_sessions).post(routes::create_sessions))
		.route("/api/sessions/{id}/bring-to-front", post(routes::bring_to_front))
		.route("/api/sessions/{id}/reload", post(routes::reload))
		.route(
			"/api/sessions/{id}/screenshot",
			post(routes::capture_screenshot).get(routes::latest_screenshot),
		)
		.route("/api/sessions/{id}/auto-reload", post(routes::set_session_auto_reload))
		.route("/api/sessions/{id}/captcha", post(routes::submit_captcha))
		.route("/api/sessions/{id}/captcha/refresh", post(routes::refresh_captcha))
		.route("/api/auto-reload", post(routes::set_global_auto_reload))
		.route("/ws", get(ws::ws_handler))
		.with_state(manager)
}
