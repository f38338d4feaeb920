//! REST handlers bridging the dashboard to the session orchestrator.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use qmon::{CreateSessionRequest, GlobalSettings, MonitorError, SessionManager, SessionSnapshot, SessionState};
use serde::Deserialize;
use serde_json::{Value, json};

use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct CreateSessionsBody {
	#[serde(flatten)]
	request: CreateSessionRequest,
	#[serde(default = "default_count")]
	count: u32,
}

fn default_count() -> u32 {
	1
}

/// Pulls a required boolean field out of a free-form JSON body.
fn required_bool(body: &Value, field: &str) -> Result<bool, ApiError> {
	body.get(field)
		.and_then(Value::as_bool)
		.ok_or_else(|| MonitorError::InvalidInput(format!("{field} must be a boolean")).into())
}

pub async fn list_sessions(State(manager): State<SessionManager>) -> Json<Vec<SessionSnapshot>> {
	Json(manager.list().await)
}

pub async fn create_sessions(
	State(manager): State<SessionManager>,
	Json(body): Json<CreateSessionsBody>,
) -> Result<(StatusCode, Json<Vec<SessionSnapshot>>), ApiError> {
	let created = manager.create_many(body.request, body.count, true).await?;
	Ok((StatusCode::CREATED, Json(created)))
}

pub async fn bring_to_front(
	State(manager): State<SessionManager>,
	Path(id): Path<String>,
) -> Result<Json<SessionState>, ApiError> {
	Ok(Json(manager.bring_to_front(&id).await?))
}

pub async fn reload(
	State(manager): State<SessionManager>,
	Path(id): Path<String>,
) -> Result<Json<SessionState>, ApiError> {
	Ok(Json(manager.reload(&id).await?))
}

pub async fn capture_screenshot(
	State(manager): State<SessionManager>,
	Path(id): Path<String>,
) -> Result<Json<SessionState>, ApiError> {
	Ok(Json(manager.screenshot(&id).await?))
}

/// Latest screenshot as PNG bytes; 404 until one has been captured.
pub async fn latest_screenshot(
	State(manager): State<SessionManager>,
	Path(id): Path<String>,
) -> Result<Response, ApiError> {
	let not_captured = || (StatusCode::NOT_FOUND, Json(json!({ "error": "no screenshot captured" }))).into_response();
	let Some(path) = manager.screenshot_file(&id).await? else {
		return Ok(not_captured());
	};
	match tokio::fs::read(&path).await {
		Ok(bytes) => Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response()),
		Err(_) => Ok(not_captured()),
	}
}

pub async fn set_session_auto_reload(
	State(manager): State<SessionManager>,
	Path(id): Path<String>,
	Json(body): Json<Value>,
) -> Result<Json<SessionState>, ApiError> {
	let enabled = required_bool(&body, "enabled")?;
	Ok(Json(manager.set_session_auto_reload(&id, enabled).await?))
}

pub async fn submit_captcha(
	State(manager): State<SessionManager>,
	Path(id): Path<String>,
	Json(body): Json<Value>,
) -> Result<Json<SessionState>, ApiError> {
	let answer = body.get("answer").and_then(Value::as_str).unwrap_or_default();
	Ok(Json(manager.submit_captcha(&id, answer).await?))
}

pub async fn refresh_captcha(
	State(manager): State<SessionManager>,
	Path(id): Path<String>,
) -> Result<Json<SessionState>, ApiError> {
	Ok(Json(manager.refresh_captcha(&id).await?))
}

pub async fn set_global_auto_reload(
	State(manager): State<SessionManager>,
	Json(body): Json<Value>,
) -> Result<Json<GlobalSettings>, ApiError> {
	let enabled = required_bool(&body, "enabled")?;
	Ok(Json(manager.set_global_auto_reload(enabled).await))
}
