//! Crate-wide error taxonomy for monitor operations.

use thiserror::Error;

/// Errors surfaced by session, browser and orchestrator operations.
#[derive(Debug, Error)]
pub enum MonitorError {
	/// Browser capability acquisition failed.
	#[error("browser launch failed: {0}")]
	BrowserLaunch(String),

	/// Navigation to a queue URL failed.
	#[error("navigation to {url} failed: {source}")]
	Navigation {
		url: String,
		#[source]
		source: anyhow::Error,
	},

	/// In-page script evaluation failed.
	#[error("page evaluation failed: {0}")]
	Evaluate(String),

	/// The page handle is gone (closed or never launched).
	#[error("browser page is not available")]
	PageUnavailable,

	/// Orchestrator lookup by id came up empty.
	#[error("session {0} not found")]
	SessionNotFound(String),

	/// Caller-supplied input failed validation.
	#[error("{0}")]
	InvalidInput(String),

	#[error(transparent)]
	Cdp(#[from] chromiumoxide::error::CdpError),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, MonitorError>;
