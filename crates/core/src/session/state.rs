//! Observable session state pushed to dashboard clients.
//!
//! Wire field names stay camelCase (and the page's own `queueinfo` /
//! `wr_error` spellings) so existing dashboard clients keep working.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::signals::AdmissionInfo;

/// Admission phase of one supervised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
	Idle,
	Launching,
	Running,
	Waiting,
	Captcha,
	Ready,
	Error,
	Warning,
	Stopped,
}

impl SessionStatus {
	/// `stopped` is terminal for a session instance; everything else can
	/// still make progress.
	pub fn is_terminal(self) -> bool {
		matches!(self, SessionStatus::Stopped)
	}
}

/// Full observed state of one session, emitted as a snapshot on every change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
	pub status: SessionStatus,
	pub message: String,
	pub admission_info: Option<AdmissionInfo>,
	#[serde(rename = "queueinfo")]
	pub queue_info: Option<Value>,
	#[serde(rename = "wr_error")]
	pub queue_error: Option<Value>,
	pub countdown_text: Option<String>,
	pub queue_position: Option<String>,
	pub info_banner: Option<String>,
	pub page_title: Option<String>,
	pub current_url: Option<String>,
	pub captcha_required: bool,
	/// Latest captcha bitmap as an inline data URL.
	pub captcha_image: Option<String>,
	pub captcha_updated_at: Option<u64>,
	pub last_captcha_submission: Option<u64>,
	pub last_response: Option<Value>,
	pub last_updated: Option<u64>,
	pub screenshot_path: Option<PathBuf>,
	pub auto_reload_enabled: bool,
	/// Mirror of the process-wide flag, denormalized for cheap reads.
	pub global_auto_reload_enabled: bool,
	pub fingerprint_active: bool,
	pub fingerprint_info: Option<Value>,
}

impl Default for SessionState {
	fn default() -> Self {
		Self {
			status: SessionStatus::Idle,
			message: "waiting to launch".into(),
			admission_info: None,
			queue_info: None,
			queue_error: None,
			countdown_text: None,
			queue_position: None,
			info_banner: None,
			page_title: None,
			current_url: None,
			captcha_required: false,
			captcha_image: None,
			captcha_updated_at: None,
			last_captcha_submission: None,
			last_response: None,
			last_updated: None,
			screenshot_path: None,
			auto_reload_enabled: true,
			global_auto_reload_enabled: true,
			fingerprint_active: false,
			fingerprint_info: None,
		}
	}
}

/// Identity plus state, the unit of both `list()` and push updates.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
	pub id: String,
	pub label: String,
	pub state: SessionState,
}

/// Process-wide policy, mutated only through the orchestrator.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
	pub auto_reload_enabled: bool,
}

/// Event fanned out to every dashboard observer.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
	/// A session's state changed; carries the full snapshot, not a diff.
	State(SessionSnapshot),
	/// The global settings changed.
	Settings(GlobalSettings),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wire_names_match_the_dashboard_contract() {
		let state = SessionState::default();
		let value = serde_json::to_value(&state).expect("state should serialize");
		let object = value.as_object().expect("state is an object");
		for key in [
			"status",
			"message",
			"admissionInfo",
			"queueinfo",
			"wr_error",
			"captchaRequired",
			"autoReloadEnabled",
			"globalAutoReloadEnabled",
		] {
			assert!(object.contains_key(key), "missing wire field {key}");
		}
		assert_eq!(value["status"], "idle");
	}

	#[test]
	fn only_stopped_is_terminal() {
		assert!(SessionStatus::Stopped.is_terminal());
		for status in [
			SessionStatus::Idle,
			SessionStatus::Launching,
			SessionStatus::Running,
			SessionStatus::Waiting,
			SessionStatus::Captcha,
			SessionStatus::Ready,
			SessionStatus::Error,
			SessionStatus::Warning,
		] {
			assert!(!status.is_terminal());
		}
	}
}
