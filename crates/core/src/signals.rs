//! Queue-protocol signal model and text-based phase predicates.
//!
//! The queue page maintains a handful of global objects (`admissionInfo`,
//! `queueinfo`, `wr_error`) with stringly-typed flags. They are read verbatim
//! by the poll script and deserialized leniently here: every field optional,
//! unknown fields ignored, `"true"`/`"false"` kept as strings because the
//! page itself is not consistent about them.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Queue-controller endpoint whose responses carry admission payloads.
pub const CONTROLLER_ENDPOINT: &str = "/pkpcontroller/servlet.do";

/// Structured admission signal exposed by the queue page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdmissionInfo {
	/// Whether the admission token has been generated (`"true"`/`"false"`).
	#[serde(default, rename = "genAT", skip_serializing_if = "Option::is_none")]
	pub gen_at: Option<String>,
	/// Whether the visitor may enter (`"true"`/`"false"`).
	#[serde(default, rename = "canEnter", skip_serializing_if = "Option::is_none")]
	pub can_enter: Option<String>,
	/// Redirect target once admitted; `"false"` means not ready.
	#[serde(default, rename = "admissionURL", skip_serializing_if = "Option::is_none")]
	pub admission_url: Option<String>,
	/// Whether the page demands a captcha (`"true"`/`"false"`).
	#[serde(default, rename = "needCaptcha", skip_serializing_if = "Option::is_none")]
	pub need_captcha: Option<String>,
	/// Estimated wait, in whatever unit the queue reports.
	#[serde(default, rename = "waitingTime", skip_serializing_if = "Option::is_none")]
	pub waiting_time: Option<Value>,
	/// Fields the page adds that the monitor does not interpret.
	#[serde(flatten)]
	pub extra: serde_json::Map<String, Value>,
}

impl AdmissionInfo {
	fn flag(value: &Option<String>) -> bool {
		value.as_deref() == Some("true")
	}

	pub fn needs_captcha(&self) -> bool {
		Self::flag(&self.need_captcha)
	}

	pub fn token_generated(&self) -> bool {
		Self::flag(&self.gen_at)
	}

	pub fn can_enter(&self) -> bool {
		Self::flag(&self.can_enter)
	}

	/// Admission URL, if present and not the literal `"false"`.
	pub fn ready_admission_url(&self) -> Option<&str> {
		self.admission_url.as_deref().filter(|url| !url.is_empty() && *url != "false")
	}

	/// A concrete positive estimated wait means the queue promises progress.
	pub fn concrete_wait(&self) -> bool {
		let numeric = match &self.waiting_time {
			Some(Value::Number(n)) => n.as_f64(),
			Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
			_ => None,
		};
		numeric.is_some_and(|n| n.is_finite() && n > 0.0)
	}
}

/// Everything the in-page extraction script reports on one poll tick.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSnapshot {
	pub url: Option<String>,
	pub admission_info: Option<AdmissionInfo>,
	#[serde(rename = "queueinfo")]
	pub queue_info: Option<Value>,
	#[serde(rename = "wr_error")]
	pub queue_error: Option<Value>,
	pub countdown_text: Option<String>,
	pub queue_position: Option<String>,
	pub status_message: Option<String>,
	#[serde(default)]
	pub captcha_visible: bool,
	pub captcha_data_url: Option<String>,
	pub title: Option<String>,
	pub info_banner: Option<String>,
	/// Capture timestamp, milliseconds since the Unix epoch (page clock).
	pub timestamp: Option<u64>,
}

/// Pluggable phrase predicates over extracted banner/message text.
///
/// Phase inference from free text is kept as data so new queue phrasings can
/// be added without touching the transition engine.
#[derive(Debug, Clone)]
pub struct TextMatchers {
	maintenance: Vec<String>,
	captcha_prompts: Vec<String>,
}

impl Default for TextMatchers {
	fn default() -> Self {
		Self {
			maintenance: vec!["we are currently performing scheduled maintenance".into()],
			captcha_prompts: vec![
				"enter the characters you see in the image below".into(),
				"if you would like to join the queue".into(),
				"thank you for waiting to have an opportunity to purchase ticket(s)".into(),
			],
		}
	}
}

impl TextMatchers {
	pub fn new(maintenance: Vec<String>, captcha_prompts: Vec<String>) -> Self {
		Self { maintenance, captcha_prompts }
	}

	fn matches_any(phrases: &[String], candidates: &[Option<&str>]) -> bool {
		candidates.iter().flatten().any(|text| {
			let lower = text.to_lowercase();
			phrases.iter().any(|phrase| lower.contains(phrase.as_str()))
		})
	}

	/// True when any candidate text carries a maintenance notice.
	pub fn is_maintenance(&self, candidates: &[Option<&str>]) -> bool {
		Self::matches_any(&self.maintenance, candidates)
	}

	/// True when any candidate text reads as a captcha prompt.
	pub fn is_captcha_prompt(&self, candidates: &[Option<&str>]) -> bool {
		Self::matches_any(&self.captcha_prompts, candidates)
	}
}

static LOCATION_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r#"\{\s*"location"\s*:\s*"([^"]+)"\s*\}"#).expect("location pattern should compile"));
static ADMISSION_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r#"\{\s*"admissionInfo"\s*:\s*\{[\s\S]*?\}\s*\}"#).expect("admission pattern should compile"));

/// Payload fragments pulled out of a queue-controller response body.
#[derive(Debug, Default, PartialEq)]
pub struct ControllerPayload {
	pub location: Option<String>,
	pub admission_info: Option<AdmissionInfo>,
	/// The raw parsed envelope, kept as the session's last response.
	pub raw: Option<Value>,
}

/// Extracts admission fragments from a controller response body.
///
/// The endpoint interleaves JSON objects with other content, so fragments are
/// located by shape rather than by parsing the whole body. Anything that does
/// not parse is ignored.
pub fn parse_controller_payload(body: &str) -> ControllerPayload {
	let mut payload = ControllerPayload::default();
	if body.is_empty() {
		return payload;
	}

	if let Some(captures) = LOCATION_RE.captures(body) {
		payload.location = captures.get(1).map(|m| m.as_str().to_string());
	}

	if let Some(m) = ADMISSION_RE.find(body) {
		if let Ok(envelope) = serde_json::from_str::<Value>(m.as_str()) {
			if let Some(info) = envelope.get("admissionInfo") {
				payload.admission_info = serde_json::from_value(info.clone()).ok();
			}
			payload.raw = Some(envelope);
		}
	}

	payload
}
