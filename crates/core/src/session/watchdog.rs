//! Pure transition classification and reload-policy bookkeeping.
//!
//! Everything here is deterministic state-in/state-out so the admission
//! policy can be tested without a browser. The session owns the side effects.

use std::time::Duration;

use tokio::time::Instant;

use crate::signals::{AdmissionInfo, TextMatchers};

/// Cap on the maintenance-reload cooldown.
pub const MAINTENANCE_COOLDOWN_CAP: Duration = Duration::from_secs(15);
/// Minimum gap between captcha-prompt focus actions.
pub const CAPTCHA_FOCUS_GAP: Duration = Duration::from_secs(5);

/// Queue phase derived from the latest admission signal and page text.
///
/// Ordering is the transition priority: the first matching condition wins,
/// so a given signal always classifies the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	/// The queue is suspended for scheduled maintenance.
	Maintenance,
	/// The page text reads as a captcha prompt.
	CaptchaPrompt,
	/// The admission signal explicitly demands a captcha.
	CaptchaRequired,
	/// An admission URL is ready; the page will redirect.
	AdmissionReady,
	/// The admission token has not been generated: the queue is not open.
	QueueClosed,
	/// The visitor may enter.
	CanEnter,
	/// Holding in the queue.
	InQueue,
}

/// Classifies one poll observation. Total over all inputs.
pub fn classify(info: &AdmissionInfo, texts: &[Option<&str>], matchers: &TextMatchers) -> Phase {
	if matchers.is_maintenance(texts) {
		return Phase::Maintenance;
	}
	if matchers.is_captcha_prompt(texts) {
		return Phase::CaptchaPrompt;
	}
	if info.needs_captcha() {
		return Phase::CaptchaRequired;
	}
	if info.ready_admission_url().is_some() {
		return Phase::AdmissionReady;
	}
	if !info.token_generated() {
		return Phase::QueueClosed;
	}
	if info.can_enter() {
		return Phase::CanEnter;
	}
	Phase::InQueue
}

/// Per-session reload and focus timers.
///
/// All decisions take `now` explicitly so tests can drive them under paused
/// time. A reload is never signalled more than once per interval window.
#[derive(Debug, Default)]
pub struct Watchdog {
	waiting_since: Option<Instant>,
	last_reload_at: Option<Instant>,
	last_maintenance_reload_at: Option<Instant>,
	last_captcha_focus_at: Option<Instant>,
}

impl Watchdog {
	/// Clears the idle-wait window; the next idle observation starts fresh.
	pub fn reset_waiting(&mut self) {
		self.waiting_since = None;
	}

	/// Records a captcha prompt. Returns true when the page should be
	/// refocused (more than [`CAPTCHA_FOCUS_GAP`] since the last focus).
	pub fn observe_captcha_prompt(&mut self, now: Instant) -> bool {
		self.waiting_since = None;
		let refocus = match self.last_captcha_focus_at {
			Some(at) => now.duration_since(at) > CAPTCHA_FOCUS_GAP,
			None => true,
		};
		if refocus {
			self.last_captcha_focus_at = Some(now);
		}
		refocus
	}

	/// Records an explicit captcha requirement; the page is always focused.
	pub fn observe_captcha_required(&mut self, now: Instant) {
		self.waiting_since = None;
		self.last_captcha_focus_at = Some(now);
	}

	/// Records an idle-queue observation. Returns true when a reload is due:
	/// at least `interval` elapsed since the wait window opened AND since the
	/// last reload, so a slow reload or lagging polls cannot cause thrashing.
	pub fn observe_idle(&mut self, now: Instant, interval: Duration) -> bool {
		let since = *self.waiting_since.get_or_insert(now);
		if now.duration_since(since) < interval {
			return false;
		}
		if let Some(last) = self.last_reload_at {
			if now.duration_since(last) < interval {
				return false;
			}
		}
		self.last_reload_at = Some(now);
		self.waiting_since = Some(now);
		true
	}

	/// Records a maintenance observation. Returns true when a maintenance
	/// reload is due, enforcing a cooldown of `min(interval, 15s)`.
	pub fn observe_maintenance(&mut self, now: Instant, interval: Duration) -> bool {
		let cooldown = interval.min(MAINTENANCE_COOLDOWN_CAP);
		if let Some(last) = self.last_maintenance_reload_at {
			if now.duration_since(last) < cooldown {
				return false;
			}
		}
		self.last_maintenance_reload_at = Some(now);
		self.waiting_since = Some(now);
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn info(value: serde_json::Value) -> AdmissionInfo {
		serde_json::from_value(value).expect("admission info should parse")
	}

	#[test]
	fn classification_priority_is_total_and_deterministic() {
		let matchers = TextMatchers::default();
		let maintenance = Some("we are currently performing scheduled maintenance");
		let prompt = Some("enter the characters you see in the image below");

		// Every lower-priority condition also holds; the higher one must win.
		let loaded = info(json!({
			"needCaptcha": "true",
			"admissionURL": "https://x",
			"genAT": "false",
			"canEnter": "true",
		}));
		assert_eq!(classify(&loaded, &[maintenance, prompt], &matchers), Phase::Maintenance);
		assert_eq!(classify(&loaded, &[prompt, None], &matchers), Phase::CaptchaPrompt);
		assert_eq!(classify(&loaded, &[None, None], &matchers), Phase::CaptchaRequired);

		let no_captcha = info(json!({ "admissionURL": "https://x", "genAT": "false" }));
		assert_eq!(classify(&no_captcha, &[None], &matchers), Phase::AdmissionReady);

		assert_eq!(classify(&info(json!({ "genAT": "false" })), &[None], &matchers), Phase::QueueClosed);
		assert_eq!(classify(&info(json!({})), &[None], &matchers), Phase::QueueClosed);
		assert_eq!(
			classify(&info(json!({ "genAT": "true", "canEnter": "true" })), &[None], &matchers),
			Phase::CanEnter
		);
		assert_eq!(
			classify(&info(json!({ "genAT": "true", "canEnter": "false" })), &[None], &matchers),
			Phase::InQueue
		);

		// Same input, same answer.
		for _ in 0..3 {
			assert_eq!(classify(&loaded, &[maintenance, prompt], &matchers), Phase::Maintenance);
		}
	}

	#[test]
	fn maintenance_outranks_concrete_wait() {
		let matchers = TextMatchers::default();
		let busy = info(json!({ "genAT": "false", "waitingTime": "300" }));
		let banner = Some("we are currently performing scheduled maintenance");
		assert_eq!(classify(&busy, &[banner], &matchers), Phase::Maintenance);
	}

	#[tokio::test(start_paused = true)]
	async fn idle_reload_waits_a_full_window() {
		let mut wd = Watchdog::default();
		let interval = Duration::from_secs(60);

		assert!(!wd.observe_idle(Instant::now(), interval), "first observation opens the window");
		tokio::time::advance(Duration::from_secs(59)).await;
		assert!(!wd.observe_idle(Instant::now(), interval));
		tokio::time::advance(Duration::from_secs(1)).await;
		assert!(wd.observe_idle(Instant::now(), interval));
	}

	#[tokio::test(start_paused = true)]
	async fn idle_reload_fires_at_most_once_per_window() {
		let mut wd = Watchdog::default();
		let interval = Duration::from_secs(60);

		wd.observe_idle(Instant::now(), interval);
		tokio::time::advance(interval).await;
		assert!(wd.observe_idle(Instant::now(), interval));

		// Watchdog invoked on every poll tick across the next two windows.
		let mut fires = 0;
		for _ in 0..24 {
			tokio::time::advance(Duration::from_secs(5)).await;
			if wd.observe_idle(Instant::now(), interval) {
				fires += 1;
			}
		}
		assert_eq!(fires, 2, "one reload per full window, no matter how often polled");
	}

	#[tokio::test(start_paused = true)]
	async fn idle_reload_double_condition_blocks_thrash() {
		let mut wd = Watchdog::default();
		let interval = Duration::from_secs(60);

		wd.observe_idle(Instant::now(), interval);
		tokio::time::advance(interval).await;
		assert!(wd.observe_idle(Instant::now(), interval));

		// Resetting the wait window alone must not bypass the reload stamp.
		wd.reset_waiting();
		tokio::time::advance(Duration::from_secs(30)).await;
		wd.observe_idle(Instant::now(), interval);
		tokio::time::advance(Duration::from_secs(30)).await;
		assert!(
			!wd.observe_idle(Instant::now(), interval),
			"waited a full waiting window but the last reload was only 60s ago with a fresh window opened at +30s"
		);
	}

	#[tokio::test(start_paused = true)]
	async fn reset_waiting_starts_a_fresh_window() {
		let mut wd = Watchdog::default();
		let interval = Duration::from_secs(60);

		wd.observe_idle(Instant::now(), interval);
		tokio::time::advance(Duration::from_secs(59)).await;
		wd.reset_waiting();

		// Re-enabled: a fresh window, not a resumed one.
		assert!(!wd.observe_idle(Instant::now(), interval));
		tokio::time::advance(Duration::from_secs(59)).await;
		assert!(!wd.observe_idle(Instant::now(), interval));
		tokio::time::advance(Duration::from_secs(1)).await;
		assert!(wd.observe_idle(Instant::now(), interval));
	}

	#[tokio::test(start_paused = true)]
	async fn maintenance_cooldown_is_capped() {
		let mut wd = Watchdog::default();
		let interval = Duration::from_secs(60);

		assert!(wd.observe_maintenance(Instant::now(), interval), "first banner reloads immediately");
		tokio::time::advance(Duration::from_secs(5)).await;
		assert!(!wd.observe_maintenance(Instant::now(), interval), "within the 15s cooldown");
		tokio::time::advance(Duration::from_secs(10)).await;
		assert!(wd.observe_maintenance(Instant::now(), interval), "cooldown is min(interval, 15s)");
	}

	#[tokio::test(start_paused = true)]
	async fn captcha_prompt_focus_rate_limited() {
		let mut wd = Watchdog::default();
		assert!(wd.observe_captcha_prompt(Instant::now()), "first prompt focuses");
		tokio::time::advance(Duration::from_secs(3)).await;
		assert!(!wd.observe_captcha_prompt(Instant::now()));
		tokio::time::advance(Duration::from_secs(3)).await;
		assert!(wd.observe_captcha_prompt(Instant::now()), "focus gap elapsed");
	}
}
