//! One supervised admission attempt: launch, poll, classify, react.
//!
//! A session exclusively owns its page capability and its timers. Polled
//! page signals are reconciled into a [`SessionStatus`] by the pure
//! [`watchdog`] policy; this module owns the side effects (reload, focus,
//! screenshot) and the failure confinement: nothing a session does can take
//! down its siblings or the process.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{BrowserProvider, LaunchSpec, PageDriver, PageEvent};
use crate::config::{
	CRASH_RESTART_DELAY, MAX_LAUNCH_FAILURES, SCREENSHOT_INTERVAL, STATE_POLL_INTERVAL,
};
use crate::error::{MonitorError, Result};
use crate::signals::{AdmissionInfo, PollSnapshot, TextMatchers, parse_controller_payload};

pub mod script;
pub mod state;
pub mod watchdog;

pub use state::{GlobalSettings, MonitorEvent, SessionSnapshot, SessionState, SessionStatus};
pub use watchdog::Phase;

use script::{FOCUS_SCRIPT, POLL_SCRIPT, REFRESH_CAPTCHA_SCRIPT, submit_captcha_script};
use watchdog::{Watchdog, classify};

/// Delay step for linear launch-retry backoff.
const LAUNCH_RETRY_STEP: Duration = Duration::from_secs(5);

/// Static configuration of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
	pub id: String,
	pub label: String,
	pub queue_url: String,
	pub source_url: Option<String>,
	/// Watchdog window; already clamped to the configured floor.
	pub auto_reload: Duration,
	pub profile_dir: PathBuf,
	pub screenshot_path: PathBuf,
}

/// Handle to one supervised queue session.
#[derive(Clone)]
pub struct QueueSession {
	inner: Arc<Inner>,
}

struct Inner {
	config: SessionConfig,
	provider: Arc<dyn BrowserProvider>,
	matchers: Arc<TextMatchers>,
	events: broadcast::Sender<MonitorEvent>,
	state: RwLock<SessionState>,
	driver: RwLock<Option<Arc<dyn PageDriver>>>,
	/// Single-flight gate: poll, screenshot and manual page operations on
	/// this session never run concurrently against the page.
	page_gate: Mutex<()>,
	watchdog: Mutex<Watchdog>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	auto_reload_enabled: AtomicBool,
	global_auto_reload_enabled: AtomicBool,
	failures: AtomicU32,
	stopped: AtomicBool,
}

impl QueueSession {
	/// Creates an idle session and its on-disk directories.
	pub fn new(
		config: SessionConfig,
		provider: Arc<dyn BrowserProvider>,
		matchers: Arc<TextMatchers>,
		events: broadcast::Sender<MonitorEvent>,
	) -> Result<Self> {
		std::fs::create_dir_all(&config.profile_dir)?;
		if let Some(parent) = config.screenshot_path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		Ok(Self {
			inner: Arc::new(Inner {
				config,
				provider,
				matchers,
				events,
				state: RwLock::new(SessionState::default()),
				driver: RwLock::new(None),
				page_gate: Mutex::new(()),
				watchdog: Mutex::new(Watchdog::default()),
				tasks: Mutex::new(Vec::new()),
				auto_reload_enabled: AtomicBool::new(true),
				global_auto_reload_enabled: AtomicBool::new(true),
				failures: AtomicU32::new(0),
				stopped: AtomicBool::new(false),
			}),
		})
	}

	pub fn id(&self) -> &str {
		&self.inner.config.id
	}

	pub fn label(&self) -> &str {
		&self.inner.config.label
	}

	/// Current observed state, as last reconciled.
	pub async fn state(&self) -> SessionState {
		self.inner.state.read().await.clone()
	}

	pub async fn snapshot(&self) -> SessionSnapshot {
		self.inner.snapshot().await
	}

	/// Launches the session in the background; retries with linear backoff
	/// up to the configured attempt bound.
	pub async fn start(&self) {
		let handle = tokio::spawn(self.inner.clone().run_launch());
		self.inner.tasks.lock().await.push(handle);
	}

	/// Focuses the page window.
	pub async fn bring_to_front(&self) -> Result<()> {
		self.inner.focus_page().await
	}

	/// Forces a page reload and records it.
	pub async fn reload(&self) -> Result<()> {
		self.inner.reload_page("manual reload triggered").await
	}

	/// Captures one full-page screenshot into the session's slot.
	pub async fn capture_screenshot(&self) -> Result<()> {
		self.inner.capture_screenshot().await
	}

	/// Injects a captcha answer into the page and submits it.
	pub async fn submit_captcha(&self, answer: &str) -> Result<()> {
		self.inner.submit_captcha(answer).await
	}

	/// Asks the page for a fresh captcha image.
	pub async fn refresh_captcha(&self) -> Result<()> {
		self.inner.refresh_captcha().await
	}

	/// Per-session auto-reload toggle. Disabling resets the wait window.
	pub async fn set_auto_reload_enabled(&self, enabled: bool) {
		self.inner.set_flag(&self.inner.auto_reload_enabled, enabled).await;
	}

	/// Mirror of the process-wide flag, pushed down by the orchestrator.
	pub async fn set_global_auto_reload(&self, enabled: bool) {
		self.inner.set_flag(&self.inner.global_auto_reload_enabled, enabled).await;
	}

	/// Stops timers and closes the page. Terminal.
	pub async fn dispose(&self) {
		self.inner.shutdown("session disposed").await;
	}
}

impl Inner {
	fn stopped(&self) -> bool {
		self.stopped.load(Ordering::SeqCst)
	}

	fn auto_reload_active(&self) -> bool {
		// Session AND global; both default to enabled.
		self.auto_reload_enabled.load(Ordering::SeqCst) && self.global_auto_reload_enabled.load(Ordering::SeqCst)
	}

	async fn snapshot(&self) -> SessionSnapshot {
		SessionSnapshot {
			id: self.config.id.clone(),
			label: self.config.label.clone(),
			state: self.state.read().await.clone(),
		}
	}

	/// Applies a state patch, re-stamps the mirrored policy flags and emits
	/// exactly one full-snapshot event.
	async fn update_state(&self, patch: impl FnOnce(&mut SessionState)) {
		let state = {
			let mut state = self.state.write().await;
			patch(&mut state);
			state.auto_reload_enabled = self.auto_reload_enabled.load(Ordering::SeqCst);
			state.global_auto_reload_enabled = self.global_auto_reload_enabled.load(Ordering::SeqCst);
			state.clone()
		};
		let _ = self.events.send(MonitorEvent::State(SessionSnapshot {
			id: self.config.id.clone(),
			label: self.config.label.clone(),
			state,
		}));
	}

	async fn set_status(&self, status: SessionStatus, message: impl Into<String>) {
		let message = message.into();
		self.update_state(|s| {
			s.status = status;
			s.message = message;
		})
		.await;
	}

	async fn set_flag(&self, flag: &AtomicBool, enabled: bool) {
		if flag.swap(enabled, Ordering::SeqCst) == enabled {
			return;
		}
		if !enabled {
			self.watchdog.lock().await.reset_waiting();
		}
		// Re-emit so observers see the mirrored flag change.
		self.update_state(|_| {}).await;
	}

	async fn driver(&self) -> Option<Arc<dyn PageDriver>> {
		let driver = self.driver.read().await.clone()?;
		if driver.is_closed() { None } else { Some(driver) }
	}

	async fn require_driver(&self) -> Result<Arc<dyn PageDriver>> {
		self.driver().await.ok_or(MonitorError::PageUnavailable)
	}

	// ---- launch & lifecycle -------------------------------------------------

	// Boxed return type breaks the recursive `Send` cycle through
	// `restart_after_crash`, which awaits a relaunch.
	fn run_launch(self: Arc<Self>) -> futures::future::BoxFuture<'static, ()> {
		Box::pin(async move {
			loop {
				if self.stopped() {
					return;
				}
				match self.try_launch().await {
					Ok(()) => {
						self.failures.store(0, Ordering::SeqCst);
						return;
					}
					Err(err) => {
						let attempt = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
						warn!(target = "qmon.session", id = %self.config.id, %attempt, error = %err, "launch failed");
						self.teardown_page().await;
						self.set_status(SessionStatus::Error, format!("failed to start ({attempt}): {err}")).await;
						if attempt >= MAX_LAUNCH_FAILURES {
							warn!(target = "qmon.session", id = %self.config.id, "giving up after repeated launch failures");
							return;
						}
						tokio::time::sleep(LAUNCH_RETRY_STEP * attempt).await;
					}
				}
			}
		})
	}

	async fn try_launch(self: &Arc<Self>) -> Result<()> {
		self.set_status(SessionStatus::Launching, "starting browser").await;

		let spec = LaunchSpec::new(self.config.profile_dir.clone());
		let lease = self.provider.launch(&spec).await?;
		let driver = lease.page.clone();
		*self.driver.write().await = Some(driver.clone());
		self.update_state(|s| {
			s.fingerprint_active = lease.fingerprint.is_some();
			s.fingerprint_info = lease.fingerprint.clone();
		})
		.await;

		let events = driver.events();
		let event_task = tokio::spawn(self.clone().event_loop(events));
		self.tasks.lock().await.push(event_task);

		let target = target_url(&self.config.queue_url, self.config.source_url.as_deref());
		driver.navigate(&target).await?;
		let _ = driver.bring_to_front().await;

		let poll_task = tokio::spawn(self.clone().poll_loop());
		let shot_task = tokio::spawn(self.clone().screenshot_loop());
		{
			let mut tasks = self.tasks.lock().await;
			tasks.push(poll_task);
			tasks.push(shot_task);
		}

		info!(target = "qmon.session", id = %self.config.id, url = %target, "queue session active");
		self.set_status(SessionStatus::Running, "queue session active").await;
		Ok(())
	}

	/// Aborts timers and drops the page without marking the session stopped.
	async fn teardown_page(&self) {
		let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
		if let Some(driver) = self.driver.write().await.take() {
			let _ = driver.close().await;
		}
		// May abort the calling task; must come last.
		for task in &tasks {
			task.abort();
		}
	}

	/// Terminal shutdown: idempotent, stops timers, closes the page.
	async fn shutdown(&self, message: &str) {
		if self.stopped.swap(true, Ordering::SeqCst) {
			return;
		}
		if let Some(driver) = self.driver.write().await.take() {
			let _ = driver.close().await;
		}
		self.set_status(SessionStatus::Stopped, message).await;
		let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
		for task in &tasks {
			task.abort();
		}
	}

	async fn event_loop(self: Arc<Self>, mut events: broadcast::Receiver<PageEvent>) {
		loop {
			match events.recv().await {
				Ok(PageEvent::Closed) => {
					info!(target = "qmon.session", id = %self.config.id, "browser window closed externally");
					self.shutdown("browser window closed by user").await;
					return;
				}
				Ok(PageEvent::Crashed) => {
					warn!(target = "qmon.session", id = %self.config.id, "browser tab crashed");
					self.set_status(SessionStatus::Error, "browser tab crashed").await;
					let inner = self.clone();
					// Detached on purpose: teardown below aborts this task.
					tokio::spawn(async move { inner.restart_after_crash().await });
					return;
				}
				Ok(PageEvent::Dialog) => {
					debug!(target = "qmon.session", id = %self.config.id, "page dialog dismissed");
				}
				Ok(PageEvent::ControllerResponse(body)) => {
					self.handle_controller_payload(&body).await;
				}
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					debug!(target = "qmon.session", id = %self.config.id, %skipped, "page events lagged");
				}
				Err(broadcast::error::RecvError::Closed) => return,
			}
		}
	}

	/// A crash is assumed transient: full teardown, fixed delay, relaunch.
	async fn restart_after_crash(self: Arc<Self>) {
		self.teardown_page().await;
		tokio::time::sleep(CRASH_RESTART_DELAY).await;
		if self.stopped() {
			return;
		}
		self.clone().run_launch().await;
	}

	// ---- polling -------------------------------------------------------------

	async fn poll_loop(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(STATE_POLL_INTERVAL);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			if self.stopped() {
				return;
			}
			if let Err(err) = self.poll_once().await {
				self.set_status(SessionStatus::Warning, format!("state poll failed: {err}")).await;
			}
		}
	}

	async fn poll_once(&self) -> Result<()> {
		let Some(driver) = self.driver().await else {
			return Ok(());
		};
		let value = {
			let _gate = self.page_gate.lock().await;
			driver.evaluate(POLL_SCRIPT).await?
		};
		let snapshot: PollSnapshot = serde_json::from_value(value)?;
		self.apply_snapshot(snapshot).await;
		Ok(())
	}

	/// Merges one poll observation into the session state, diffs the captcha
	/// image, and runs stall detection.
	async fn apply_snapshot(&self, snapshot: PollSnapshot) {
		self.update_state(|s| {
			s.admission_info = snapshot.admission_info.clone();
			s.queue_info = snapshot.queue_info.clone();
			s.queue_error = snapshot.queue_error.clone();
			s.countdown_text = snapshot.countdown_text.clone();
			s.queue_position = snapshot.queue_position.clone();
			s.captcha_required = snapshot.captcha_visible;
			if let Some(message) = &snapshot.status_message {
				s.message = message.clone();
			}
			s.info_banner = snapshot.info_banner.clone();
			s.page_title = snapshot.title.clone();
			s.last_updated = snapshot.timestamp;
			s.current_url = snapshot.url.clone();
		})
		.await;

		if snapshot.captcha_visible {
			if let Some(data_url) = snapshot.captcha_data_url {
				let changed = self.state.read().await.captcha_image.as_deref() != Some(data_url.as_str());
				if changed {
					self.update_state(|s| {
						s.captcha_image = Some(data_url);
						s.captcha_updated_at = snapshot.timestamp;
					})
					.await;
				}
			}
		} else if self.state.read().await.captcha_image.is_some() {
			self.update_state(|s| {
				s.captcha_image = None;
				s.captcha_updated_at = None;
			})
			.await;
		}

		self.detect_stalls().await;
	}

	// ---- stall detection -----------------------------------------------------

	/// Highest-priority condition wins; with no admission signal ever seen,
	/// the session stays in its current state.
	async fn detect_stalls(&self) {
		let (info, message, banner) = {
			let state = self.state.read().await;
			let Some(info) = state.admission_info.clone() else {
				return;
			};
			(info, state.message.clone(), state.info_banner.clone())
		};
		let texts = [Some(message.as_str()), banner.as_deref()];

		match classify(&info, &texts, &self.matchers) {
			Phase::Maintenance => self.handle_maintenance().await,
			Phase::CaptchaPrompt => {
				let refocus = self.watchdog.lock().await.observe_captcha_prompt(Instant::now());
				if refocus {
					let _ = self.focus_page().await;
				}
				self.update_state(|s| s.status = SessionStatus::Captcha).await;
			}
			Phase::CaptchaRequired => {
				self.watchdog.lock().await.observe_captcha_required(Instant::now());
				self.set_status(SessionStatus::Captcha, "captcha required").await;
				let _ = self.focus_page().await;
			}
			Phase::AdmissionReady => {
				self.watchdog.lock().await.reset_waiting();
				self.set_status(SessionStatus::Ready, "admission URL available, waiting for redirect").await;
			}
			Phase::QueueClosed => {
				self.set_status(SessionStatus::Waiting, "queue not open yet").await;
				self.maybe_auto_reload(&info).await;
			}
			Phase::CanEnter => {
				self.watchdog.lock().await.reset_waiting();
				self.set_status(SessionStatus::Ready, "queue ready, waiting for enter action").await;
			}
			Phase::InQueue => {
				self.watchdog.lock().await.reset_waiting();
				self.set_status(SessionStatus::Running, "in queue").await;
			}
		}
	}

	async fn handle_maintenance(&self) {
		if !self.auto_reload_active() {
			self.watchdog.lock().await.reset_waiting();
			self.update_state(|s| s.status = SessionStatus::Waiting).await;
			return;
		}
		let due = {
			let mut watchdog = self.watchdog.lock().await;
			watchdog.observe_maintenance(Instant::now(), self.config.auto_reload)
		};
		if !due {
			self.set_status(SessionStatus::Waiting, "maintenance banner detected, waiting to retry").await;
			return;
		}
		self.set_status(SessionStatus::Waiting, "maintenance banner detected, refreshing").await;
		if let Err(err) = self.reload_page("maintenance banner detected, refreshing").await {
			self.set_status(SessionStatus::Warning, format!("maintenance reload failed: {err}")).await;
		}
	}

	/// The auto-reload watchdog, reached only from the queue-closed branch.
	async fn maybe_auto_reload(&self, info: &AdmissionInfo) {
		if !self.auto_reload_active() {
			return;
		}
		let (captcha_required, message, banner) = {
			let state = self.state.read().await;
			(state.captcha_required, state.message.clone(), state.info_banner.clone())
		};
		if captcha_required || self.matchers.is_captcha_prompt(&[Some(message.as_str()), banner.as_deref()]) {
			return;
		}
		let due = {
			let mut watchdog = self.watchdog.lock().await;
			if info.concrete_wait() {
				// The queue promises progress; a forced reload would only
				// lose our place.
				watchdog.reset_waiting();
				return;
			}
			watchdog.observe_idle(Instant::now(), self.config.auto_reload)
		};
		if !due {
			return;
		}
		info!(target = "qmon.session", id = %self.config.id, "auto reload triggered (queue closed)");
		self.set_status(SessionStatus::Waiting, "queue closed, refreshing to retry").await;
		if let Err(err) = self.reload_page("auto reload triggered (queue closed)").await {
			self.set_status(SessionStatus::Warning, format!("auto-reload failed: {err}")).await;
		}
	}

	// ---- page side effects -----------------------------------------------------

	async fn focus_page(&self) -> Result<()> {
		let driver = self.require_driver().await?;
		let _gate = self.page_gate.lock().await;
		driver.bring_to_front().await?;
		let _ = driver.evaluate(FOCUS_SCRIPT).await;
		Ok(())
	}

	async fn reload_page(&self, message: &str) -> Result<()> {
		let driver = self.require_driver().await?;
		{
			let _gate = self.page_gate.lock().await;
			driver.reload().await?;
		}
		let message = message.to_string();
		self.update_state(|s| s.message = message).await;
		Ok(())
	}

	async fn capture_screenshot(&self) -> Result<()> {
		let driver = self.require_driver().await?;
		{
			let _gate = self.page_gate.lock().await;
			driver.screenshot_to(&self.config.screenshot_path).await?;
		}
		let path = self.config.screenshot_path.clone();
		self.update_state(|s| s.screenshot_path = Some(path)).await;
		Ok(())
	}

	async fn screenshot_loop(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(SCREENSHOT_INTERVAL);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			if self.stopped() {
				return;
			}
			match self.capture_screenshot().await {
				Ok(()) | Err(MonitorError::PageUnavailable) => {}
				Err(err) => {
					self.set_status(SessionStatus::Warning, format!("screenshot failed: {err}")).await;
				}
			}
		}
	}

	async fn submit_captcha(&self, answer: &str) -> Result<()> {
		let answer = answer.trim();
		if answer.is_empty() {
			return Err(MonitorError::InvalidInput("captcha answer is required".into()));
		}
		let driver = self.require_driver().await?;
		{
			let _gate = self.page_gate.lock().await;
			driver.evaluate(&submit_captcha_script(answer)).await?;
		}
		self.update_state(|s| {
			s.message = "captcha answer submitted from dashboard".into();
			s.last_captcha_submission = Some(now_ms());
		})
		.await;
		Ok(())
	}

	async fn refresh_captcha(&self) -> Result<()> {
		let driver = self.require_driver().await?;
		{
			let _gate = self.page_gate.lock().await;
			driver.evaluate(REFRESH_CAPTCHA_SCRIPT).await?;
		}
		self.update_state(|s| s.message = "captcha refresh requested from dashboard".into()).await;
		Ok(())
	}

	/// Admission payloads can arrive on the network path ahead of the next
	/// poll; fold them into the observed state as they land.
	async fn handle_controller_payload(&self, body: &str) {
		let payload = parse_controller_payload(body);
		if payload.location.is_none() && payload.admission_info.is_none() {
			return;
		}
		self.update_state(|s| {
			if let Some(location) = payload.location {
				s.last_response = Some(json!({ "location": location }));
			}
			if let Some(raw) = payload.raw {
				s.last_response = Some(raw);
			}
			if let Some(info) = payload.admission_info {
				s.admission_info = Some(info);
			}
		})
		.await;
	}
}

/// Appends the source/referrer as a query parameter unless the queue URL
/// already carries one.
fn target_url(queue_url: &str, source_url: Option<&str>) -> String {
	let Some(source) = source_url else {
		return queue_url.to_string();
	};
	if queue_url.contains("source=") {
		return queue_url.to_string();
	}
	match Url::parse(queue_url) {
		Ok(mut url) => {
			url.query_pairs_mut().append_pair("source", source);
			url.to_string()
		}
		Err(_) => {
			let separator = if queue_url.contains('?') { '&' } else { '?' };
			format!("{queue_url}{separator}source={source}")
		}
	}
}

fn now_ms() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

#[cfg(test)]
mod tests;
