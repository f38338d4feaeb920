use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use super::*;
use crate::browser::{BrowserLease, BrowserProvider, LaunchSpec, PageDriver, PageEvent};
use crate::error::{MonitorError, Result};

struct FakeDriver {
	reloads: AtomicUsize,
	fronts: AtomicUsize,
	screenshots: AtomicUsize,
	scripts: std::sync::Mutex<Vec<String>>,
	events: broadcast::Sender<PageEvent>,
	closed: AtomicBool,
}

impl FakeDriver {
	fn new() -> Arc<Self> {
		let (events, _) = broadcast::channel(16);
		Arc::new(Self {
			reloads: AtomicUsize::new(0),
			fronts: AtomicUsize::new(0),
			screenshots: AtomicUsize::new(0),
			scripts: std::sync::Mutex::new(Vec::new()),
			events,
			closed: AtomicBool::new(false),
		})
	}

	fn reloads(&self) -> usize {
		self.reloads.load(Ordering::SeqCst)
	}

	fn fronts(&self) -> usize {
		self.fronts.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl PageDriver for FakeDriver {
	async fn navigate(&self, _url: &str) -> Result<()> {
		Ok(())
	}

	async fn evaluate(&self, script: &str) -> Result<Value> {
		self.scripts.lock().expect("scripts lock").push(script.to_string());
		Ok(Value::Bool(true))
	}

	async fn bring_to_front(&self) -> Result<()> {
		self.fronts.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn reload(&self) -> Result<()> {
		self.reloads.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn screenshot_to(&self, _path: &Path) -> Result<()> {
		self.screenshots.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	fn events(&self) -> broadcast::Receiver<PageEvent> {
		self.events.subscribe()
	}

	async fn close(&self) -> Result<()> {
		self.closed.store(true, Ordering::SeqCst);
		Ok(())
	}
}

struct FakeProvider(Arc<FakeDriver>);

#[async_trait]
impl BrowserProvider for FakeProvider {
	async fn launch(&self, _spec: &LaunchSpec) -> Result<BrowserLease> {
		Ok(BrowserLease { page: self.0.clone(), fingerprint: None })
	}
}

const WINDOW: Duration = Duration::from_secs(60);

async fn session_with_fake() -> (QueueSession, Arc<FakeDriver>, broadcast::Receiver<MonitorEvent>, tempfile::TempDir) {
	let tmp = tempfile::TempDir::new().expect("temp dir should be created");
	let driver = FakeDriver::new();
	let (events, rx) = broadcast::channel(256);
	let session = QueueSession::new(
		SessionConfig {
			id: "queue-test".into(),
			label: "Queue 1".into(),
			queue_url: "https://queue.example/wait?queue=main".into(),
			source_url: None,
			auto_reload: WINDOW,
			profile_dir: tmp.path().join("profile"),
			screenshot_path: tmp.path().join("shots/queue-test.png"),
		},
		Arc::new(FakeProvider(driver.clone())),
		Arc::new(TextMatchers::default()),
		events,
	)
	.expect("session should be created");
	*session.inner.driver.write().await = Some(driver.clone());
	(session, driver, rx, tmp)
}

fn snap(info: Value) -> PollSnapshot {
	PollSnapshot {
		admission_info: Some(serde_json::from_value(info).expect("admission info should parse")),
		timestamp: Some(1),
		..PollSnapshot::default()
	}
}

fn drain(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
	let mut drained = Vec::new();
	while let Ok(event) = rx.try_recv() {
		drained.push(event);
	}
	drained
}

#[tokio::test(start_paused = true)]
async fn closed_queue_reloads_exactly_once_per_window() {
	let (session, driver, _rx, _tmp) = session_with_fake().await;
	let closed = json!({ "genAT": "false" });

	session.inner.apply_snapshot(snap(closed.clone())).await;
	assert_eq!(session.state().await.status, SessionStatus::Waiting);
	assert_eq!(driver.reloads(), 0, "first observation only opens the window");

	tokio::time::advance(WINDOW).await;
	session.inner.apply_snapshot(snap(closed.clone())).await;
	assert_eq!(driver.reloads(), 1);
	let state = session.state().await;
	assert_eq!(state.status, SessionStatus::Waiting);
	assert_eq!(state.message, "auto reload triggered (queue closed)");

	// Polls keep hitting the watchdog inside the next window.
	for _ in 0..4 {
		tokio::time::advance(Duration::from_secs(5)).await;
		session.inner.apply_snapshot(snap(closed.clone())).await;
	}
	assert_eq!(driver.reloads(), 1, "no second reload within the window");
}

#[tokio::test(start_paused = true)]
async fn captcha_suppresses_auto_reload_regardless_of_wait() {
	let (session, driver, _rx, _tmp) = session_with_fake().await;
	let mut snapshot = snap(json!({ "genAT": "false" }));
	snapshot.captcha_visible = true;

	session.inner.apply_snapshot(snapshot.clone()).await;
	tokio::time::advance(WINDOW * 3).await;
	session.inner.apply_snapshot(snapshot).await;
	assert_eq!(driver.reloads(), 0);
}

#[tokio::test(start_paused = true)]
async fn concrete_wait_time_suppresses_auto_reload() {
	let (session, driver, _rx, _tmp) = session_with_fake().await;
	let promising = json!({ "genAT": "false", "waitingTime": "300" });

	session.inner.apply_snapshot(snap(promising.clone())).await;
	tokio::time::advance(WINDOW * 2).await;
	session.inner.apply_snapshot(snap(promising)).await;
	assert_eq!(driver.reloads(), 0, "a concrete wait means the queue promises progress");
	assert_eq!(session.state().await.status, SessionStatus::Waiting);
}

#[tokio::test(start_paused = true)]
async fn captcha_requirement_transitions_and_focuses_once() {
	let (session, driver, _rx, _tmp) = session_with_fake().await;

	session.inner.apply_snapshot(snap(json!({ "genAT": "true", "canEnter": "false" }))).await;
	assert_eq!(session.state().await.status, SessionStatus::Running);
	assert_eq!(driver.fronts(), 0);

	session.inner.apply_snapshot(snap(json!({ "needCaptcha": "true" }))).await;
	let state = session.state().await;
	assert_eq!(state.status, SessionStatus::Captcha);
	assert_eq!(state.message, "captcha required");
	assert_eq!(driver.fronts(), 1);
}

#[tokio::test(start_paused = true)]
async fn maintenance_banner_reloads_once_within_cooldown() {
	let (session, driver, _rx, _tmp) = session_with_fake().await;
	let mut snapshot = snap(json!({ "genAT": "false" }));
	snapshot.status_message = Some("We are currently performing scheduled maintenance".into());

	session.inner.apply_snapshot(snapshot.clone()).await;
	assert_eq!(driver.reloads(), 1);
	assert_eq!(session.state().await.message, "maintenance banner detected, refreshing");

	tokio::time::advance(Duration::from_secs(5)).await;
	session.inner.apply_snapshot(snapshot).await;
	assert_eq!(driver.reloads(), 1, "second poll lands inside the cooldown");
	let state = session.state().await;
	assert_eq!(state.status, SessionStatus::Waiting);
	assert_eq!(state.message, "maintenance banner detected, waiting to retry");
}

#[tokio::test(start_paused = true)]
async fn disabling_auto_reload_suppresses_and_resets_the_window() {
	let (session, driver, _rx, _tmp) = session_with_fake().await;
	let closed = json!({ "genAT": "false" });

	session.inner.apply_snapshot(snap(closed.clone())).await;
	tokio::time::advance(Duration::from_secs(45)).await;
	session.set_auto_reload_enabled(false).await;

	tokio::time::advance(WINDOW).await;
	session.inner.apply_snapshot(snap(closed.clone())).await;
	assert_eq!(driver.reloads(), 0, "disabled flag wins over elapsed time");

	session.set_auto_reload_enabled(true).await;
	session.inner.apply_snapshot(snap(closed.clone())).await;
	assert_eq!(driver.reloads(), 0, "re-enable starts a fresh window");
	tokio::time::advance(WINDOW).await;
	session.inner.apply_snapshot(snap(closed)).await;
	assert_eq!(driver.reloads(), 1);
}

#[tokio::test(start_paused = true)]
async fn global_flag_mirrors_into_state_and_reemits_once() {
	let (session, _driver, mut rx, _tmp) = session_with_fake().await;
	drain(&mut rx);

	session.set_global_auto_reload(false).await;
	let emitted = drain(&mut rx);
	assert_eq!(emitted.len(), 1, "one re-emission per effective toggle");
	let MonitorEvent::State(snapshot) = &emitted[0] else {
		panic!("expected a state event");
	};
	assert!(!snapshot.state.global_auto_reload_enabled);
	assert!(snapshot.state.auto_reload_enabled, "session flag untouched");

	session.set_global_auto_reload(false).await;
	assert!(drain(&mut rx).is_empty(), "unchanged toggle is a no-op");
}

#[tokio::test(start_paused = true)]
async fn no_admission_signal_makes_no_transition() {
	let (session, driver, _rx, _tmp) = session_with_fake().await;

	session.inner.apply_snapshot(PollSnapshot::default()).await;
	let state = session.state().await;
	assert_eq!(state.status, SessionStatus::Idle);
	assert_eq!(state.message, "waiting to launch");
	assert_eq!(driver.reloads(), 0);
}

#[tokio::test(start_paused = true)]
async fn captcha_image_is_diffed_not_restamped() {
	let (session, _driver, _rx, _tmp) = session_with_fake().await;

	let mut first = PollSnapshot::default();
	first.captcha_visible = true;
	first.captcha_data_url = Some("data:image/png;base64,AAA".into());
	first.timestamp = Some(10);
	session.inner.apply_snapshot(first.clone()).await;
	let state = session.state().await;
	assert_eq!(state.captcha_image.as_deref(), Some("data:image/png;base64,AAA"));
	assert_eq!(state.captcha_updated_at, Some(10));

	let mut same = first.clone();
	same.timestamp = Some(20);
	session.inner.apply_snapshot(same).await;
	assert_eq!(session.state().await.captcha_updated_at, Some(10), "identical image keeps its stamp");

	let mut changed = first.clone();
	changed.captcha_data_url = Some("data:image/png;base64,BBB".into());
	changed.timestamp = Some(30);
	session.inner.apply_snapshot(changed).await;
	assert_eq!(session.state().await.captcha_updated_at, Some(30));

	session.inner.apply_snapshot(PollSnapshot::default()).await;
	let state = session.state().await;
	assert_eq!(state.captcha_image, None, "hidden captcha clears the stored image");
	assert_eq!(state.captcha_updated_at, None);
}

#[tokio::test(start_paused = true)]
async fn poll_snapshot_merges_observed_fields() {
	let (session, _driver, _rx, _tmp) = session_with_fake().await;

	let mut snapshot = snap(json!({ "genAT": "true", "canEnter": "false" }));
	snapshot.url = Some("https://queue.example/wait".into());
	snapshot.countdown_text = Some("02:31".into());
	snapshot.queue_position = Some("1042".into());
	snapshot.info_banner = Some("high demand".into());
	snapshot.title = Some("Waiting room".into());
	session.inner.apply_snapshot(snapshot).await;

	let state = session.state().await;
	assert_eq!(state.current_url.as_deref(), Some("https://queue.example/wait"));
	assert_eq!(state.countdown_text.as_deref(), Some("02:31"));
	assert_eq!(state.queue_position.as_deref(), Some("1042"));
	assert_eq!(state.info_banner.as_deref(), Some("high demand"));
	assert_eq!(state.page_title.as_deref(), Some("Waiting room"));
	assert_eq!(state.last_updated, Some(1));
	assert_eq!(state.status, SessionStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn submit_captcha_rejects_blank_answers() {
	let (session, driver, _rx, _tmp) = session_with_fake().await;

	for blank in ["", "   ", "\t\n"] {
		let err = session.submit_captcha(blank).await.expect_err("blank answer must fail");
		assert!(matches!(err, MonitorError::InvalidInput(_)), "got {err}");
	}
	assert!(driver.scripts.lock().expect("scripts lock").is_empty());
}

#[tokio::test(start_paused = true)]
async fn submit_captcha_injects_trimmed_answer_and_stamps_time() {
	let (session, driver, _rx, _tmp) = session_with_fake().await;

	session.submit_captcha("  ab12  ").await.expect("submission should succeed");
	let scripts = driver.scripts.lock().expect("scripts lock").clone();
	assert!(scripts.iter().any(|s| s.contains(r#"input.value = "ab12";"#)));
	let state = session.state().await;
	assert_eq!(state.message, "captcha answer submitted from dashboard");
	assert!(state.last_captcha_submission.is_some());
}

#[tokio::test(start_paused = true)]
async fn captcha_actions_fail_without_a_page() {
	let (session, _driver, _rx, _tmp) = session_with_fake().await;
	*session.inner.driver.write().await = None;

	assert!(matches!(session.submit_captcha("x").await, Err(MonitorError::PageUnavailable)));
	assert!(matches!(session.refresh_captcha().await, Err(MonitorError::PageUnavailable)));
	assert!(matches!(session.reload().await, Err(MonitorError::PageUnavailable)));
}

#[tokio::test(start_paused = true)]
async fn external_close_is_terminal() {
	let (session, driver, _rx, _tmp) = session_with_fake().await;
	let events = driver.events.subscribe();
	let loop_task = tokio::spawn(session.inner.clone().event_loop(events));

	driver.events.send(PageEvent::Closed).expect("event should be delivered");
	loop_task.await.expect("event loop should exit cleanly");

	let state = session.state().await;
	assert_eq!(state.status, SessionStatus::Stopped);
	assert_eq!(state.message, "browser window closed by user");
	assert!(session.inner.stopped());
}

#[tokio::test(start_paused = true)]
async fn controller_payload_updates_admission_info_out_of_band() {
	let (session, _driver, _rx, _tmp) = session_with_fake().await;

	let body = r#"{"admissionInfo": {"genAT": "true", "canEnter": "true"}}"#;
	session.inner.handle_controller_payload(body).await;
	let state = session.state().await;
	let info = state.admission_info.expect("admission info should be set");
	assert!(info.can_enter());
	assert!(state.last_response.is_some());

	session.inner.handle_controller_payload("not json at all").await;
	assert!(session.state().await.admission_info.is_some(), "garbage is ignored");
}

#[test]
fn target_url_appends_source_only_when_missing() {
	assert_eq!(
		target_url("https://q.example/wait?queue=a", Some("https://shop.example")),
		"https://q.example/wait?queue=a&source=https%3A%2F%2Fshop.example"
	);
	assert_eq!(
		target_url("https://q.example/wait?source=x", Some("https://shop.example")),
		"https://q.example/wait?source=x"
	);
	assert_eq!(target_url("https://q.example/wait", None), "https://q.example/wait");
}
