//! Session orchestrator: owns the collection, mints identities, propagates
//! the process-wide auto-reload policy.
//!
//! Every session created here emits into one shared broadcast channel, so
//! dashboard observers subscribe once and see every session's state changes
//! plus settings changes; a dropped receiver tears its subscription down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{RwLock, broadcast};
use tracing::info;
use uuid::Uuid;

use crate::browser::BrowserProvider;
use crate::config::{DEFAULT_AUTO_RELOAD, DataDirs, clamp_auto_reload};
use crate::error::{MonitorError, Result};
use crate::session::{GlobalSettings, MonitorEvent, QueueSession, SessionConfig, SessionSnapshot, SessionState};
use crate::signals::TextMatchers;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Caller-supplied configuration for one new session.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
	#[serde(default)]
	pub id: Option<String>,
	#[serde(default)]
	pub queue_url: String,
	#[serde(default)]
	pub label: Option<String>,
	#[serde(default)]
	pub source_url: Option<String>,
	#[serde(default)]
	pub auto_reload_ms: Option<u64>,
}

/// Orchestrator-wide defaults applied when a creation request leaves them out.
#[derive(Clone)]
pub struct ManagerConfig {
	/// Watchdog window for sessions that do not request their own.
	pub default_auto_reload: Duration,
	/// Phrase predicates shared by every session.
	pub matchers: Arc<TextMatchers>,
}

impl Default for ManagerConfig {
	fn default() -> Self {
		Self {
			default_auto_reload: DEFAULT_AUTO_RELOAD,
			matchers: Arc::new(TextMatchers::default()),
		}
	}
}

/// Owns the session map and the global auto-reload flag.
#[derive(Clone)]
pub struct SessionManager {
	inner: Arc<ManagerInner>,
}

struct ManagerInner {
	dirs: DataDirs,
	provider: Arc<dyn BrowserProvider>,
	config: ManagerConfig,
	/// Insertion-ordered so `list()` and positional labels stay stable.
	sessions: RwLock<Vec<QueueSession>>,
	global_auto_reload: AtomicBool,
	events: broadcast::Sender<MonitorEvent>,
}

impl SessionManager {
	pub fn new(dirs: DataDirs, provider: Arc<dyn BrowserProvider>, config: ManagerConfig) -> Self {
		let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		Self {
			inner: Arc::new(ManagerInner {
				dirs,
				provider,
				config,
				sessions: RwLock::new(Vec::new()),
				global_auto_reload: AtomicBool::new(true),
				events,
			}),
		}
	}

	/// Subscribes to the fan-out of state and settings events.
	pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
		self.inner.events.subscribe()
	}

	/// Current process-wide policy.
	pub fn settings(&self) -> GlobalSettings {
		GlobalSettings {
			auto_reload_enabled: self.inner.global_auto_reload.load(Ordering::SeqCst),
		}
	}

	/// Creates and registers one session, optionally starting it.
	///
	/// Rejects an empty queue URL and an id that is already registered; a
	/// rejected creation leaves existing sessions untouched.
	pub async fn create(&self, request: CreateSessionRequest, auto_start: bool) -> Result<SessionSnapshot> {
		let queue_url = request.queue_url.trim().to_string();
		if queue_url.is_empty() {
			return Err(MonitorError::InvalidInput("queueUrl is required".into()));
		}
		let id = match request.id {
			Some(id) if !id.trim().is_empty() => id.trim().to_string(),
			_ => generate_id(&queue_url),
		};

		let session = {
			let mut sessions = self.inner.sessions.write().await;
			if sessions.iter().any(|s| s.id() == id) {
				return Err(MonitorError::InvalidInput(format!("session with id {id} already exists")));
			}
			let label = request
				.label
				.filter(|label| !label.trim().is_empty())
				.unwrap_or_else(|| format!("Queue {}", sessions.len() + 1));
			let auto_reload = clamp_auto_reload(
				request
					.auto_reload_ms
					.map(Duration::from_millis)
					.or(Some(self.inner.config.default_auto_reload)),
			);
			let session = QueueSession::new(
				SessionConfig {
					id: id.clone(),
					label,
					queue_url,
					source_url: request.source_url,
					auto_reload,
					profile_dir: self.inner.dirs.profile_dir(&id),
					screenshot_path: self.inner.dirs.screenshot_path(&id),
				},
				self.inner.provider.clone(),
				self.inner.config.matchers.clone(),
				self.inner.events.clone(),
			)?;
			sessions.push(session.clone());
			session
		};

		// The new session mirrors the current global policy before anyone
		// can observe it.
		session
			.set_global_auto_reload(self.inner.global_auto_reload.load(Ordering::SeqCst))
			.await;
		if auto_start {
			session.start().await;
		}
		info!(target = "qmon.manager", id = %session.id(), label = %session.label(), "session created");
		Ok(session.snapshot().await)
	}

	/// Creates `count` sessions from one request, numbering the labels when
	/// more than one is asked for. Stops at the first failure; sessions
	/// created before it stay registered.
	pub async fn create_many(&self, request: CreateSessionRequest, count: u32, auto_start: bool) -> Result<Vec<SessionSnapshot>> {
		let count = count.max(1);
		let mut created = Vec::with_capacity(count as usize);
		for index in 0..count {
			let mut request = request.clone();
			if count > 1 {
				let base = request.label.as_deref().unwrap_or("Queue");
				request.label = Some(format!("{base} #{}", index + 1));
				request.id = None;
			}
			created.push(self.create(request, auto_start).await?);
		}
		Ok(created)
	}

	/// Snapshot of every registered session, in creation order.
	pub async fn list(&self) -> Vec<SessionSnapshot> {
		let sessions = self.inner.sessions.read().await.clone();
		let mut snapshots = Vec::with_capacity(sessions.len());
		for session in sessions {
			snapshots.push(session.snapshot().await);
		}
		snapshots
	}

	async fn session(&self, id: &str) -> Result<QueueSession> {
		self.inner
			.sessions
			.read()
			.await
			.iter()
			.find(|s| s.id() == id)
			.cloned()
			.ok_or_else(|| MonitorError::SessionNotFound(id.to_string()))
	}

	pub async fn bring_to_front(&self, id: &str) -> Result<SessionState> {
		let session = self.session(id).await?;
		session.bring_to_front().await?;
		Ok(session.state().await)
	}

	pub async fn reload(&self, id: &str) -> Result<SessionState> {
		let session = self.session(id).await?;
		session.reload().await?;
		Ok(session.state().await)
	}

	pub async fn screenshot(&self, id: &str) -> Result<SessionState> {
		let session = self.session(id).await?;
		session.capture_screenshot().await?;
		Ok(session.state().await)
	}

	pub async fn submit_captcha(&self, id: &str, answer: &str) -> Result<SessionState> {
		let session = self.session(id).await?;
		session.submit_captcha(answer).await?;
		Ok(session.state().await)
	}

	pub async fn refresh_captcha(&self, id: &str) -> Result<SessionState> {
		let session = self.session(id).await?;
		session.refresh_captcha().await?;
		Ok(session.state().await)
	}

	pub async fn set_session_auto_reload(&self, id: &str, enabled: bool) -> Result<SessionState> {
		let session = self.session(id).await?;
		session.set_auto_reload_enabled(enabled).await;
		Ok(session.state().await)
	}

	/// Latest screenshot file for a session, if one has been captured.
	pub async fn screenshot_file(&self, id: &str) -> Result<Option<std::path::PathBuf>> {
		let session = self.session(id).await?;
		Ok(session.state().await.screenshot_path)
	}

	/// Stops a session and removes it from the registry.
	pub async fn dispose(&self, id: &str) -> Result<()> {
		let session = self.session(id).await?;
		session.dispose().await;
		self.inner.sessions.write().await.retain(|s| s.id() != id);
		Ok(())
	}

	/// Single writer entry point for the global flag: stores it, pushes the
	/// mirror into every session (each re-emits its own state), then emits
	/// one settings event.
	pub async fn set_global_auto_reload(&self, enabled: bool) -> GlobalSettings {
		self.inner.global_auto_reload.store(enabled, Ordering::SeqCst);
		let sessions = self.inner.sessions.read().await.clone();
		for session in sessions {
			session.set_global_auto_reload(enabled).await;
		}
		let settings = self.settings();
		let _ = self.inner.events.send(MonitorEvent::Settings(settings));
		info!(target = "qmon.manager", %enabled, "global auto-reload updated");
		settings
	}
}

/// Derives a stable id from the queue URL's `queue=` parameter (falling back
/// to `session`) plus a short random suffix, sanitized for filesystem use.
fn generate_id(queue_url: &str) -> String {
	let slug = queue_url
		.rsplit("queue=")
		.next()
		.and_then(|tail| tail.split('&').next())
		.unwrap_or("session");
	let slug: String = slug
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
		.collect();
	let slug = slug.trim_matches('-');
	let slug = if slug.is_empty() { "session" } else { slug };
	let suffix = Uuid::new_v4().simple().to_string();
	format!("{slug}-{}", &suffix[..8])
}
