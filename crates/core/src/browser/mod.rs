//! Browser capability contract consumed by queue sessions.
//!
//! Sessions never talk to an engine directly; they hold a [`PageDriver`] and
//! acquire it through a [`BrowserProvider`]. The chromium implementation
//! lives in [`chromium`], the optional fingerprint-spoofing variant in
//! [`fingerprint`], and [`CapabilityBroker`] stitches the two together with
//! silent fallback.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::NAVIGATION_TIMEOUT;
use crate::error::Result;
use crate::signals::CONTROLLER_ENDPOINT;

pub mod chromium;
pub mod fingerprint;

pub use chromium::ChromiumProvider;
pub use fingerprint::FingerprintProvider;

/// Out-of-band page notifications a session subscribes to.
#[derive(Debug, Clone)]
pub enum PageEvent {
	/// The renderer crashed; the session must be relaunched.
	Crashed,
	/// The page was closed externally (for example by the operator).
	Closed,
	/// A JavaScript dialog appeared and was dismissed by the driver.
	Dialog,
	/// Body of a network response from the queue-controller endpoint.
	ControllerResponse(String),
}

/// Everything a session needs to launch one supervised page.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
	/// Persistent browser profile directory for this session.
	pub profile_dir: PathBuf,
	/// Viewport, width x height.
	pub viewport: (u32, u32),
	/// Extra engine arguments.
	pub args: Vec<String>,
	/// Upper bound for navigations and reloads.
	pub navigation_timeout: Duration,
	/// Substring filter selecting controller responses to surface.
	pub response_filter: String,
}

impl LaunchSpec {
	pub fn new(profile_dir: PathBuf) -> Self {
		Self {
			profile_dir,
			viewport: (1280, 720),
			args: vec!["--disable-blink-features=AutomationControlled".into()],
			navigation_timeout: NAVIGATION_TIMEOUT,
			response_filter: CONTROLLER_ENDPOINT.into(),
		}
	}
}

/// One controllable page plus whatever identity the provider attached.
pub struct BrowserLease {
	pub page: Arc<dyn PageDriver>,
	/// Fingerprint descriptor when a spoofing provider served the lease.
	pub fingerprint: Option<Value>,
}

/// Capability contract over a live page.
///
/// Every method is a suspension point; callers are expected to serialize
/// access per session (the session holds a single-flight gate).
#[async_trait]
pub trait PageDriver: Send + Sync {
	/// Navigates to `url`, bounded by the spec's navigation timeout.
	async fn navigate(&self, url: &str) -> Result<()>;

	/// Evaluates a script expression in the page and returns its JSON value.
	async fn evaluate(&self, script: &str) -> Result<Value>;

	/// Brings the page window/tab to the foreground.
	async fn bring_to_front(&self) -> Result<()>;

	/// Reloads the current page.
	async fn reload(&self) -> Result<()>;

	/// Captures a full-page screenshot into `path`, overwriting it.
	async fn screenshot_to(&self, path: &std::path::Path) -> Result<()>;

	/// True once the page is gone; all other calls will fail.
	fn is_closed(&self) -> bool;

	/// Subscribes to out-of-band page events.
	fn events(&self) -> broadcast::Receiver<PageEvent>;

	/// Closes the page and its browsing context, best effort.
	async fn close(&self) -> Result<()>;
}

/// Provider of browser capabilities.
#[async_trait]
pub trait BrowserProvider: Send + Sync {
	async fn launch(&self, spec: &LaunchSpec) -> Result<BrowserLease>;
}

/// Tries the fingerprint-spoofing provider first and falls back to a plain
/// persistent chromium profile when it is unavailable or errors.
///
/// Sessions behave identically either way; only the lease's fingerprint
/// descriptor differs.
pub struct CapabilityBroker {
	fingerprint: Option<FingerprintProvider>,
	plain: ChromiumProvider,
}

impl CapabilityBroker {
	pub fn new(fingerprint: Option<FingerprintProvider>) -> Self {
		Self { fingerprint, plain: ChromiumProvider::default() }
	}
}

#[async_trait]
impl BrowserProvider for CapabilityBroker {
	async fn launch(&self, spec: &LaunchSpec) -> Result<BrowserLease> {
		if let Some(provider) = &self.fingerprint {
			match provider.launch(spec).await {
				Ok(lease) => return Ok(lease),
				Err(err) => {
					warn!(target = "qmon.browser", error = %err, "fingerprint launch failed, using default context");
				}
			}
		}
		self.plain.launch(spec).await
	}
}
