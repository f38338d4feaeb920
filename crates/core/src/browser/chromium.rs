//! Chromium capability provider backed by chromiumoxide (CDP).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::inspector::EventTargetCrashed;
use chromiumoxide::cdp::browser_protocol::network;
use chromiumoxide::cdp::browser_protocol::page::{
	AddScriptToEvaluateOnNewDocumentParams, EventJavascriptDialogOpening, HandleJavaScriptDialogParams,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BrowserLease, BrowserProvider, LaunchSpec, PageDriver, PageEvent};
use crate::error::{MonitorError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Launches one headful persistent-profile chromium per lease.
#[derive(Debug, Default)]
pub struct ChromiumProvider;

impl ChromiumProvider {
	/// Launches and wires a page without erasing its concrete type, so the
	/// fingerprint provider can layer overrides on top.
	pub(crate) async fn launch_page(&self, spec: &LaunchSpec) -> Result<Arc<ChromiumPage>> {
		std::fs::create_dir_all(&spec.profile_dir)?;
		clean_stale_lockfiles(&spec.profile_dir);

		let (width, height) = spec.viewport;
		let mut builder = BrowserConfig::builder()
			.with_head()
			.window_size(width, height)
			.viewport(Viewport {
				width,
				height,
				device_scale_factor: None,
				emulating_mobile: false,
				is_landscape: false,
				has_touch: false,
			})
			.user_data_dir(&spec.profile_dir);
		for arg in &spec.args {
			builder = builder.arg(arg);
		}
		let config = builder.build().map_err(MonitorError::BrowserLaunch)?;

		let (browser, mut handler) = Browser::launch(config).await?;
		let page = browser.new_page("about:blank").await?;
		page.execute(network::EnableParams::default()).await?;

		let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		let closed = Arc::new(AtomicBool::new(false));

		let mut tasks = Vec::new();

		// The CDP message pump. When it ends the browser connection is gone.
		let pump_events = events.clone();
		let pump_closed = closed.clone();
		tasks.push(tokio::spawn(async move {
			while let Some(event) = handler.next().await {
				if event.is_err() {
					break;
				}
			}
			if !pump_closed.swap(true, Ordering::SeqCst) {
				let _ = pump_events.send(PageEvent::Closed);
			}
		}));

		let mut dialogs = page.event_listener::<EventJavascriptDialogOpening>().await?;
		let dialog_page = page.clone();
		let dialog_events = events.clone();
		tasks.push(tokio::spawn(async move {
			while let Some(dialog) = dialogs.next().await {
				debug!(target = "qmon.browser", message = %dialog.message, "dismissing page dialog");
				let _ = dialog_page.execute(HandleJavaScriptDialogParams::new(false)).await;
				let _ = dialog_events.send(PageEvent::Dialog);
			}
		}));

		let mut crashes = page.event_listener::<EventTargetCrashed>().await?;
		let crash_events = events.clone();
		tasks.push(tokio::spawn(async move {
			while crashes.next().await.is_some() {
				let _ = crash_events.send(PageEvent::Crashed);
			}
		}));

		let mut responses = page.event_listener::<network::EventResponseReceived>().await?;
		let response_page = page.clone();
		let response_events = events.clone();
		let filter = spec.response_filter.clone();
		tasks.push(tokio::spawn(async move {
			while let Some(response) = responses.next().await {
				if !response.response.url.contains(&filter) {
					continue;
				}
				match fetch_body(&response_page, response.request_id.clone()).await {
					Ok(Some(body)) => {
						let _ = response_events.send(PageEvent::ControllerResponse(body));
					}
					Ok(None) => {}
					Err(err) => {
						// Binary or already-evicted bodies are expected noise.
						debug!(target = "qmon.browser", error = %err, "controller response body unavailable");
					}
				}
			}
		}));

		Ok(Arc::new(ChromiumPage {
			page,
			browser: Mutex::new(Some(browser)),
			tasks: Mutex::new(tasks),
			events,
			closed,
			navigation_timeout: spec.navigation_timeout,
		}))
	}
}

#[async_trait]
impl BrowserProvider for ChromiumProvider {
	async fn launch(&self, spec: &LaunchSpec) -> Result<BrowserLease> {
		let page = self.launch_page(spec).await?;
		Ok(BrowserLease { page, fingerprint: None })
	}
}

async fn fetch_body(page: &Page, request_id: network::RequestId) -> Result<Option<String>> {
	let response = page.execute(network::GetResponseBodyParams::new(request_id)).await?;
	let returns = response.result;
	if returns.body.is_empty() {
		return Ok(None);
	}
	if returns.base64_encoded {
		let bytes = base64::engine::general_purpose::STANDARD
			.decode(returns.body.as_bytes())
			.map_err(|e| MonitorError::Evaluate(format!("response body decode: {e}")))?;
		Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
	} else {
		Ok(Some(returns.body))
	}
}

/// Chromium leaves `Singleton*` files behind when it crashes, which block the
/// next launch on the same profile directory.
fn clean_stale_lockfiles(profile_dir: &Path) {
	for name in ["SingletonLock", "SingletonSocket", "SingletonCookie"] {
		let lockfile = profile_dir.join(name);
		if lockfile.exists() {
			if let Err(err) = std::fs::remove_file(&lockfile) {
				warn!(target = "qmon.browser", path = %lockfile.display(), error = %err, "failed to remove stale lockfile");
			}
		}
	}
}

/// One live chromium page plus the browser process that owns it.
pub struct ChromiumPage {
	page: Page,
	browser: Mutex<Option<Browser>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	events: broadcast::Sender<PageEvent>,
	closed: Arc<AtomicBool>,
	navigation_timeout: Duration,
}

impl ChromiumPage {
	pub(crate) async fn override_user_agent(&self, user_agent: &str) -> Result<()> {
		self.page.execute(SetUserAgentOverrideParams::new(user_agent)).await?;
		Ok(())
	}

	pub(crate) async fn add_init_script(&self, source: &str) -> Result<()> {
		self.page.execute(AddScriptToEvaluateOnNewDocumentParams::new(source)).await?;
		Ok(())
	}

	fn ensure_open(&self) -> Result<()> {
		if self.is_closed() {
			return Err(MonitorError::PageUnavailable);
		}
		Ok(())
	}
}

#[async_trait]
impl PageDriver for ChromiumPage {
	async fn navigate(&self, url: &str) -> Result<()> {
		self.ensure_open()?;
		match tokio::time::timeout(self.navigation_timeout, self.page.goto(url)).await {
			Ok(Ok(_)) => Ok(()),
			Ok(Err(err)) => Err(MonitorError::Navigation { url: url.to_string(), source: err.into() }),
			Err(_) => Err(MonitorError::Navigation {
				url: url.to_string(),
				source: anyhow::anyhow!("timed out after {:?}", self.navigation_timeout),
			}),
		}
	}

	async fn evaluate(&self, script: &str) -> Result<Value> {
		self.ensure_open()?;
		let result = self
			.page
			.evaluate(script)
			.await
			.map_err(|e| MonitorError::Evaluate(e.to_string()))?;
		Ok(result.into_value::<Value>()?)
	}

	async fn bring_to_front(&self) -> Result<()> {
		self.ensure_open()?;
		self.page.bring_to_front().await?;
		Ok(())
	}

	async fn reload(&self) -> Result<()> {
		self.ensure_open()?;
		match tokio::time::timeout(self.navigation_timeout, self.page.reload()).await {
			Ok(Ok(_)) => Ok(()),
			Ok(Err(err)) => Err(MonitorError::Cdp(err)),
			Err(_) => Err(MonitorError::Evaluate(format!(
				"reload timed out after {:?}",
				self.navigation_timeout
			))),
		}
	}

	async fn screenshot_to(&self, path: &Path) -> Result<()> {
		self.ensure_open()?;
		self.page
			.save_screenshot(ScreenshotParams::builder().full_page(true).build(), path)
			.await?;
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
		if let Some(mut browser) = self.browser.lock().await.take() {
			let _ = browser.close().await;
			let _ = browser.wait().await;
		}
		for task in self.tasks.lock().await.drain(..) {
			task.abort();
		}
		Ok(())
	}
}
