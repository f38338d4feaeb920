//! Optional fingerprint-spoofing capability provider.
//!
//! Configured from `fingerprint.config.json` in the data directory plus a
//! handful of environment keys. When active it layers automation-masking on
//! top of the plain chromium launch: a user-agent override, extra engine
//! arguments and an init script patching the usual detection surfaces. When
//! unconfigured or failing it yields to the default context; sessions never
//! notice the difference beyond the lease's fingerprint descriptor.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{BrowserLease, BrowserProvider, ChromiumProvider, LaunchSpec};
use crate::error::Result;

const API_ENV_KEYS: [&str; 2] = ["QMON_FINGERPRINT_API_KEY", "FINGERPRINT_API_KEY"];

/// Masks the detection surfaces a stock automation build exposes.
const MASK_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => false });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
if (navigator.plugins.length === 0) {
	Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3] });
}
"#;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FingerprintConfig {
	#[serde(default)]
	api_key: Option<String>,
	#[serde(default)]
	user_agent: Option<String>,
	#[serde(default)]
	args: Vec<String>,
}

/// Best-effort spoofing variant of the chromium provider.
pub struct FingerprintProvider {
	config: FingerprintConfig,
	inner: ChromiumProvider,
}

impl FingerprintProvider {
	/// Loads provider configuration, returning `None` when spoofing is not
	/// set up at all (no config file and no API key in the environment).
	pub fn discover(config_path: &Path) -> Option<Self> {
		let mut config = match std::fs::read_to_string(config_path) {
			Ok(raw) => match serde_json::from_str::<FingerprintConfig>(&raw) {
				Ok(config) => config,
				Err(err) => {
					warn!(target = "qmon.browser", path = %config_path.display(), error = %err, "failed to parse fingerprint config");
					FingerprintConfig::default()
				}
			},
			Err(_) => FingerprintConfig::default(),
		};

		if config.api_key.is_none() {
			config.api_key = API_ENV_KEYS
				.iter()
				.find_map(|key| std::env::var(key).ok())
				.map(|key| key.trim().to_string())
				.filter(|key| !key.is_empty());
		}

		if config.api_key.is_none() && config.user_agent.is_none() && config.args.is_empty() {
			debug!(target = "qmon.browser", "fingerprint provider not configured");
			return None;
		}

		Some(Self { config, inner: ChromiumProvider })
	}
}

#[async_trait]
impl BrowserProvider for FingerprintProvider {
	async fn launch(&self, spec: &LaunchSpec) -> Result<BrowserLease> {
		let mut spec = spec.clone();
		spec.args.extend(self.config.args.iter().cloned());

		let page = self.inner.launch_page(&spec).await?;
		page.add_init_script(MASK_SCRIPT).await?;
		if let Some(user_agent) = &self.config.user_agent {
			page.override_user_agent(user_agent).await?;
		}

		let fingerprint = json!({
			"provider": "chromium-spoof",
			"userAgent": self.config.user_agent,
			"extraArgs": self.config.args.len(),
		});
		debug!(target = "qmon.browser", "fingerprint context active");

		Ok(BrowserLease { page, fingerprint: Some(fingerprint) })
	}
}
