//! Data-directory layout and monitor-wide defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Fixed interval between in-page state polls.
pub const STATE_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Fixed interval between screenshot captures.
pub const SCREENSHOT_INTERVAL: Duration = Duration::from_secs(1);
/// Default auto-reload window when a session does not override it.
pub const DEFAULT_AUTO_RELOAD: Duration = Duration::from_secs(60);
/// Lower bound applied to requested auto-reload intervals.
pub const AUTO_RELOAD_FLOOR: Duration = Duration::from_secs(15);
/// Launch attempts before a session stops retrying on its own.
pub const MAX_LAUNCH_FAILURES: u32 = 5;
/// Delay before a crashed session is relaunched.
pub const CRASH_RESTART_DELAY: Duration = Duration::from_secs(10);
/// Per-page navigation timeout.
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(45);

/// On-disk layout rooted at the monitor's data directory.
///
/// Each session gets a persistent browser profile under `profiles/<id>` and
/// one screenshot slot under `screenshots/<id>.png`, overwritten in place.
#[derive(Debug, Clone)]
pub struct DataDirs {
	root: PathBuf,
}

impl DataDirs {
	/// Creates the layout rooted at `root`, making the shared directories.
	pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
		let dirs = Self { root: root.into() };
		std::fs::create_dir_all(dirs.profiles_dir())?;
		std::fs::create_dir_all(dirs.screenshots_dir())?;
		Ok(dirs)
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn profiles_dir(&self) -> PathBuf {
		self.root.join("profiles")
	}

	pub fn screenshots_dir(&self) -> PathBuf {
		self.root.join("screenshots")
	}

	/// Persistent browser profile directory for one session.
	pub fn profile_dir(&self, session_id: &str) -> PathBuf {
		self.profiles_dir().join(session_id)
	}

	/// Current screenshot slot for one session.
	pub fn screenshot_path(&self, session_id: &str) -> PathBuf {
		self.screenshots_dir().join(format!("{session_id}.png"))
	}

	/// Optional fingerprint provider configuration file.
	pub fn fingerprint_config_path(&self) -> PathBuf {
		self.root.join("fingerprint.config.json")
	}
}

/// Clamps a requested auto-reload interval to the configured floor.
pub fn clamp_auto_reload(requested: Option<Duration>) -> Duration {
	match requested {
		Some(interval) => interval.max(AUTO_RELOAD_FLOOR),
		None => DEFAULT_AUTO_RELOAD,
	}
}
