//! Queue admission monitor core.
//!
//! Supervises independent browser sessions through a waiting-room admission
//! flow: each [`session::QueueSession`] polls its page, reconciles the noisy
//! signals into a small status set and applies the auto-reload watchdog;
//! the [`manager::SessionManager`] owns the collection and the process-wide
//! policy. Browser engines plug in behind the [`browser`] capability traits.

pub mod browser;
pub mod config;
pub mod error;
pub mod manager;
pub mod session;
pub mod signals;

pub use error::{MonitorError, Result};
pub use manager::{CreateSessionRequest, ManagerConfig, SessionManager};
pub use session::{
	GlobalSettings, MonitorEvent, QueueSession, SessionConfig, SessionSnapshot, SessionState, SessionStatus,
};
