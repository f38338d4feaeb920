use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use qmon::browser::{CapabilityBroker, FingerprintProvider};
use qmon::config::DataDirs;
use qmon::{ManagerConfig, SessionManager};
use tracing::info;

mod cli;
mod logging;
mod server;

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let dirs = DataDirs::create(&cli.data_dir)?;
	let fingerprint = FingerprintProvider::discover(&dirs.fingerprint_config_path());
	if fingerprint.is_some() {
		info!(target = "qmon.server", "fingerprint provider configured");
	}
	let provider = Arc::new(CapabilityBroker::new(fingerprint));

	let mut config = ManagerConfig::default();
	if let Some(ms) = cli.auto_reload_ms {
		config.default_auto_reload = Duration::from_millis(ms);
	}
	let manager = SessionManager::new(dirs, provider, config);

	let router = server::build_router(manager);
	let addr = SocketAddr::from(([127, 0, 0, 1], cli.port));
	let listener = tokio::net::TcpListener::bind(addr).await?;
	info!(target = "qmon.server", %addr, "queue monitor listening");
	axum::serve(listener, router).await?;
	Ok(())
}
