use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "qmon")]
#[command(about = "Queue admission monitor - supervises waiting-room browser sessions")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v debug, -vv trace)
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Port the dashboard API listens on
	#[arg(short, long, default_value_t = 4100)]
	pub port: u16,

	/// Data directory (browser profiles, screenshots, fingerprint config)
	#[arg(long, default_value = "data")]
	pub data_dir: PathBuf,

	/// Default auto-reload interval in milliseconds for new sessions
	#[arg(long)]
	pub auto_reload_ms: Option<u64>,
}
