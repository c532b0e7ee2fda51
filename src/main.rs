use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xdfrec::config::RecorderConfig;
use xdfrec::control::ControlServer;
use xdfrec::errors::Result;
use xdfrec::recorder::{Recorder, Selection};
use xdfrec::source::lsl::LslSource;

/// Records live LSL streams into an XDF file, with remote control.
#[derive(Parser)]
#[command(name = "xdfrec", version)]
struct Cli {
    /// Output XDF filename (plain path or {key:value} template)
    #[arg(short, long, default_value = "recording.xdf")]
    filename: String,

    /// Remote-control port
    #[arg(short, long)]
    port: Option<u16>,

    /// Disable the remote-control server
    #[arg(long)]
    no_remote: bool,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => RecorderConfig::load(path)?,
        None => RecorderConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.no_remote {
        config.enable_remote_control = false;
    }

    let recorder = Arc::new(Recorder::new(LslSource::default(), config.clone()));
    recorder.set_filename(&cli.filename)?;

    let _server = if config.enable_remote_control {
        Some(ControlServer::start(
            Arc::clone(&recorder),
            &config.bind_address,
            config.port,
        )?)
    } else {
        None
    };

    let found = recorder.update_streams()?;
    if found.is_empty() {
        warn!("no streams found; run the 'update' command once streams are up");
    } else {
        let selected = recorder.select(Selection::All)?;
        info!(count = selected.len(), "selected all discovered streams");
    }
    info!("recorder ready; commands: status, streams, update, select, filename, get_filename, start, stop");

    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
