//! MediaViewer Server - standalone binary hosting the sync hub, media
//! catalog, and VR adapters.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mediaviewer_core::bootstrap::{bootstrap_services, run};
use mediaviewer_core::Config;

/// MediaViewer - single-host media server and VR playback sync hub.
#[derive(Parser, Debug)]
#[command(name = "mediaviewer-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "MV_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Root directory of the indexed media tree (overrides config/env).
    #[arg(short, long, env = "MEDIA_ROOT")]
    media_root: Option<PathBuf>,

    /// Bind port (overrides config file/env).
    #[arg(short = 'p', long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("MediaViewer Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    if let Some(media_root) = args.media_root {
        config.media_root = media_root;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config
        .validate()
        .context("configuration invalid - refusing to start")?;

    log::info!(
        "media_root={} port={} use_ssl={}",
        config.media_root.display(),
        config.port,
        config.use_ssl
    );

    let services = bootstrap_services(config);
    log::info!("services bootstrapped, starting scan and HTTP server");

    if let Err(e) = services.state.scanner.spawn_rescan() {
        log::warn!("initial scan did not start: {e}");
    }

    run(services).await.context("server error")?;

    log::info!("shutdown complete");
    Ok(())
}
