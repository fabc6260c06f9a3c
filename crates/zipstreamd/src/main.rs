//! zipstreamd — serves directories as archives streamed on the fly.
//!
//! Each `GET /archive/<identifier>/` runs the configured archiver over
//! `<dir>/<identifier>` and relays its stdout to the client chunk by chunk.
//!
//! # Usage
//!
//! ```text
//! zipstreamd --dir test_photos/ --port 8080 --log
//! zipstreamd --config /etc/zipstream.toml --delay 1
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use zipstream_core::ArchiveConfig;

#[derive(Parser, Debug)]
#[command(name = "zipstreamd", about = "Stream directories as archives over HTTP")]
struct Cli {
    /// Enable verbose logging (per-chunk events, archiver stderr).
    #[arg(long)]
    log: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Artificial delay after every chunk, in seconds (debugging aid).
    #[arg(long)]
    delay: Option<u64>,

    /// Directory containing one sub-directory per archive [default: test_photos/].
    #[arg(long)]
    dir: Option<PathBuf>,

    /// TOML configuration file; command-line flags take precedence.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum bytes forwarded per chunk [default: 100000].
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Maximum number of archivers running at once.
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Static page served at `/` [default: index.html].
    #[arg(long)]
    index: Option<PathBuf>,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on.
    #[arg(long, default_value = "8080")]
    port: u16,
}

impl Cli {
    /// Defaults, then the config file, then flags.
    fn archive_config(&self) -> anyhow::Result<ArchiveConfig> {
        let mut config = match &self.config {
            Some(path) => ArchiveConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ArchiveConfig::default(),
        };

        if let Some(dir) = &self.dir {
            config.base_dir = dir.clone();
        }
        if let Some(delay) = self.delay {
            config.chunk_delay_secs = delay;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(limit) = self.max_concurrent {
            config.max_concurrent_archives = Some(limit);
        }
        if let Some(index) = &self.index {
            config.index_page = index.clone();
        }

        config.validate()?;
        Ok(config)
    }

    fn log_filter(&self) -> &'static str {
        if self.log {
            "info,zipstreamd=debug,zipstream_api=debug,zipstream_core=debug"
        } else {
            "info"
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_filter()));
    if cli.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = cli.archive_config()?;
    let addr = SocketAddr::new(cli.host, cli.port);
    run(config, addr).await
}

async fn run(config: ArchiveConfig, addr: SocketAddr) -> anyhow::Result<()> {
    info!(
        base_dir = %config.base_dir.display(),
        chunk_size = config.chunk_size,
        chunk_delay_secs = config.chunk_delay_secs,
        archiver = %config.archiver.program,
        max_concurrent = ?config.max_concurrent_archives,
        "zipstream starting"
    );

    if !config.base_dir.is_dir() {
        warn!(base_dir = %config.base_dir.display(), "archive directory does not exist yet");
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start server ───────────────────────────────────────────

    let state = zipstream_api::AppState::new(config, shutdown_rx)?;
    let router = zipstream_api::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "HTTP server listening");

    // Graceful shutdown on Ctrl-C; in-flight relays see the watch flip,
    // kill their archivers and end their bodies.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    info!("zipstream stopped");
    Ok(())
}
