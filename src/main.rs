use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use fluxgate::access_log::AccessLogger;
use fluxgate::{Server, ShutdownManager, ShutdownSignal, StaticConfig};

#[derive(Parser)]
#[command(name = "fluxgate")]
#[command(about = "A dynamic multi-protocol edge router and reverse proxy")]
struct Args {
    #[arg(short, long, default_value = "config/fluxgate.toml")]
    config: String,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fluxgate={}", level).into()),
        )
        .init();

    info!("Starting fluxgate edge router");

    let config = StaticConfig::from_file_with_env(&args.config).await?;
    info!("Loaded configuration from {}", args.config);

    // Metrics exposition, when configured.
    let mut _metrics_handle = None;
    if let Some(metrics_config) = &config.metrics {
        _metrics_handle = Some(fluxgate::observe::start_metrics_server(metrics_config).await?);
    }

    // Access log, when configured.
    let access_logger = match &config.access_log {
        Some(access_config) => Some(Arc::new(AccessLogger::new(&access_config.path).await?)),
        None => None,
    };

    let shutdown = Arc::new(ShutdownManager::new());
    spawn_signal_handlers(Arc::clone(&shutdown), access_logger.clone());

    let server = Server::new(config, shutdown, access_logger);
    server.run().await
}

#[cfg(unix)]
fn spawn_signal_handlers(
    shutdown: Arc<ShutdownManager>,
    access_logger: Option<Arc<AccessLogger>>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigusr1 = match signal(SignalKind::user_defined1()) {
            Ok(sigusr1) => sigusr1,
            Err(e) => {
                error!("Failed to install SIGUSR1 handler: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    warn!("Received SIGTERM, shutting down gracefully");
                    shutdown.initiate(ShutdownSignal::Graceful);
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Received SIGINT, shutting down");
                    shutdown.initiate(ShutdownSignal::Immediate);
                }
                _ = sigusr1.recv() => {
                    // Log rotation: reopen the access log on its
                    // configured path without a restart.
                    if let Some(logger) = &access_logger {
                        if let Err(e) = logger.reopen().await {
                            error!("Failed to reopen access log: {}", e);
                        }
                    } else {
                        info!("SIGUSR1 received but no access log configured");
                    }
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_handlers(
    shutdown: Arc<ShutdownManager>,
    _access_logger: Option<Arc<AccessLogger>>,
) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received CTRL+C, shutting down");
            shutdown.initiate(ShutdownSignal::Immediate);
        }
    });
}
