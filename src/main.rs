//! CloudShim -- protocol-translation sidecar.
//!
//! Startup: load the YAML config, run one supervisor pass to bind every
//! tenant listener, then watch the config file and re-enter the
//! supervisor on change.  SIGTERM/SIGINT drains in-flight requests and
//! closes the listeners.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use clap::Parser;
use tracing::{error, info};

use cloudshim::supervisor::Supervisor;

/// Poll interval for config-file changes.
const CONFIG_POLL: std::time::Duration = std::time::Duration::from_secs(1);

/// Command-line arguments for the CloudShim sidecar.
#[derive(Parser, Debug)]
#[command(
    name = "cloudshim",
    version,
    about = "Protocol-translation sidecar: AWS <-> GCP"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "cloudshim.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing / logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Loading configuration from {}", cli.config);
    let config = cloudshim::config::load_config(&cli.config)?;

    cloudshim::metrics::init_metrics();
    cloudshim::metrics::describe_metrics();
    if let Some(port) = config.metrics_port {
        tokio::spawn(async move {
            if let Err(e) = cloudshim::metrics::serve_metrics(port).await {
                error!("metrics endpoint failed: {e:#}");
            }
        });
    }

    let supervisor = Arc::new(Supervisor::new());
    supervisor.apply(&config).await;
    info!("{} tenant listener(s) up", supervisor.listener_count());

    // Config driver: re-enter the supervisor whenever the file changes.
    tokio::spawn(watch_config(PathBuf::from(cli.config), supervisor.clone()));

    shutdown_signal().await;

    info!("draining and closing listeners");
    supervisor.close_all().await;
    info!("CloudShim shut down");

    Ok(())
}

/// Watch the config file by polling its mtime; reload and re-enter the
/// supervisor on change.  A document that fails to load leaves the
/// running state untouched.
async fn watch_config(path: PathBuf, supervisor: Arc<Supervisor>) {
    let mut last_modified: Option<SystemTime> = file_mtime(&path).await;
    let mut interval = tokio::time::interval(CONFIG_POLL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let Some(modified) = file_mtime(&path).await else {
            continue;
        };
        if last_modified == Some(modified) {
            continue;
        }
        last_modified = Some(modified);

        info!("config file changed: {}", path.display());
        match cloudshim::config::load_config(&path) {
            Ok(new_config) => {
                supervisor.push_configs(&new_config);
                supervisor.apply(&new_config).await;
                info!(
                    "reconfigured, {} tenant listener(s) up",
                    supervisor.listener_count()
                );
            }
            Err(e) => error!("config reload failed, keeping old state: {e:#}"),
        }
    }
}

async fn file_mtime(path: &PathBuf) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
