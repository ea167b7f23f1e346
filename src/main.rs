use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use webhook_receiver::{http_server, store::FileStore, AppState, Config};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("webhook-receiver: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    let store = FileStore::open(config.data_dir.clone()).await?;
    info!(dir = %store.data_dir().display(), "persistence ready");

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(
        public_url = %config.public_url,
        webhook = %config.webhook_url(),
        max_history = config.max_history,
        "webhook-receiver starting"
    );

    let heartbeat_period = config.heartbeat_interval;
    let (state, persistence_worker) = AppState::new(config, Arc::new(store));
    let heartbeat = state.broadcaster.spawn_heartbeat(heartbeat_period);

    // Open event streams never finish on their own; end them so graceful
    // shutdown can complete.
    let broadcaster = Arc::clone(&state.broadcaster);
    let shutdown = async move {
        shutdown_signal().await;
        broadcaster.disconnect_all();
    };
    http_server::serve(listener, state, shutdown).await?;

    heartbeat.abort();
    // The worker exits once the last queue handle (held by the router) is
    // gone and the backlog is flushed.
    if let Err(e) = persistence_worker.await {
        error!(error = %e, "persistence worker ended abnormally");
    }
    info!("webhook-receiver stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
