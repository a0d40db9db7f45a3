//! Finsync Server
//!
//! Runs two listeners: the WebSocket sync endpoint devices connect to (all
//! interfaces by default), and an HTTP control plane for pairing and device
//! management (loopback by default).

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use finsync_server::config::Config;
use finsync_server::state::AppState;
use finsync_server::{db, routes, sync};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "finsync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default().normalized()
    });

    tracing::info!("Starting Finsync Server v{}", env!("CARGO_PKG_VERSION"));

    let db_pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Database initialized at {}", config.database.url);

    let app_state = AppState::new(config.clone(), db_pool);
    let rotation = sync::spawn_rotation_task(
        app_state.tokens().clone(),
        Duration::from_secs(config.sync.rotation_interval_secs),
    );
    tracing::info!(
        "Pairing token valid for {}s, rotating every {}s",
        config.sync.token_ttl_secs,
        config.sync.rotation_interval_secs
    );

    let control_addr: SocketAddr =
        format!("{}:{}", config.server.host, config.server.port).parse()?;
    let sync_addr: SocketAddr = format!("{}:{}", config.sync.host, config.sync.port).parse()?;

    let control_listener = tokio::net::TcpListener::bind(control_addr).await?;
    let sync_listener = tokio::net::TcpListener::bind(sync_addr).await?;
    tracing::info!("Control plane listening on {}", control_addr);
    tracing::info!(
        "Sync endpoint listening on {} (advertised as {}:{})",
        sync_addr,
        app_state.advertised_host(),
        config.sync.port
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control = axum::serve(control_listener, routes::build_router(app_state.clone()))
        .with_graceful_shutdown(wait_for(shutdown_rx.clone()))
        .into_future();
    let sync_server = axum::serve(sync_listener, sync::router(app_state))
        .with_graceful_shutdown(wait_for(shutdown_rx))
        .into_future();

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let (control_result, sync_result) = tokio::join!(control, sync_server);
    rotation.abort();
    control_result?;
    sync_result?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
