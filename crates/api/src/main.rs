//! Herald relay binary entrypoint.

use std::net::SocketAddr;

use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_notifier::TargetRegistry;
use herald_sources::SourceRegistry;

use herald_api::bootstrap::{build_scheduler, connect_ledger};
use herald_api::routes::create_router;
use herald_api::state::AppState;

const DEFAULT_LOG_FILTER: &str = "herald=info,herald_api=info,herald_common=info,herald_engine=info,\
     herald_notifier=info,herald_sources=info,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Herald starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect the delivery ledger
    let ledger = connect_ledger(&config.redis).await?;

    // Build sources, targets and the scheduler
    let mut scheduler = build_scheduler(
        &config,
        ledger,
        &SourceRegistry::new()?,
        &TargetRegistry::new()?,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    scheduler.start(shutdown_rx.clone());

    // Liveness endpoint
    let app = create_router(AppState::new()).layer(TraceLayer::new_for_http());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Health endpoint listening on {}", addr);

    let mut server_shutdown = shutdown_rx;
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    shutdown_signal().await;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    shutdown_tx.send_replace(true);
    scheduler.stop().await;
    server.await??;

    tracing::info!("Herald stopped.");
    Ok(())
}

/// Install the global subscriber. `HERALD_LOG_FORMAT=json` selects JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json = std::env::var("HERALD_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
