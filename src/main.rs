//! Collector process entry point
//!
//! Startup is fail-fast: configuration, model artifacts, and the store
//! are brought up in that order and each failure has its own exit code
//! (1 config, 2 models, 3 store). After that the HTTP surface runs until
//! a termination signal, then drains in-flight requests for up to ten
//! seconds before closing the store.

use std::process::exit;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hivetrap_collector::{config::Config, create_router, db, scoring::Ensemble, Collector};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hivetrap_collector=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env();
    if let Err(err) = config.validate() {
        tracing::error!(%err, "invalid configuration");
        exit(1);
    }

    tracing::info!("hivetrap collector starting");
    tracing::info!(db_path = %config.db_path, bind = %config.bind_address, "configuration loaded");

    let ensemble = match Ensemble::load(&config) {
        Ok(ensemble) => ensemble,
        Err(err) => {
            tracing::error!(%err, "model artifacts failed to load");
            exit(2);
        }
    };

    let pool = match db::create_pool(&config.db_path).await {
        Ok(pool) => pool,
        Err(err) => {
            tracing::error!(%err, "cannot open store");
            exit(3);
        }
    };
    if let Err(err) = db::run_migrations(&pool).await {
        tracing::error!(%err, "store initialization failed");
        exit(3);
    }

    let bind_address = config.bind_address.clone();
    let state = Collector::new(pool.clone(), config, ensemble);
    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, bind = %bind_address, "cannot bind");
            exit(1);
        }
    };
    tracing::info!("listening on http://{bind_address}");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(%err, "server error");
    }

    pool.close().await;
    tracing::info!("collector stopped");
}

/// Resolves when a termination signal arrives. Arms a hard deadline so a
/// stuck in-flight request cannot hold the process open past the grace
/// window.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "cannot install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, draining in-flight requests");
    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        tracing::warn!("drain window elapsed, forcing exit");
        exit(0);
    });
}
