use std::sync::Arc;

use tracing::{info, warn};

use murmur_db::Database;
use murmur_server::{ServerConfig, Services, app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "murmur=debug,murmur_server=debug,murmur_api=debug,murmur_gateway=debug,murmur_db=info,tower_http=debug".into()
                }),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            eprintln!("       Set it in your .env file and restart.");
            std::process::exit(1);
        }
    };

    let db = Arc::new(Database::open(&config.db_path)?);
    let services = Services::new(db, config.master_key, config.retention);

    let sweeper = tokio::spawn(services.scheduler.clone().run());

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    info!("Murmur server listening on {}", config.addr);
    info!(
        "Retention: messages deleted after {} days, warned {} days before",
        config.retention.delete_after().num_days(),
        config.retention.warn_before().num_days()
    );

    axum::serve(listener, app(services.state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("Murmur server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
