use std::sync::Arc;

use choo_daemon::config::DaemonConfig;
use choo_daemon::job_manager::JobManager;
use choo_daemon::proto::choo_daemon_server::ChooDaemonServer;
use choo_daemon::service::ChooDaemonService;
use choo_core::provider::ProviderRegistry;
use choo_db::config::DbConfig;
use choo_db::pool::{create_pool, default_migrations_path, run_migrations};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "choo_daemon=info,choo_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DaemonConfig::from_env();

    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }

    let db_config = DbConfig::from_env();
    let pool = create_pool(&db_config).await?;
    run_migrations(&pool, default_migrations_path()).await?;

    let providers = Arc::new(ProviderRegistry::with_builtins());
    let jobs = Arc::new(JobManager::new(pool, providers));
    let service = ChooDaemonService::new(jobs.clone());

    let listener = UnixListener::bind(&config.socket_path)?;
    let incoming = UnixListenerStream::new(listener);
    tracing::info!(socket = %config.socket_path.display(), "choo-daemon listening");

    let shutdown_grace = std::time::Duration::from_secs(config.shutdown_grace_secs);
    let socket_path = config.socket_path.clone();

    let server = tonic::transport::Server::builder()
        .add_service(ChooDaemonServer::new(service))
        .serve_with_incoming_shutdown(incoming, shutdown_signal());

    server.await?;

    tracing::info!("shutdown signal received, draining in-flight jobs");
    jobs.shutdown(true, shutdown_grace).await;
    let _ = std::fs::remove_file(&socket_path);
    tracing::info!("choo-daemon shutdown complete");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM, whichever arrives first.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
