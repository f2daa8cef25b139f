use anyhow::Result;
use object_indexer::{
    config,
    services::{
        metadata_store::SqliteMetadataStore, object_source::DiskObjectSource,
        request_router::RequestRouter,
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting object-indexer with config: {:?}", cfg);

    // --- Ensure object namespace root exists ---
    if !Path::new(&cfg.objects_dir).exists() {
        fs::create_dir_all(&cfg.objects_dir)?;
        tracing::info!("Created objects directory at {}", cfg.objects_dir);
    }

    // --- Initialize SQLite connection (once per process) ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(Duration::from_millis(cfg.op_timeout_ms))
            .connect_with(options)
            .await?,
    );

    let store = SqliteMetadataStore::new(db.clone());
    let statements = store.migrate().await?;
    tracing::info!("Applied {} schema statements", statements);

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        db.close().await;
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let source = DiskObjectSource::new(&cfg.objects_dir);
    let router = RequestRouter::new(
        Arc::new(store),
        Arc::new(source),
        cfg.call_policy(),
        cfg.batch_concurrency,
    );

    // --- Build router ---
    let app = object_indexer::app(router);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Release the long-lived pool ---
    db.close().await;
    tracing::info!("Metadata pool closed; shutdown complete.");

    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
