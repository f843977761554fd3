use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod capabilities;
mod config;
mod db;
mod error;
mod imaging;
mod ollama;
mod pinecone;
mod service;

use crate::config::AppConfig;
use crate::db::Database;
use crate::error::{IndexError, ServiceError, ServiceResult, error_chain};
use crate::ollama::OllamaClient;
use crate::pinecone::PineconeClient;
use crate::service::{Dispatcher, WorkerContext, WorkerSettings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging format depends on config, so load it first and report failures after
    let config = AppConfig::load();
    init_logging(config.as_ref().is_ok_and(|c| c.logging.json));
    let config = config.inspect_err(|e| error!(error = %e, "Invalid configuration"))?;

    info!("Starting image indexer v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    let reconnect_delay = config.worker.reconnect_delay();
    let busy_timeout = Duration::from_millis(config.store.busy_timeout_ms);
    let db_path = config.database_path()?;

    let Some(db) = retry_transient("open database", reconnect_delay, &shutdown, || async move {
        Database::open(db_path, busy_timeout)
    })
    .await?
    else {
        return Ok(());
    };
    info!(path = %db.path().display(), "Database initialized");

    let ollama = OllamaClient::new(config.ollama.clone(), &config.embeddings)?;
    if !ollama.health_check().await {
        warn!(url = %config.ollama.base_url, "Ollama is not reachable yet; images will fail until it is");
    }
    match ollama.embed_text("test").await {
        Ok(vector) if vector.len() == config.embeddings.dimensions => {
            info!(model = %config.embeddings.model, "Embedding model verified successfully")
        }
        Ok(vector) => warn!(
            model = %config.embeddings.model,
            actual = vector.len(),
            expected = config.embeddings.dimensions,
            "Embedding model dimension does not match configuration"
        ),
        Err(e) => {
            warn!(error = %error_chain(&e), "Embedding model verification failed - embeddings may not work")
        }
    }

    let dimensions = config.embeddings.dimensions;
    let Some(index) = retry_transient("connect to Pinecone", reconnect_delay, &shutdown, || {
        PineconeClient::connect(&config.pinecone, dimensions)
    })
    .await?
    else {
        return Ok(());
    };
    info!(host = %index.host_url(), "Vector index ready");

    let settings = WorkerSettings {
        dimensions,
        uploads_root: config.storage.uploads_root.clone(),
        delays: config.worker.clone(),
    };
    // Ollama serves both the vision and the embedding model
    let ctx = WorkerContext::new(db, ollama.clone(), ollama, index, settings);

    match ctx.db.pending_count() {
        Ok(pending) => info!(pending, "Images waiting for analysis"),
        Err(e) => warn!(error = %error_chain(&e), "Failed to count pending images"),
    }

    Dispatcher::new(&ctx).run(shutdown).await;

    Ok(())
}

fn init_logging(json: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("image_indexer=info"));

    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        let format = fmt::format()
            .with_target(true)
            .with_thread_ids(true)
            .compact();
        registry.with(fmt::layer().event_format(format)).init();
    }
}

/// Retry a startup step until it succeeds, fails permanently, or shutdown is requested.
///
/// Returns `Ok(None)` on shutdown.
async fn retry_transient<T, F, Fut>(
    what: &str,
    delay: Duration,
    shutdown: &CancellationToken,
    mut attempt: F,
) -> ServiceResult<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    loop {
        match attempt().await {
            Ok(value) => return Ok(Some(value)),
            Err(e) if is_permanent(&e) => return Err(e),
            Err(e) => {
                error!(
                    error = %error_chain(&e),
                    retry_in_secs = delay.as_secs(),
                    "Failed to {}", what
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Errors no amount of waiting will fix
fn is_permanent(error: &ServiceError) -> bool {
    matches!(
        error,
        ServiceError::Config { .. } | ServiceError::Index(IndexError::IndexNotFound { .. })
    )
}

fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested, finishing the current image");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
