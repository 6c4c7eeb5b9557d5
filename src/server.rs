//! Service wiring and lifecycle.
//!
//! Opens the store, spawns the processor and the notifier, and serves the
//! HTTP surface until ctrl-c/SIGTERM. Shutdown is two-phase: the HTTP
//! server drains first, then the coordinator broadcasts cancellation to the
//! pools and the notifier, which are awaited under the configured deadline.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::api::{self, state::AppState};
use crate::config::Config;
use crate::notifier::Notifier;
use crate::observability::Metrics;
use crate::processor::Processor;
use crate::shutdown::ShutdownCoordinator;
use crate::store::Store;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn run(config: Config) -> Result<(), AnyError> {
    let config = Arc::new(config);

    std::fs::create_dir_all(&config.server.save_dir)?;

    info!(path = %config.server.store_path.display(), "Opening store");
    let store = Store::open(&config.server.store_path)?;

    let metrics = Arc::new(Metrics::new());
    let shutdown = ShutdownCoordinator::shared();

    let (processor, kick) = Processor::new(
        store.clone(),
        config.clone(),
        metrics.clone(),
        shutdown.clone(),
    );
    let processor_handle = tokio::spawn(processor.run());

    let notifier = Notifier::new(
        store.clone(),
        config.callbacks.clone(),
        Notifier::public_url_builder(&config.server.public_url),
        metrics.clone(),
        shutdown.clone(),
    )?;
    let notifier_handle = tokio::spawn(notifier.run());
    let notifier_abort = notifier_handle.abort_handle();

    let state = AppState::new(config.clone(), store.clone(), metrics, kick);
    let app = api::router(state);

    let listener = TcpListener::bind(config.server.bind_addr).await?;
    info!(address = %config.server.bind_addr, "fetchd API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The HTTP side has drained; now cancel the worker side and wait for
    // in-flight downloads and callbacks to reach a persisted checkpoint.
    shutdown.request_shutdown();

    // The processor bounds its own drain with the shutdown deadline.
    let _ = processor_handle.await;

    let deadline = config.downloads.shutdown_deadline();
    if tokio::time::timeout(deadline, notifier_handle).await.is_err() {
        warn!("Notifier did not stop within the shutdown deadline, aborting");
        notifier_abort.abort();
    }

    store.persist()?;
    info!("fetchd stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
