//! Worker process runtime.
//!
//! A worker owns one [`UserStore`], one [`Replicator`] and one private API
//! server bound to `127.0.0.1:(base port + worker id)`. Replication is wired
//! up before the listener opens so the bootstrap snapshot request goes out
//! first, but the server does not wait for an answer: until one arrives a
//! fresh worker serves whatever it has, usually nothing.
//!
//! The worker shuts down gracefully (stop accepting, drain in-flight
//! requests, exit) on SIGINT, SIGTERM, or when the supervisor link closes.
//!
//! Run with `--standalone`, the same API is served on its own with no link
//! and no replication, stopping only on a signal.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::{self, AppState};
use crate::config::{bind_listener, WorkerConfig};
use crate::link::{self, Inbox, Link};
use crate::replication::Replicator;
use crate::signal;
use crate::store::UserStore;

/// Runs the configured mode until shutdown: wired to the supervisor over
/// stdin/stdout, or standalone.
pub async fn run(config: WorkerConfig) -> Result<()> {
    if config.standalone {
        return run_standalone(config).await;
    }
    let (link, inbox) = link::stdio();
    run_with_link(config, link, inbox).await
}

/// Runs a clustered worker over an arbitrary link.
pub async fn run_with_link(config: WorkerConfig, link: Link, inbox: Inbox) -> Result<()> {
    let worker_id = config.clustered_id()?;
    let addr = config.listen_addr()?;

    let store = Arc::new(UserStore::new());
    let replicator = Replicator::new(worker_id, Arc::clone(&store), link);
    let replication = replicator.start(inbox);

    let state = AppState {
        store,
        worker_id: Some(worker_id),
    };
    serve(addr, state, shutdown_signal(replication)).await?;

    info!(worker_id, "worker has shut down");
    Ok(())
}

/// Serves the API alone on the configured port.
pub async fn run_standalone(config: WorkerConfig) -> Result<()> {
    let addr = config.listen_addr()?;
    let state = AppState {
        store: Arc::new(UserStore::new()),
        worker_id: None,
    };
    serve(addr, state, async {
        let name = signal::terminated().await;
        info!(signal = name, "draining");
    })
    .await?;

    info!("server has shut down");
    Ok(())
}

async fn serve<F>(addr: SocketAddr, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = bind_listener(addr).await?;
    info!(
        worker_id = ?state.worker_id,
        pid = std::process::id(),
        %addr,
        "worker listening"
    );

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Resolves on the first of: SIGINT, SIGTERM, or the supervisor link closing.
async fn shutdown_signal(replication: JoinHandle<()>) {
    tokio::select! {
        name = signal::terminated() => info!(signal = name, "draining"),
        _ = replication => info!("supervisor link closed, draining"),
    }
}
