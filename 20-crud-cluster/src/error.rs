//! Error types shared by the supervisor and worker processes.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Fatal errors raised while a process is coming up. Both binaries exit
/// with a failure status when they see one of these.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("binding {addr} did not complete within {timeout:?}")]
    BindTimeout { addr: SocketAddr, timeout: Duration },

    #[error("worker {worker_id} port overflows base port {base}")]
    PortOverflow { base: u16, worker_id: u16 },

    #[error("no worker executable found next to {0}")]
    WorkerBinaryMissing(String),

    #[error("failed to build proxy client: {0}")]
    ProxyClient(#[source] reqwest::Error),

    #[error("a clustered worker needs a worker id")]
    MissingWorkerId,

    #[error("cannot run {0} workers")]
    TooManyWorkers(usize),
}

/// A replication frame that could not be turned into a message.
///
/// These never reach a client: the receiving worker logs them and moves on.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message kind '{0}'")]
    UnknownKind(String),

    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

/// The other end of a [`crate::link::Link`] has gone away.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,

    #[error("failed to encode message: {0}")]
    Encode(#[from] MessageError),
}

/// Errors returned by the local user store. Scoped to the request that
/// caused them and never replicated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<&'static str>,
    },

    #[error("User with id {id} not found")]
    NotFound { id: Uuid },
}

impl StoreError {
    pub fn validation(message: impl Into<String>, field: &'static str) -> Self {
        StoreError::Validation {
            message: message.into(),
            field: Some(field),
        }
    }
}
