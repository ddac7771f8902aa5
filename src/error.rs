//! Crate-wide error taxonomy for the replication pipeline.

use thiserror::Error;

/// Errors surfaced by the replication pipeline.
///
/// Component-internal retries (downstream submit, leader acquisition) never
/// produce one of these directly; they only escape once their own retry
/// budget is exhausted.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed LSN {0:?}")]
    MalformedLsn(String),

    #[error("malformed replication frame: {0}")]
    MalformedFrame(String),

    #[error("START_REPLICATION failed: {0}")]
    ReplicationStartFailed(String),

    #[error("replication slot {0:?} does not exist")]
    SlotMissing(String),

    #[error("downstream publish exhausted retries after {attempts} attempts: {source}")]
    DownstreamRetryExhausted {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("leadership lost")]
    LeadershipLost,

    #[error("queue closed")]
    QueueClosed,

    #[error("cancelled")]
    Cancelled,

    #[error("connection error: {0}")]
    Connection(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// True for conditions that are cooperative shutdown signals rather than
    /// failures worth logging as an error (`QueueClosed`/`Cancelled`).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BridgeError::QueueClosed | BridgeError::Cancelled)
    }
}

/// Errors from loading and validating process configuration. Kept separate
/// from [`BridgeError`] since a misconfigured process never reaches a leader
/// cycle to fail.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for environment variable {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
