//! Leader election over a Postgres advisory lock.
//!
//! The lock-holding connection is modeled behind a trait so tests can
//! simulate acquisition contention and connection loss without a real
//! database, the same way the replication reader keeps its wire transport
//! behind a trait.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::BridgeError;

/// A single open connection holding (or attempting to hold) the session-scoped
/// advisory lock.
#[async_trait]
pub trait AdvisoryLockSession: Send + Sync {
    /// `pg_try_advisory_lock($1)`, non-blocking, returns whether acquired.
    async fn try_acquire(&self, lock_key: i64) -> Result<bool, BridgeError>;

    /// A trivial round-trip query used to detect connection loss.
    async fn check_alive(&self) -> Result<(), BridgeError>;

    /// Closing the connection releases a session-scoped advisory lock.
    async fn close(&self) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait LeaderLockConnector: Send + Sync {
    async fn connect(&self, conninfo: &str) -> Result<Box<dyn AdvisoryLockSession>, BridgeError>;
}

/// Owns the connection holding the lock for as long as this process acts as
/// the active forwarder. `close` is idempotent.
pub struct LeaderSession {
    session: Box<dyn AdvisoryLockSession>,
    closed: std::sync::atomic::AtomicBool,
}

impl LeaderSession {
    fn new(session: Box<dyn AdvisoryLockSession>) -> Self {
        Self {
            session,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub async fn check_alive(&self) -> Result<(), BridgeError> {
        self.session.check_alive().await
    }

    /// No-op on repeated calls.
    pub async fn close(&self) {
        if self
            .closed
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return;
        }
        if let Err(err) = self.session.close().await {
            warn!(error = %err, "error closing leader session");
        }
    }
}

/// Loop: connect, try the lock, return on success; otherwise close, sleep,
/// retry. Cancellation exits the loop promptly (no partial sleep past the
/// cancellation point).
pub async fn wait_for_leadership(
    connector: &dyn LeaderLockConnector,
    conninfo: &str,
    lock_key: i64,
    retry_interval: Duration,
    cancel: &CancellationToken,
) -> Result<LeaderSession, BridgeError> {
    loop {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let session = connector.connect(conninfo).await?;
        match session.try_acquire(lock_key).await {
            Ok(true) => {
                info!(lock_key, "leadership_acquired");
                return Ok(LeaderSession::new(session));
            }
            Ok(false) => {
                session.close().await.ok();
            }
            Err(err) => {
                warn!(error = %err, "failed to attempt advisory lock acquisition");
                session.close().await.ok();
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(retry_interval) => {}
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
        }
    }
}

/// Polls `session.check_alive()` every `interval`; on any failure (including
/// the connection simply being gone), trips `stop` and returns `true`.
/// Returns `false` when `stop` was tripped by someone else first; the
/// caller needs this distinction to tell "we lost leadership" apart from
/// "shutdown was already underway" (the `LeadershipLost` condition).
pub async fn leadership_watchdog(
    session: &LeaderSession,
    interval: Duration,
    stop: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.cancelled() => return false,
        }

        if let Err(err) = session.check_alive().await {
            warn!(error = %err, "leadership_lost");
            stop.cancel();
            return true;
        }
    }
}
