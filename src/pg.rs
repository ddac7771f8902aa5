//! Concrete Postgres collaborators: the replication-mode copy-both stream,
//! the advisory-lock session, and the handful of plain SQL statements used
//! to manage the replication slot. Kept in one module since all three
//! share the same `tokio_postgres::connect` + spawned-connection-task shape.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_postgres::CopyBothDuplex;
use tracing::{info, warn};

use crate::error::BridgeError;
use crate::leader::{AdvisoryLockSession, LeaderLockConnector};
use crate::lsn;
use crate::replication::{ReplicationConnection, ReplicationReader, ReplicationWriter};

async fn connect(conninfo: &str) -> Result<tokio_postgres::Client, BridgeError> {
    let (client, connection) = tokio_postgres::connect(conninfo, tokio_postgres::NoTls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            warn!(error = %err, "postgres connection terminated");
        }
    });
    Ok(client)
}

/// Creates `slot_name` if it doesn't already exist. Returns whether this
/// call created it (mirrors `pg_create_logical_replication_slot`'s
/// one-shot nature; callers shouldn't treat "already existed" as an
/// error).
pub async fn ensure_replication_slot(
    conninfo: &str,
    slot_name: &str,
    output_plugin: &str,
) -> Result<bool, BridgeError> {
    let client = connect(conninfo).await?;

    let existing = client
        .query_opt(
            "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?;
    if existing.is_some() {
        return Ok(false);
    }

    client
        .query_one(
            "SELECT * FROM pg_create_logical_replication_slot($1, $2)",
            &[&slot_name, &output_plugin],
        )
        .await?;
    info!(slot = slot_name, plugin = output_plugin, "slot_created");
    Ok(true)
}

/// Resolves the LSN a fresh process should start `START_REPLICATION` from:
/// `confirmed_flush_lsn`, falling back to `restart_lsn`, falling back to 0
/// when the slot has never streamed anything.
pub async fn resolve_slot_start_lsn(conninfo: &str, slot_name: &str) -> Result<u64, BridgeError> {
    let client = connect(conninfo).await?;

    let row = client
        .query_opt(
            "SELECT confirmed_flush_lsn::text, restart_lsn::text \
             FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?
        .ok_or_else(|| BridgeError::SlotMissing(slot_name.to_string()))?;

    let confirmed: Option<String> = row.get(0);
    let restart: Option<String> = row.get(1);

    let resolved = match confirmed.as_deref() {
        Some(text) => lsn::parse(text)?,
        None => match restart.as_deref() {
            Some(text) => lsn::parse(text)?,
            None => 0,
        },
    };
    info!(slot = slot_name, lsn = %lsn::format(resolved), "slot_lsn_resolved");
    Ok(resolved)
}

/// Wraps a replication-mode `tokio_postgres` connection's copy-both stream.
pub struct PgReplicationConnection {
    client: tokio_postgres::Client,
    stream: Option<CopyBothDuplex<Bytes>>,
}

impl PgReplicationConnection {
    pub async fn connect(conninfo: &str) -> Result<Self, BridgeError> {
        let mut config: tokio_postgres::Config = conninfo.parse()?;
        config.replication_mode(tokio_postgres::config::ReplicationMode::Logical);

        let (client, connection) = config.connect(tokio_postgres::NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "replication connection terminated");
            }
        });

        Ok(Self {
            client,
            stream: None,
        })
    }
}

/// Quotes a slot name for inclusion in the replication protocol's simple
/// query syntax (not a prepared-statement parameter in this mode).
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl ReplicationConnection for PgReplicationConnection {
    async fn start_replication(
        &mut self,
        slot: &str,
        start_lsn: u64,
        _plugin: &str,
        options_sql: &str,
    ) -> Result<(), BridgeError> {
        let query = if options_sql.trim().is_empty() {
            format!(
                "START_REPLICATION SLOT {} LOGICAL {}",
                quote_ident(slot),
                lsn::format(start_lsn)
            )
        } else {
            format!(
                "START_REPLICATION SLOT {} LOGICAL {} ({})",
                quote_ident(slot),
                lsn::format(start_lsn),
                options_sql
            )
        };

        let duplex = self
            .client
            .copy_both_simple::<Bytes>(&query)
            .await
            .map_err(|err| BridgeError::ReplicationStartFailed(err.to_string()))?;
        self.stream = Some(duplex);
        Ok(())
    }

    /// Splits the copy-both duplex into independent halves so a reader
    /// blocked on in-flight-queue backpressure can never stall the feedback
    /// writer or delay cancellation.
    fn split(self: Box<Self>) -> (Box<dyn ReplicationReader>, Box<dyn ReplicationWriter>) {
        let duplex = self
            .stream
            .expect("start_replication must be called before split");
        let (sink, stream) = duplex.split();
        let client = Arc::new(self.client);
        (
            Box::new(PgReplicationReader {
                _client: client.clone(),
                stream,
            }),
            Box::new(PgReplicationWriter { _client: client, sink }),
        )
    }
}

struct PgReplicationReader {
    // Keeps the connection's background I/O task alive for as long as this
    // half is in use; neither field is read directly.
    _client: Arc<tokio_postgres::Client>,
    stream: SplitStream<CopyBothDuplex<Bytes>>,
}

#[async_trait]
impl ReplicationReader for PgReplicationReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>, BridgeError> {
        match self.stream.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(err)) => Err(BridgeError::Connection(err)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {}
}

struct PgReplicationWriter {
    _client: Arc<tokio_postgres::Client>,
    sink: SplitSink<CopyBothDuplex<Bytes>, Bytes>,
}

#[async_trait]
impl ReplicationWriter for PgReplicationWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), BridgeError> {
        self.sink.send(frame).await.map_err(BridgeError::Connection)
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

/// Opens a plain (non-replication) connection per acquisition attempt, the
/// way the leader gate's `wait_for_leadership` expects.
pub struct PgAdvisoryLockConnector;

#[async_trait]
impl LeaderLockConnector for PgAdvisoryLockConnector {
    async fn connect(&self, conninfo: &str) -> Result<Box<dyn AdvisoryLockSession>, BridgeError> {
        let client = connect(conninfo).await?;
        Ok(Box::new(PgAdvisoryLockSession { client }))
    }
}

pub struct PgAdvisoryLockSession {
    client: tokio_postgres::Client,
}

#[async_trait]
impl AdvisoryLockSession for PgAdvisoryLockSession {
    async fn try_acquire(&self, lock_key: i64) -> Result<bool, BridgeError> {
        let row = self
            .client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&lock_key])
            .await?;
        Ok(row.get(0))
    }

    async fn check_alive(&self) -> Result<(), BridgeError> {
        self.client.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BridgeError> {
        // The session-scoped advisory lock releases when the backend closes;
        // dropping `self.client` (which happens once the owning `LeaderSession`
        // is dropped) tears down the connection task that holds it open.
        Ok(())
    }
}
