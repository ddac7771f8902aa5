//! Supervisor: composes the leader gate, replication reader, and publisher
//! into one leader cycle, and the outer driver loop that repeats cycles
//! across leadership changes.
//!
//! Peer tasks are joined with `futures::future::select_all` over same-typed
//! boxed futures and coordinated by one shared `CancellationToken`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{select_all, BoxFuture};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ack_tracker::AckTracker;
use crate::config::Config;
use crate::error::BridgeError;
use crate::event::Event;
use crate::leader::{self, LeaderSession};
use crate::partition_key::{PartitionKeyHook, PartitionKeyPolicy};
use crate::pg;
use crate::publisher::{self, BatchSink, KinesisSink, PublisherConfig};
use crate::queue::InflightQueue;
use crate::replication;

/// Runs one leadership cycle to completion: holds `leader_session` for as
/// long as the replication reader and publisher run cleanly, and returns
/// as soon as any of the three peer activities (reader, publisher,
/// watchdog) ends for any reason.
///
/// `Ok(())` only happens when `cancel` was already tripped by the caller
/// before this cycle started failing on its own, i.e. a clean shutdown.
/// Every other outcome is an `Err`, including `LeadershipLost`, so the
/// outer driver loop can decide whether to retry.
pub async fn run_leader_pipeline(
    config: &Config,
    leader_session: Arc<LeaderSession>,
    partition_key_hook: Box<dyn PartitionKeyHook>,
    start_lsn: u64,
    cancel: CancellationToken,
) -> Result<(), BridgeError> {
    let ack_tracker = AckTracker::new(start_lsn);
    let queue = Arc::new(InflightQueue::<Event>::new(
        config.inflight_max_messages,
        config.inflight_max_bytes,
    ));
    let partition_key = Arc::new(PartitionKeyPolicy::new(
        config.partition_key_mode.clone(),
        config.partition_key_fallback,
        partition_key_hook,
    ));

    let conn = Box::new(pg::PgReplicationConnection::connect(&config.postgres_conninfo).await?);
    let sink: Arc<dyn BatchSink> = Arc::new(KinesisSink::new(&config.aws_region).await);
    let publisher_config = PublisherConfig {
        stream: config.kinesis_stream.clone(),
        batch_max_records: config.kinesis_batch_max_records,
        batch_max_bytes: config.kinesis_batch_max_bytes,
        batch_max_delay: config.kinesis_batch_max_delay,
        retry_base_delay: config.kinesis_retry_base_delay,
        retry_max_delay: config.kinesis_retry_max_delay,
        retry_max_attempts: config.kinesis_retry_max_attempts,
        call_timeout: config.kinesis_call_timeout,
    };

    let replication_fut: BoxFuture<'static, Result<(), BridgeError>> = {
        let queue = queue.clone();
        let ack_tracker = ack_tracker.clone();
        let partition_key = partition_key.clone();
        let slot = config.replication_slot.clone();
        let plugin = config.output_plugin.clone();
        let options_sql = config.wal2json_options_sql.clone();
        let feedback_interval = config.replication_feedback_interval;
        let cancel = cancel.clone();
        Box::pin(async move {
            replication::run(
                conn,
                &slot,
                &plugin,
                &options_sql,
                queue,
                ack_tracker,
                &partition_key,
                feedback_interval,
                &cancel,
            )
            .await
        })
    };

    let publisher_fut: BoxFuture<'static, Result<(), BridgeError>> = {
        let queue = queue.clone();
        let ack_tracker = ack_tracker.clone();
        let cancel = cancel.clone();
        Box::pin(async move { publisher::run(queue, ack_tracker, sink, &publisher_config, &cancel).await })
    };

    let watchdog_fut: BoxFuture<'static, Result<(), BridgeError>> = {
        let leader_session = leader_session.clone();
        let interval = config.standby_retry_interval;
        let cancel = cancel.clone();
        Box::pin(async move {
            if leader::leadership_watchdog(&leader_session, interval, &cancel).await {
                Err(BridgeError::LeadershipLost)
            } else {
                Err(BridgeError::Cancelled)
            }
        })
    };

    let (first, _index, rest) = select_all([replication_fut, publisher_fut, watchdog_fut]).await;

    // Whatever finished first, tell the remaining two to wind down, then
    // give them `shutdown_grace_period` to actually do so.
    cancel.cancel();
    let drain = futures::future::join_all(rest);
    if tokio::time::timeout(config.shutdown_grace_period, drain)
        .await
        .is_err()
    {
        warn!("peer activities did not wind down within the shutdown grace period");
    }

    leader_session.close().await;
    first
}

/// The outer driver loop: waits for leadership, makes sure the replication
/// slot exists, resolves its start LSN, then runs a leader cycle. On any
/// non-cancellation failure it logs and retries after
/// `standby_retry_interval`; on `LeadershipLost` it loops straight back to
/// `wait_for_leadership` without a delay (the next contender may already be
/// waiting).
pub async fn run_forever(config: &Config, cancel: &CancellationToken) {
    let connector = pg::PgAdvisoryLockConnector;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let session = match leader::wait_for_leadership(
            &connector,
            &config.postgres_conninfo,
            config.leader_lock_key,
            config.standby_retry_interval,
            cancel,
        )
        .await
        {
            Ok(session) => Arc::new(session),
            Err(err) if err.is_cancellation() => return,
            Err(err) => {
                error!(error = %err, "leader_cycle_failed");
                sleep_or_cancelled(config.standby_retry_interval, cancel).await;
                continue;
            }
        };

        let cycle_result = run_one_cycle(config, session.clone(), cancel).await;
        session.close().await;

        match cycle_result {
            Ok(()) => return,
            Err(err) if err.is_cancellation() => return,
            Err(BridgeError::LeadershipLost) => {
                info!("leadership_lost, returning to the acquisition loop");
            }
            Err(err) => {
                error!(error = %err, "leader_cycle_failed");
                sleep_or_cancelled(config.standby_retry_interval, cancel).await;
            }
        }
    }
}

async fn run_one_cycle(
    config: &Config,
    session: Arc<LeaderSession>,
    parent_cancel: &CancellationToken,
) -> Result<(), BridgeError> {
    let created = pg::ensure_replication_slot(
        &config.postgres_conninfo,
        &config.replication_slot,
        &config.output_plugin,
    )
    .await?;
    if created {
        info!(slot = %config.replication_slot, "replication slot created");
    }

    let start_lsn = pg::resolve_slot_start_lsn(&config.postgres_conninfo, &config.replication_slot).await?;

    // A child token: cancelling the process-wide token tears this cycle
    // down too, but the cycle's own internal failures (a peer task ending)
    // cancel only this cycle, leaving the outer loop free to retry.
    let cycle_cancel = parent_cancel.child_token();
    run_leader_pipeline(
        config,
        session,
        Box::new(crate::partition_key::NoOpHook),
        start_lsn,
        cycle_cancel,
    )
    .await
}

async fn sleep_or_cancelled(interval: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = cancel.cancelled() => {}
    }
}
