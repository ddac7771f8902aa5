//! Replication reader: pulls `XLogData` off the upstream copy-both stream,
//! turns each chunk into an [`Event`], and keeps the upstream informed of
//! our confirmed-flush position.
//!
//! The wire transport is kept behind [`ReplicationConnection`] (split into
//! [`ReplicationReader`]/[`ReplicationWriter`] halves once replication
//! starts) so this module's control flow (start sequence, inbound dispatch,
//! feedback cadence, shutdown) can be exercised against an in-memory fake
//! instead of a live connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ack_tracker::AckTracker;
use crate::error::BridgeError;
use crate::event::Event;
use crate::frame::{self, InboundMessage, StandbyStatusUpdate};
use crate::partition_key::PartitionKeyPolicy;
use crate::queue::InflightQueue;

/// Seconds between the Postgres epoch (2000-01-01 UTC) and the Unix epoch;
/// replication-protocol timestamps are microseconds since the former.
const PG_EPOCH_UNIX_SECONDS: i64 = 946_684_800;

fn pg_epoch_micros() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_micros() as i64 - PG_EPOCH_UNIX_SECONDS * 1_000_000
}

/// The upstream replication wire transport, abstracted for testability.
#[async_trait]
pub trait ReplicationConnection: Send {
    /// Issues `START_REPLICATION SLOT <slot> LOGICAL <start_lsn> (<options>)`
    /// and confirms the server switched the connection into copy-both mode.
    async fn start_replication(
        &mut self,
        slot: &str,
        start_lsn: u64,
        plugin: &str,
        options_sql: &str,
    ) -> Result<(), BridgeError>;

    /// Splits the started connection into independent read/write halves.
    /// Once split, the reader's backpressure can never block the writer.
    fn split(self: Box<Self>) -> (Box<dyn ReplicationReader>, Box<dyn ReplicationWriter>);
}

/// The inbound half of a split replication connection.
#[async_trait]
pub trait ReplicationReader: Send {
    /// One copy-data payload (tag + body, no outer envelope). `Ok(None)`
    /// means the server ended the copy-both stream cleanly.
    async fn read_frame(&mut self) -> Result<Option<Bytes>, BridgeError>;

    async fn close(&mut self);
}

/// The outbound half of a split replication connection.
#[async_trait]
pub trait ReplicationWriter: Send {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), BridgeError>;

    async fn close(&mut self);
}

/// Drives the copy-both stream until cancellation, a fatal protocol error,
/// or the server ends the stream. `Ok(())` only on a clean server-initiated
/// end; cancellation surfaces as `Err(BridgeError::Cancelled)` so the
/// supervisor can distinguish it from a real failure.
///
/// Inbound dispatch (reading frames, registering acks, enqueueing events)
/// and outbound feedback (periodic, frontier-triggered, and keepalive-reply
/// triggered) run as independent futures raced in one `select!`: a `put`
/// blocked on in-flight-queue backpressure never prevents a feedback write
/// or delays observing cancellation.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    mut conn: Box<dyn ReplicationConnection>,
    slot: &str,
    plugin: &str,
    options_sql: &str,
    queue: Arc<InflightQueue<Event>>,
    ack_tracker: AckTracker,
    partition_key: &PartitionKeyPolicy,
    feedback_interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), BridgeError> {
    let start_lsn = ack_tracker
        .frontier()
        .max(ack_tracker.last_registered_lsn());

    conn.start_replication(slot, start_lsn, plugin, options_sql)
        .await?;
    info!(slot, start_lsn = %crate::lsn::format(start_lsn), "replication_started");

    let (mut reader, mut writer) = conn.split();

    // Keepalive replies must reach the writer without waiting on a queue
    // slot, so the reader signals them over a channel instead of writing
    // directly. Capacity 1: a pending request already covers the next reply.
    let (feedback_request_tx, feedback_request_rx) = mpsc::channel::<()>(1);

    let inbound = run_inbound(
        reader.as_mut(),
        &queue,
        &ack_tracker,
        partition_key,
        feedback_request_tx,
    );
    let outbound = run_outbound(writer.as_mut(), &ack_tracker, feedback_interval, feedback_request_rx);

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BridgeError::Cancelled),
        r = inbound => r,
        r = outbound => r,
    };

    reader.close().await;
    writer.close().await;
    result
}

async fn run_inbound(
    reader: &mut dyn ReplicationReader,
    queue: &InflightQueue<Event>,
    ack_tracker: &AckTracker,
    partition_key: &PartitionKeyPolicy,
    feedback_request_tx: mpsc::Sender<()>,
) -> Result<(), BridgeError> {
    loop {
        match reader.read_frame().await {
            Ok(Some(bytes)) => {
                handle_inbound(&bytes, queue, ack_tracker, partition_key, &feedback_request_tx).await?;
            }
            Ok(None) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

async fn run_outbound(
    writer: &mut dyn ReplicationWriter,
    ack_tracker: &AckTracker,
    feedback_interval: Duration,
    mut feedback_request_rx: mpsc::Receiver<()>,
) -> Result<(), BridgeError> {
    let mut frontier_rx = ack_tracker.subscribe();
    let mut feedback_due = tokio::time::interval(feedback_interval);
    feedback_due.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    feedback_due.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            biased;

            _ = feedback_due.tick() => {
                send_feedback(writer, ack_tracker.frontier(), false).await?;
            }

            changed = frontier_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                send_feedback(writer, ack_tracker.frontier(), false).await?;
            }

            requested = feedback_request_rx.recv() => {
                if requested.is_none() {
                    return Ok(());
                }
                send_feedback(writer, ack_tracker.frontier(), false).await?;
            }
        }
    }
}

async fn handle_inbound(
    bytes: &[u8],
    queue: &InflightQueue<Event>,
    ack_tracker: &AckTracker,
    partition_key: &PartitionKeyPolicy,
    feedback_request_tx: &mpsc::Sender<()>,
) -> Result<(), BridgeError> {
    match frame::decode_inbound(bytes)? {
        InboundMessage::XLogData(data) => {
            let ack_id = ack_tracker.register(data.wal_start);
            let key = partition_key.key_for(&data.payload, data.wal_start);
            let event = Event::new(ack_id, data.wal_start, data.payload, key);
            queue.put(event).await?;
        }
        InboundMessage::PrimaryKeepalive(ka) => {
            if ka.reply_requested {
                // Best-effort: a send that fails because a reply is already
                // pending just means the writer hasn't caught up yet.
                let _ = feedback_request_tx.try_send(());
            }
        }
        InboundMessage::Unknown(tag) => {
            warn!(tag, "unknown replication message tag, skipping");
        }
    }
    Ok(())
}

async fn send_feedback(
    writer: &mut dyn ReplicationWriter,
    frontier_lsn: u64,
    reply_requested: bool,
) -> Result<(), BridgeError> {
    // "+1" signals "confirmed through and including frontier_lsn" per
    // upstream's own convention for these fields.
    let confirmed_through = frontier_lsn.saturating_add(1);
    let update = StandbyStatusUpdate {
        written_lsn: confirmed_through,
        flushed_lsn: confirmed_through,
        applied_lsn: confirmed_through,
        client_clock: pg_epoch_micros(),
        reply_requested,
    };
    writer
        .write_frame(frame::encode_standby_status_update(&update))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition_key::{NoOpHook, PartitionKeyFallback, PartitionKeyMode};
    use bytes::{BufMut, BytesMut};
    use std::sync::Mutex as StdMutex;

    struct FakeConnection {
        inbound: mpsc::UnboundedReceiver<Bytes>,
        outbound: Arc<StdMutex<Vec<Bytes>>>,
        started: Arc<StdMutex<Option<(String, u64)>>>,
    }

    #[async_trait]
    impl ReplicationConnection for FakeConnection {
        async fn start_replication(
            &mut self,
            slot: &str,
            start_lsn: u64,
            _plugin: &str,
            _options_sql: &str,
        ) -> Result<(), BridgeError> {
            *self.started.lock().unwrap() = Some((slot.to_string(), start_lsn));
            Ok(())
        }

        fn split(self: Box<Self>) -> (Box<dyn ReplicationReader>, Box<dyn ReplicationWriter>) {
            (
                Box::new(FakeReader { inbound: self.inbound }),
                Box::new(FakeWriter { outbound: self.outbound }),
            )
        }
    }

    struct FakeReader {
        inbound: mpsc::UnboundedReceiver<Bytes>,
    }

    #[async_trait]
    impl ReplicationReader for FakeReader {
        async fn read_frame(&mut self) -> Result<Option<Bytes>, BridgeError> {
            Ok(self.inbound.recv().await)
        }

        async fn close(&mut self) {}
    }

    struct FakeWriter {
        outbound: Arc<StdMutex<Vec<Bytes>>>,
    }

    #[async_trait]
    impl ReplicationWriter for FakeWriter {
        async fn write_frame(&mut self, frame: Bytes) -> Result<(), BridgeError> {
            self.outbound.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn xlogdata_bytes(wal_start: u64, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(wal_start);
        buf.put_u64(wal_start);
        buf.put_i64(0);
        buf.put_slice(payload);
        buf.freeze()
    }

    fn test_policy() -> PartitionKeyPolicy {
        PartitionKeyPolicy::new(PartitionKeyMode::Fallback, PartitionKeyFallback::Lsn, Box::new(NoOpHook))
    }

    #[tokio::test]
    async fn consumes_xlogdata_into_queue_and_registers_ack() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(xlogdata_bytes(100, b"{}")).unwrap();
        drop(tx); // no more frames; the stream ends cleanly right after

        let outbound = Arc::new(StdMutex::new(Vec::new()));
        let conn = Box::new(FakeConnection {
            inbound: rx,
            outbound,
            started: Arc::new(StdMutex::new(None)),
        });

        let queue = Arc::new(InflightQueue::<Event>::new(10, 10_000));
        let ack_tracker = AckTracker::new(0);
        let policy = test_policy();
        let cancel = CancellationToken::new();

        let result = run(
            conn,
            "test_slot",
            "wal2json",
            "",
            queue.clone(),
            ack_tracker.clone(),
            &policy,
            Duration::from_secs(60),
            &cancel,
        )
        .await;
        assert!(result.is_ok());

        let event = queue.get().await.unwrap();
        assert_eq!(event.lsn, 100);
        assert_eq!(ack_tracker.last_registered_lsn(), 100);
    }

    /// The connection is held open (the frame sender isn't dropped) so the
    /// reader blocks on the next frame after the keepalive instead of ending
    /// the stream, giving the independent writer side a chance to run
    /// before the test cancels the whole pipeline.
    #[tokio::test]
    async fn keepalive_reply_requested_triggers_immediate_feedback() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(500);
        buf.put_i64(0);
        buf.put_u8(1);

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(buf.freeze()).unwrap();

        let outbound = Arc::new(StdMutex::new(Vec::new()));
        let conn = Box::new(FakeConnection {
            inbound: rx,
            outbound: outbound.clone(),
            started: Arc::new(StdMutex::new(None)),
        });

        let queue = Arc::new(InflightQueue::<Event>::new(10, 10_000));
        let ack_tracker = AckTracker::new(0);
        let policy = test_policy();
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            run(
                conn,
                "test_slot",
                "wal2json",
                "",
                queue,
                ack_tracker,
                &policy,
                Duration::from_secs(60),
                &run_cancel,
            )
            .await
        });

        // Let the spawned pipeline process the keepalive and write the
        // feedback before telling it to shut down.
        tokio::task::yield_now().await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Cancelled)));

        assert_eq!(outbound.lock().unwrap().len(), 1);
        drop(tx);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let conn = Box::new(FakeConnection {
            inbound: rx,
            outbound: Arc::new(StdMutex::new(Vec::new())),
            started: Arc::new(StdMutex::new(None)),
        });
        let queue = Arc::new(InflightQueue::<Event>::new(10, 10_000));
        let ack_tracker = AckTracker::new(0);
        let policy = test_policy();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run(
            conn,
            "test_slot",
            "wal2json",
            "",
            queue,
            ack_tracker,
            &policy,
            Duration::from_secs(60),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(BridgeError::Cancelled)));
    }

    #[tokio::test]
    async fn start_lsn_uses_max_of_frontier_and_last_registered() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let started = Arc::new(StdMutex::new(None));
        let conn = Box::new(FakeConnection {
            inbound: rx,
            outbound: Arc::new(StdMutex::new(Vec::new())),
            started: started.clone(),
        });
        let queue = Arc::new(InflightQueue::<Event>::new(10, 10_000));
        let ack_tracker = AckTracker::new(0);
        ack_tracker.register(777); // registered but never completed; frontier stays 0
        let policy = test_policy();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let _ = run(
            conn,
            "test_slot",
            "wal2json",
            "",
            queue,
            ack_tracker,
            &policy,
            Duration::from_secs(60),
            &cancel,
        )
        .await;

        assert_eq!(started.lock().unwrap().clone(), Some(("test_slot".to_string(), 777)));
    }
}
