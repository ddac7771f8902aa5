//! Batching publisher: drains the in-flight queue into bounded
//! batches and submits them downstream, retrying only the records a partial
//! failure actually rejected while preserving their relative order.
//!
//! The downstream sink is kept behind [`BatchSink`] the same way the
//! upstream wire transport is kept behind a trait in `replication.rs`; the
//! concrete [`KinesisSink`] adapts `aws-sdk-kinesis`'s `PutRecords`
//! operation and disables the SDK's own retry layer, matching
//! `remote_storage::s3_bucket::S3Bucket` ("We do our own retries").

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::PutRecordsRequestEntry;
use aws_sdk_kinesis::Client;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::ack_tracker::AckTracker;
use crate::backoff;
use crate::error::BridgeError;
use crate::event::Event;
use crate::lsn;
use crate::queue::{InflightQueue, Sized_};

#[derive(Debug, Clone)]
pub struct PutRecord {
    pub partition_key: String,
    pub data: Bytes,
}

/// Per-record result of a downstream submit call.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Success,
    Failed {
        error_code: String,
        error_message: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("downstream call failed: {source}")]
    Call { source: anyhow::Error },
}

/// The downstream append log's batch-submit operation, abstracted so the
/// publisher's batching/retry logic can be tested without AWS.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn put_records(
        &self,
        stream: &str,
        records: Vec<PutRecord>,
    ) -> Result<Vec<RecordOutcome>, SinkError>;
}

#[allow(clippy::too_many_arguments)]
pub struct PublisherConfig {
    pub stream: String,
    pub batch_max_records: usize,
    pub batch_max_bytes: usize,
    pub batch_max_delay: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_max_attempts: u32,
    pub call_timeout: Duration,
}

/// Drains `queue` into bounded batches and submits them via `sink` until
/// cancelled or a batch exhausts its retry budget.
pub async fn run(
    queue: Arc<InflightQueue<Event>>,
    ack_tracker: AckTracker,
    sink: Arc<dyn BatchSink>,
    config: &PublisherConfig,
    cancel: &CancellationToken,
) -> Result<(), BridgeError> {
    loop {
        let batch = form_batch(
            &queue,
            config.batch_max_records,
            config.batch_max_bytes,
            config.batch_max_delay,
            cancel,
        )
        .await?;

        submit_batch_with_retry(sink.as_ref(), &ack_tracker, &queue, batch, config, cancel).await?;
    }
}

/// Accumulates events until `max_records`/`max_bytes` is reached or
/// `max_delay` elapses since the first event arrived, whichever comes
/// first. Never returns an empty batch except by propagating an error.
async fn form_batch(
    queue: &InflightQueue<Event>,
    max_records: usize,
    max_bytes: usize,
    max_delay: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<Event>, BridgeError> {
    let mut batch = Vec::new();
    let mut bytes_total = 0usize;
    let deadline = tokio::time::sleep(max_delay);
    tokio::pin!(deadline);

    loop {
        if batch.len() >= max_records || (!batch.is_empty() && bytes_total >= max_bytes) {
            return Ok(batch);
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if batch.is_empty() {
                    return Err(BridgeError::Cancelled);
                }
                return Ok(batch);
            }

            event = queue.get() => {
                match event {
                    Ok(ev) => {
                        bytes_total += ev.size();
                        batch.push(ev);
                    }
                    Err(err) => {
                        if batch.is_empty() {
                            return Err(err);
                        }
                        return Ok(batch);
                    }
                }
            }

            _ = &mut deadline, if !batch.is_empty() => return Ok(batch),
        }
    }
}

/// Submits `events`, acking and releasing successes as soon as they're
/// known, and retrying only the subset a partial failure rejected, in
/// their original relative order, until the batch succeeds fully or the
/// retry budget is exhausted.
async fn submit_batch_with_retry(
    sink: &dyn BatchSink,
    ack_tracker: &AckTracker,
    queue: &InflightQueue<Event>,
    mut events: Vec<Event>,
    config: &PublisherConfig,
    cancel: &CancellationToken,
) -> Result<(), BridgeError> {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let records: Vec<PutRecord> = events
            .iter()
            .map(|e| PutRecord {
                partition_key: e.partition_key.clone(),
                data: e.payload.clone(),
            })
            .collect();

        let call = sink.put_records(&config.stream, records);
        let called = tokio::time::timeout(config.call_timeout, call).await;

        let outcomes = match called {
            Ok(Ok(outcomes)) => outcomes,
            Ok(Err(err)) => {
                if let Some(err) = bump_attempt_or_exhaust(&mut attempt, config, err.into())? {
                    return Err(err);
                }
                sleep_before_retry(config, attempt, cancel).await?;
                continue;
            }
            Err(_elapsed) => {
                let err = anyhow::anyhow!("downstream call timed out after {:?}", config.call_timeout);
                if let Some(err) = bump_attempt_or_exhaust(&mut attempt, config, err)? {
                    return Err(err);
                }
                sleep_before_retry(config, attempt, cancel).await?;
                continue;
            }
        };

        let mut retry_events = Vec::with_capacity(events.len());
        for (event, outcome) in events.into_iter().zip(outcomes) {
            match outcome {
                RecordOutcome::Success => {
                    ack_tracker.complete(event.ack_id);
                    queue.task_done(&event);
                }
                RecordOutcome::Failed {
                    error_code,
                    error_message,
                } => {
                    warn!(
                        error_code,
                        error_message,
                        lsn = %lsn::format(event.lsn),
                        "record rejected, retrying"
                    );
                    retry_events.push(event);
                }
            }
        }

        if retry_events.is_empty() {
            return Ok(());
        }

        let failure_count = retry_events.len();
        if let Some(err) = bump_attempt_or_exhaust(
            &mut attempt,
            config,
            anyhow::anyhow!("{failure_count} record(s) still rejected after retry"),
        )? {
            return Err(err);
        }
        events = retry_events;
        sleep_before_retry(config, attempt, cancel).await?;
    }
}

/// Increments the shared attempt counter; returns `Ok(Some(err))` once the
/// budget is exhausted, `Ok(None)` to keep retrying.
fn bump_attempt_or_exhaust(
    attempt: &mut u32,
    config: &PublisherConfig,
    err: anyhow::Error,
) -> Result<Option<BridgeError>, BridgeError> {
    *attempt += 1;
    if *attempt >= config.retry_max_attempts {
        return Ok(Some(BridgeError::DownstreamRetryExhausted {
            attempts: *attempt,
            source: err,
        }));
    }
    Ok(None)
}

async fn sleep_before_retry(
    config: &PublisherConfig,
    attempt: u32,
    cancel: &CancellationToken,
) -> Result<(), BridgeError> {
    let delay = backoff::delay_for_attempt(config.retry_base_delay, config.retry_max_delay, attempt - 1);
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(BridgeError::Cancelled),
    }
}

/// Concrete downstream sink backed by `aws-sdk-kinesis`.
pub struct KinesisSink {
    client: Client,
}

impl KinesisSink {
    /// Builds a Kinesis client with the SDK's own retry layer disabled: the
    /// publisher does its own backoff/retry (see `submit_batch_with_retry`)
    /// the same way `S3Bucket::new` disables `aws-sdk-s3`'s retries in favor
    /// of `utils::backoff::retry`.
    pub async fn new(region: &str) -> Self {
        let region_provider = aws_config::Region::new(region.to_string());
        let sleep_impl: Arc<dyn aws_smithy_async::rt::sleep::AsyncSleep> =
            Arc::new(aws_smithy_async::rt::sleep::TokioSleep::new());

        let mut retry_config = aws_config::retry::RetryConfigBuilder::new();
        retry_config.set_max_attempts(Some(1));

        let shared_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region_provider)
            .sleep_impl(aws_smithy_async::rt::sleep::SharedAsyncSleep::from(sleep_impl))
            .retry_config(retry_config.build())
            .load()
            .await;

        Self {
            client: Client::new(&shared_config),
        }
    }
}

#[async_trait]
impl BatchSink for KinesisSink {
    async fn put_records(
        &self,
        stream: &str,
        records: Vec<PutRecord>,
    ) -> Result<Vec<RecordOutcome>, SinkError> {
        let entries: Vec<PutRecordsRequestEntry> = records
            .into_iter()
            .map(|r| {
                PutRecordsRequestEntry::builder()
                    .partition_key(r.partition_key)
                    .data(Blob::new(r.data.to_vec()))
                    .build()
                    .expect("partition_key and data are always set")
            })
            .collect();

        let response = self
            .client
            .put_records()
            .stream_name(stream)
            .set_records(Some(entries))
            .send()
            .await
            .map_err(|err| SinkError::Call { source: anyhow::Error::new(err) })?;

        let outcomes = response
            .records()
            .iter()
            .map(|entry| match entry.error_code() {
                None => RecordOutcome::Success,
                Some(code) => RecordOutcome::Failed {
                    error_code: code.to_string(),
                    error_message: entry.error_message().unwrap_or_default().to_string(),
                },
            })
            .collect();
        Ok(outcomes)
    }
}
