//! The unit of work flowing from the replication reader through the
//! in-flight queue to the publisher.

use bytes::Bytes;

use crate::ack_tracker::AckId;
use crate::queue::Sized_;

/// Fixed overhead added to `payload.len()` for queue accounting; accounts
/// for the partition key string and per-record bookkeeping the downstream
/// record format costs beyond the raw payload bytes.
pub const EVENT_SIZE_OVERHEAD: usize = 64;

#[derive(Debug, Clone)]
pub struct Event {
    pub ack_id: AckId,
    pub lsn: u64,
    pub payload: Bytes,
    pub partition_key: String,
    pub size: usize,
}

impl Event {
    pub fn new(ack_id: AckId, lsn: u64, payload: Bytes, partition_key: String) -> Self {
        let size = payload.len() + EVENT_SIZE_OVERHEAD;
        Self {
            ack_id,
            lsn,
            payload,
            partition_key,
            size,
        }
    }
}

impl Sized_ for Event {
    fn size(&self) -> usize {
        self.size
    }
}
