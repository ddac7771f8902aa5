//! Bounded, dual-limit (count + bytes) in-flight event queue.
//!
//! Single producer (the replication reader), single logical consumer (the
//! publisher), though `get`/`task_done` may be called by several publisher
//! workers as long as `task_done` is called exactly once per event. Built
//! from `tokio::sync::mpsc` plus two companion `Semaphore`s (count and
//! bytes), in the spirit of `remote_storage`'s `ConcurrencyLimiter`.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::error::BridgeError;

/// A queued unit of work. `size` is the byte budget this event reserved;
/// it must match what was passed to `put` so `task_done` releases exactly
/// what was acquired.
pub trait Sized_: Send {
    fn size(&self) -> usize;
}

struct Shared {
    count_budget: Semaphore,
    byte_budget: Semaphore,
    closed: std::sync::atomic::AtomicBool,
}

pub struct InflightQueue<T: Sized_> {
    tx: mpsc::Sender<T>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    shared: Arc<Shared>,
}

impl<T: Sized_> InflightQueue<T> {
    pub fn new(max_messages: usize, max_bytes: usize) -> Self {
        let max_messages = max_messages.max(1);
        let (tx, rx) = mpsc::channel(max_messages);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            shared: Arc::new(Shared {
                count_budget: Semaphore::new(max_messages),
                byte_budget: Semaphore::new(max_bytes),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Blocks until a message-count slot and the byte budget both admit
    /// `event`, then enqueues it. Both are held until `task_done` is called
    /// for the event, not until `get` merely removes it from the channel
    /// buffer, so a consumer sitting on dequeued-but-unacked events (e.g. a
    /// batch awaiting submission) still counts against `max_messages` and
    /// `max_bytes`. Events larger than `max_bytes` still fit once the queue
    /// has fully drained (the semaphore eventually accumulates its full
    /// capacity again), matching a FIFO with no head-of-line starve.
    pub async fn put(&self, event: T) -> Result<(), BridgeError> {
        if self.shared.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(BridgeError::QueueClosed);
        }

        // Held, not forgotten, until the send actually lands: if this task
        // is cancelled while blocked here, dropping the permits releases the
        // reservation instead of leaking it.
        let count_permit = self
            .shared
            .count_budget
            .acquire()
            .await
            .map_err(|_| BridgeError::QueueClosed)?;
        let byte_permit = self
            .shared
            .byte_budget
            .acquire_many(event.size().max(1) as u32)
            .await
            .map_err(|_| BridgeError::QueueClosed)?;

        self.tx.send(event).await.map_err(|_| BridgeError::QueueClosed)?;
        count_permit.forget();
        byte_permit.forget();
        Ok(())
    }

    /// Blocks until an event is available. Returns `QueueClosed` once the
    /// queue has been closed and fully drained.
    pub async fn get(&self) -> Result<T, BridgeError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(BridgeError::QueueClosed)
    }

    /// Release the slot and byte reservation for `event`. Must be called
    /// exactly once per event returned by `get`.
    pub fn task_done(&self, event: &T) {
        self.shared.count_budget.add_permits(1);
        self.shared.byte_budget.add_permits(event.size().max(1));
    }

    /// Reject further `put`s; `get` continues draining buffered events and
    /// then surfaces `QueueClosed`.
    pub fn close(&self) {
        self.shared
            .closed
            .store(true, std::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Ev(usize);
    impl Sized_ for Ev {
        fn size(&self) -> usize {
            self.0
        }
    }

    /// Backpressure: put blocks while both limits are saturated.
    #[tokio::test]
    async fn put_blocks_on_byte_budget_until_task_done() {
        let queue = Arc::new(InflightQueue::<Ev>::new(10, 1024));
        queue.put(Ev(500)).await.unwrap();
        queue.put(Ev(500)).await.unwrap();

        let queue2 = queue.clone();
        let blocked = tokio::spawn(async move { queue2.put(Ev(500)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "third put should still be blocked");

        let first = queue.get().await.unwrap();
        queue.task_done(&first);

        blocked.await.unwrap().unwrap();
    }

    /// The count bound is independent of the channel buffer: a dequeued
    /// event that hasn't been `task_done`'d yet (held outside the queue,
    /// e.g. in a batch awaiting submission) still occupies its slot.
    #[tokio::test]
    async fn put_blocks_on_message_count_even_after_get_without_task_done() {
        let queue = Arc::new(InflightQueue::<Ev>::new(2, 1_000_000));
        queue.put(Ev(1)).await.unwrap();
        queue.put(Ev(1)).await.unwrap();

        // Both events are removed from the channel buffer but not yet
        // task_done'd; a third put must still block.
        let held_a = queue.get().await.unwrap();
        let held_b = queue.get().await.unwrap();

        let queue2 = queue.clone();
        let blocked = tokio::spawn(async move { queue2.put(Ev(1)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            !blocked.is_finished(),
            "put should block until a message-count slot is released via task_done"
        );

        queue.task_done(&held_a);
        blocked.await.unwrap().unwrap();
        queue.task_done(&held_b);
    }

    #[tokio::test]
    async fn task_done_releases_accounting_exactly_once() {
        let queue = InflightQueue::<Ev>::new(2, 100);
        queue.put(Ev(40)).await.unwrap();
        let ev = queue.get().await.unwrap();
        queue.task_done(&ev);
        // Budget is back to 100; two more 40-byte events fit without blocking.
        queue.put(Ev(40)).await.unwrap();
        queue.put(Ev(40)).await.unwrap();
    }

    #[tokio::test]
    async fn close_drains_then_rejects() {
        let queue = InflightQueue::<Ev>::new(4, 1024);
        queue.put(Ev(1)).await.unwrap();
        queue.close();

        assert!(matches!(queue.put(Ev(1)).await, Err(BridgeError::QueueClosed)));
        // Already-buffered event still drains.
        assert!(queue.get().await.is_ok());
    }

    #[tokio::test]
    async fn cancelled_put_does_not_leak_byte_accounting() {
        let queue = Arc::new(InflightQueue::<Ev>::new(10, 100));
        queue.put(Ev(100)).await.unwrap(); // fill the byte budget

        let queue2 = queue.clone();
        let blocked = tokio::spawn(async move { queue2.put(Ev(50)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        blocked.abort();
        let _ = blocked.await;

        let ev = queue.get().await.unwrap();
        queue.task_done(&ev);
        // Full budget must be available again; a leaked reservation would
        // make this hang.
        tokio::time::timeout(Duration::from_millis(200), queue.put(Ev(100)))
            .await
            .expect("byte budget leaked by cancelled put")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_put_does_not_leak_count_accounting() {
        let queue = Arc::new(InflightQueue::<Ev>::new(1, 1_000_000));
        queue.put(Ev(1)).await.unwrap(); // fill the one message slot

        let queue2 = queue.clone();
        let blocked = tokio::spawn(async move { queue2.put(Ev(1)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        blocked.abort();
        let _ = blocked.await;

        let ev = queue.get().await.unwrap();
        queue.task_done(&ev);
        tokio::time::timeout(Duration::from_millis(200), queue.put(Ev(1)))
            .await
            .expect("message-count slot leaked by cancelled put")
            .unwrap();
    }
}
