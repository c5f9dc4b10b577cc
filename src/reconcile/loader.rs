//! Bounded batch queue between an extraction worker and its loader tasks,
//! and the loader loop that drains it into staging.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant};

use super::gate::Gate;
use crate::error::{ReconcileError, Result};
use crate::models::{Side, StagedRow};
use crate::storage::RepositoryStore;

/// Loader poll timeout; bounds how long an idle loader takes to notice completion.
const POP_TIMEOUT: Duration = Duration::from_millis(500);
/// Producer re-check interval while waiting for the queue to drain.
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// A batch holding one unit of queue capacity until it has been staged.
pub struct QueuedBatch {
    pub rows: Vec<StagedRow>,
    _permit: OwnedSemaphorePermit,
}

/// Capacity counts batches that are queued or being inserted, so the bound
/// holds until the rows are actually staged.
pub struct BatchQueue {
    tx: mpsc::UnboundedSender<QueuedBatch>,
    rx: Mutex<mpsc::UnboundedReceiver<QueuedBatch>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    low_water: usize,
    consumers: AtomicUsize,
}

impl BatchQueue {
    pub fn new(capacity: usize, low_water: usize, consumers: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            low_water: low_water.min(capacity - 1),
            consumers: AtomicUsize::new(consumers),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Batches queued or still being written.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight() == 0
    }

    fn has_consumers(&self) -> bool {
        self.consumers.load(Ordering::Acquire) > 0
    }

    fn consumer_exited(&self) {
        self.consumers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Enqueue a batch. When the queue is full the producer blocks until it
    /// drains to the low-water mark.
    pub async fn push(&self, rows: Vec<StagedRow>) -> Result<()> {
        if self.permits.available_permits() == 0 {
            let start = Instant::now();
            while self.in_flight() > self.low_water {
                if !self.has_consumers() {
                    return Err(ReconcileError::Queue("no loader left".into()));
                }
                tokio::time::sleep(DRAIN_POLL).await;
            }
            tracing::debug!(
                "Queue drained to {} after {}ms",
                self.in_flight(),
                start.elapsed().as_millis()
            );
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ReconcileError::Queue(e.to_string()))?;
        self.tx
            .send(QueuedBatch {
                rows,
                _permit: permit,
            })
            .map_err(|e| ReconcileError::Queue(e.to_string()))
    }

    pub async fn pop(&self, timeout: Duration) -> Option<QueuedBatch> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Wait until every queued batch has been staged or no loader is left.
    pub async fn drained(&self) {
        while !self.is_empty() && self.has_consumers() {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

/// Everything one loader task needs.
pub struct Loader {
    pub id: usize,
    pub side: Side,
    pub partition: u32,
    pub staging_table: String,
    pub queue: Arc<BatchQueue>,
    pub gate: Arc<Gate>,
    pub store: RepositoryStore,
}

impl Loader {
    /// Drain the queue until it is empty and both extraction sides are done.
    /// Completion is reported to the gate on every exit path.
    pub async fn run(self) -> Result<u64> {
        let result = self.drain().await;
        self.queue.consumer_exited();
        self.gate.loader_finished();

        match &result {
            Ok(loaded) => tracing::debug!(
                side = %self.side,
                partition = self.partition,
                "Loader {} finished: {} rows",
                self.id,
                loaded
            ),
            Err(e) => tracing::error!(
                side = %self.side,
                partition = self.partition,
                "Loader {} failed: {}",
                self.id,
                e
            ),
        }
        result
    }

    async fn drain(&self) -> Result<u64> {
        let mut loaded = 0u64;
        loop {
            match self.queue.pop(POP_TIMEOUT).await {
                Some(batch) => {
                    self.store
                        .insert_staged(&self.staging_table, &batch.rows)
                        .await?;
                    loaded += batch.rows.len() as u64;
                }
                None => {
                    let gate = self.gate.snapshot();
                    if (self.queue.is_empty() && gate.both_complete()) || self.gate.is_aborted() {
                        return Ok(loaded);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn rows(n: usize) -> Vec<StagedRow> {
        (0..n)
            .map(|i| StagedRow {
                pk_hash: i.to_string(),
                column_hash: "h".into(),
                pk: format!(r#"{{"id":{}}}"#, i),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_producer_blocks_at_capacity_and_resumes_at_low_water() {
        let queue = Arc::new(BatchQueue::new(4, 1, 1));
        for _ in 0..4 {
            queue.push(rows(1)).await.unwrap();
        }
        assert_eq!(queue.in_flight(), 4);

        let resumed = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = queue.clone();
            let resumed = resumed.clone();
            tokio::spawn(async move {
                queue.push(rows(1)).await.unwrap();
                resumed.store(true, Ordering::SeqCst);
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!resumed.load(Ordering::SeqCst));

        // Draining down to two in flight is not enough.
        let first = queue.pop(POP_TIMEOUT).await.unwrap();
        let second = queue.pop(POP_TIMEOUT).await.unwrap();
        drop(first);
        drop(second);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!resumed.load(Ordering::SeqCst));
        assert!(queue.in_flight() <= queue.capacity());

        // At the low-water mark the producer resumes.
        let third = queue.pop(POP_TIMEOUT).await.unwrap();
        drop(third);
        tokio::time::timeout(Duration::from_secs(2), producer)
            .await
            .unwrap()
            .unwrap();
        assert!(resumed.load(Ordering::SeqCst));
        assert_eq!(queue.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_popped_batch_counts_until_dropped() {
        let queue = BatchQueue::new(2, 0, 1);
        queue.push(rows(3)).await.unwrap();
        let batch = queue.pop(POP_TIMEOUT).await.unwrap();
        assert_eq!(batch.rows.len(), 3);
        assert_eq!(queue.in_flight(), 1);
        drop(batch);
        assert!(queue.is_empty());
        assert!(queue.pop(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_without_loaders_fails_instead_of_hanging() {
        let queue = BatchQueue::new(1, 0, 1);
        queue.push(rows(1)).await.unwrap();
        queue.consumer_exited();
        assert!(queue.push(rows(1)).await.is_err());
        tokio::time::timeout(Duration::from_secs(1), queue.drained())
            .await
            .unwrap();
    }
}
