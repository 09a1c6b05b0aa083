//! Ingestion queue between the acquisition thread and the consumer
//!
//! The only structure touched by both contexts. Producers never block;
//! the consumer drains everything queued at the time of the call.

use crossbeam::queue::{ArrayQueue, SegQueue};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::acquisition::sample::Sample;

/// What a bounded queue does when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the incoming sample
    DropNewest,
    /// Evict the oldest queued sample
    DropOldest,
}

/// Queue bound
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueCapacity {
    /// Grow as needed; completeness over memory
    #[default]
    Unbounded,
    Bounded {
        capacity: usize,
        overflow: OverflowPolicy,
    },
}

enum Storage {
    Unbounded(SegQueue<Sample>),
    Bounded(ArrayQueue<Sample>, OverflowPolicy),
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::Unbounded(q) => q.len(),
            Storage::Bounded(q, _) => q.len(),
        }
    }

    fn pop(&self) -> Option<Sample> {
        match self {
            Storage::Unbounded(q) => q.pop(),
            Storage::Bounded(q, _) => q.pop(),
        }
    }
}

struct Inner {
    storage: Storage,
    high_water_mark: usize,
    above_mark: AtomicBool,
    high_water_hits: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

/// Cloneable handle to the shared queue
#[derive(Clone)]
pub struct IngestionQueue {
    inner: Arc<Inner>,
}

impl IngestionQueue {
    /// Create a queue with the given bound and backpressure threshold
    pub fn new(capacity: QueueCapacity, high_water_mark: usize) -> Self {
        let storage = match capacity {
            QueueCapacity::Unbounded => Storage::Unbounded(SegQueue::new()),
            QueueCapacity::Bounded { capacity, overflow } => {
                Storage::Bounded(ArrayQueue::new(capacity.max(1)), overflow)
            }
        };
        Self {
            inner: Arc::new(Inner {
                storage,
                high_water_mark: high_water_mark.max(1),
                above_mark: AtomicBool::new(false),
                high_water_hits: AtomicU64::new(0),
                enqueued: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Unbounded queue
    pub fn unbounded(high_water_mark: usize) -> Self {
        Self::new(QueueCapacity::Unbounded, high_water_mark)
    }

    /// Push a sample without blocking
    ///
    /// Returns false if a bounded queue rejected or evicted a sample.
    pub fn enqueue(&self, sample: Sample) -> bool {
        let inner = &*self.inner;
        let accepted = match &inner.storage {
            Storage::Unbounded(q) => {
                q.push(sample);
                true
            }
            Storage::Bounded(q, OverflowPolicy::DropNewest) => q.push(sample).is_ok(),
            Storage::Bounded(q, OverflowPolicy::DropOldest) => q.force_push(sample).is_none(),
        };

        if accepted {
            inner.enqueued.fetch_add(1, Ordering::Relaxed);
        } else {
            if matches!(inner.storage, Storage::Bounded(_, OverflowPolicy::DropOldest)) {
                inner.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            inner.dropped.fetch_add(1, Ordering::Relaxed);
        }

        let depth = inner.storage.len();
        if depth >= inner.high_water_mark && !inner.above_mark.swap(true, Ordering::AcqRel) {
            inner.high_water_hits.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Ingestion queue depth {} reached high-water mark {}",
                depth,
                inner.high_water_mark
            );
        }

        accepted
    }

    /// Remove every sample queued at the time of the call, in order
    ///
    /// Samples pushed while draining are left for the next call.
    pub fn drain_all(&self) -> Vec<Sample> {
        let inner = &*self.inner;
        let pending = inner.storage.len();
        let mut batch = Vec::with_capacity(pending);
        while batch.len() < pending {
            match inner.storage.pop() {
                Some(sample) => batch.push(sample),
                None => break,
            }
        }

        if inner.storage.len() < inner.high_water_mark {
            inner.above_mark.store(false, Ordering::Release);
        }
        batch
    }

    /// Discard everything queued, returning how many samples were dropped
    pub fn clear(&self) -> usize {
        let mut cleared = 0;
        while self.inner.storage.pop().is_some() {
            cleared += 1;
        }
        self.inner.above_mark.store(false, Ordering::Release);
        cleared
    }

    /// Current depth
    pub fn len(&self) -> usize {
        self.inner.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the depth is currently above the high-water mark
    pub fn is_above_high_water(&self) -> bool {
        self.inner.above_mark.load(Ordering::Acquire)
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        let inner = &*self.inner;
        QueueStats {
            depth: inner.storage.len(),
            capacity: match &inner.storage {
                Storage::Unbounded(_) => None,
                Storage::Bounded(q, _) => Some(q.capacity()),
            },
            high_water_mark: inner.high_water_mark,
            high_water_hits: inner.high_water_hits.load(Ordering::Relaxed),
            enqueued: inner.enqueued.load(Ordering::Relaxed),
            dropped: inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        self.inner.high_water_hits.store(0, Ordering::Relaxed);
        self.inner.enqueued.store(0, Ordering::Relaxed);
        self.inner.dropped.store(0, Ordering::Relaxed);
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    /// `None` when unbounded
    pub capacity: Option<usize>,
    pub high_water_mark: usize,
    /// Times the depth crossed the high-water mark
    pub high_water_hits: u64,
    pub enqueued: u64,
    /// Samples lost to the overflow policy
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn sample(index: u64) -> Sample {
        Sample::new(index, index as f64)
    }

    #[test]
    fn test_drain_preserves_order() {
        let queue = IngestionQueue::unbounded(100);
        for i in 0..10 {
            assert!(queue.enqueue(sample(i)));
        }
        let batch = queue.drain_all();
        let indices: Vec<u64> = batch.iter().map(|s| s.index).collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn test_high_water_mark_warns_once_per_crossing() {
        let queue = IngestionQueue::unbounded(3);
        for i in 0..5 {
            queue.enqueue(sample(i));
        }
        assert!(queue.is_above_high_water());
        assert_eq!(queue.stats().high_water_hits, 1);

        queue.drain_all();
        assert!(!queue.is_above_high_water());

        for i in 5..8 {
            queue.enqueue(sample(i));
        }
        assert_eq!(queue.stats().high_water_hits, 2);
        // Producer is never refused by an unbounded queue
        assert_eq!(queue.stats().dropped, 0);
    }

    #[test]
    fn test_bounded_drop_newest() {
        let queue = IngestionQueue::new(
            QueueCapacity::Bounded {
                capacity: 2,
                overflow: OverflowPolicy::DropNewest,
            },
            100,
        );
        assert!(queue.enqueue(sample(0)));
        assert!(queue.enqueue(sample(1)));
        assert!(!queue.enqueue(sample(2)));

        let indices: Vec<u64> = queue.drain_all().iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_bounded_drop_oldest() {
        let queue = IngestionQueue::new(QueueCapacity::drop_oldest(2), 100);
        for i in 0..4 {
            queue.enqueue(sample(i));
        }
        let indices: Vec<u64> = queue.drain_all().iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![2, 3]);
        assert_eq!(queue.stats().dropped, 2);
    }

    #[test]
    fn test_concurrent_producer_loses_nothing() {
        let queue = IngestionQueue::unbounded(1_000_000);
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..10_000 {
                    queue.enqueue(sample(i));
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 10_000 {
            received.extend(queue.drain_all());
            thread::yield_now();
        }
        producer.join().unwrap();

        assert_eq!(received.len(), 10_000);
        assert!(received.windows(2).all(|w| w[0].index < w[1].index));
    }

    #[test]
    fn test_clear_counts_discarded() {
        let queue = IngestionQueue::unbounded(10);
        queue.enqueue(sample(0));
        queue.enqueue(sample(1));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
