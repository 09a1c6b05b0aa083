//! Dual-tier session store
//!
//! Every drained batch lands in two places: an unbounded durable record used
//! for export, and a bounded display window that evicts the oldest samples.
//! Both are owned by the consumer context, so no locking is needed here.

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::time::Instant;
use uuid::Uuid;

use crate::acquisition::queue::QueueStats;
use crate::acquisition::sample::Sample;
use crate::storage::stats::{RunningStats, Statistics};

/// Bounded FIFO of the most recent samples
#[derive(Debug, Clone)]
pub struct DisplayWindow {
    samples: VecDeque<Sample>,
    max_history: usize,
}

impl DisplayWindow {
    pub fn new(max_history: usize) -> Self {
        let max_history = max_history.max(1);
        Self {
            samples: VecDeque::with_capacity(max_history),
            max_history,
        }
    }

    pub fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.max_history {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Change the bound, keeping the most recent samples
    pub fn set_max_history(&mut self, max_history: usize) {
        self.max_history = max_history.max(1);
        let excess = self.samples.len().saturating_sub(self.max_history);
        self.samples.drain(..excess);
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Pipeline counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerformanceCounters {
    /// Samples absorbed this session
    pub total_received: u64,
    /// Size of the last drained batch
    pub last_drain: usize,
    /// Queue depth seen at the last drain
    pub queue_depth: usize,
    /// High-water crossings reported by the queue
    pub high_water_hits: u64,
    /// Samples refused because they were out of order
    pub rejected: u64,
    /// Queue drops reported by a bounded queue
    pub queue_dropped: u64,
    /// Drains performed
    pub drains: u64,
}

/// Session data: durable record, display window and counters
pub struct SessionStore {
    durable: Vec<Sample>,
    window: DisplayWindow,
    counters: PerformanceCounters,
    stats: RunningStats,
    latest: Option<Sample>,
    session_id: Uuid,
    started_at: DateTime<Local>,
    last_drain_at: Option<Instant>,
}

impl SessionStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            durable: Vec::new(),
            window: DisplayWindow::new(max_history),
            counters: PerformanceCounters::default(),
            stats: RunningStats::new(),
            latest: None,
            session_id: Uuid::new_v4(),
            started_at: Local::now(),
            last_drain_at: None,
        }
    }

    /// Append a drained batch to both tiers
    ///
    /// Samples whose index does not follow the last stored one are refused.
    /// Returns the newest stored sample, if any.
    pub fn absorb(&mut self, batch: Vec<Sample>) -> Option<Sample> {
        let mut accepted = 0usize;

        for sample in batch {
            if let Some(last) = self.durable.last() {
                if sample.index <= last.index {
                    self.counters.rejected += 1;
                    tracing::warn!(
                        "Rejected out-of-order sample {} after {}",
                        sample.index,
                        last.index
                    );
                    continue;
                }
            }
            self.stats.push(sample.value);
            self.window.push(sample);
            self.durable.push(sample);
            self.latest = Some(sample);
            accepted += 1;
        }

        self.counters.total_received += accepted as u64;
        self.counters.last_drain = accepted;
        self.counters.drains += 1;
        self.last_drain_at = Some(Instant::now());
        if accepted > 0 {
            tracing::debug!(
                "Absorbed {} samples ({} total)",
                accepted,
                self.counters.total_received
            );
            self.latest
        } else {
            None
        }
    }

    /// Record the queue state observed by the last drain
    pub fn record_queue(&mut self, depth: usize, stats: &QueueStats) {
        self.counters.queue_depth = depth;
        self.counters.high_water_hits = stats.high_water_hits;
        self.counters.queue_dropped = stats.dropped;
    }

    /// Start a new session: empties both tiers and all counters
    pub fn reset(&mut self) {
        let discarded = self.durable.len();
        self.durable.clear();
        self.window.clear();
        self.counters = PerformanceCounters::default();
        self.stats.reset();
        self.latest = None;
        self.session_id = Uuid::new_v4();
        self.started_at = Local::now();
        self.last_drain_at = None;
        tracing::info!(
            "Session reset ({} samples discarded), new session {}",
            discarded,
            self.session_id
        );
    }

    pub fn set_max_history(&mut self, max_history: usize) {
        self.window.set_max_history(max_history);
    }

    /// Get the durable record
    pub fn samples(&self) -> &[Sample] {
        &self.durable
    }

    /// Get the display window
    pub fn window(&self) -> &DisplayWindow {
        &self.window
    }

    /// Get the newest sample
    pub fn latest(&self) -> Option<Sample> {
        self.latest
    }

    pub fn len(&self) -> usize {
        self.durable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durable.is_empty()
    }

    pub fn counters(&self) -> &PerformanceCounters {
        &self.counters
    }

    pub fn statistics(&self) -> Statistics {
        self.stats.snapshot()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Time since the last drain
    pub fn since_last_drain(&self) -> Option<std::time::Duration> {
        self.last_drain_at.map(|at| at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(range: std::ops::Range<u64>) -> Vec<Sample> {
        range.map(|i| Sample::new(i, i as f64 * 2.0)).collect()
    }

    #[test]
    fn test_absorb_fills_both_tiers() {
        let mut store = SessionStore::new(5);
        let latest = store.absorb(batch(0..8)).unwrap();

        assert_eq!(latest.index, 7);
        assert_eq!(store.len(), 8);
        assert_eq!(store.window().len(), 5);
        let window: Vec<u64> = store.window().iter().map(|s| s.index).collect();
        assert_eq!(window, vec![3, 4, 5, 6, 7]);
        assert_eq!(store.counters().total_received, 8);
        assert_eq!(store.counters().last_drain, 8);
    }

    #[test]
    fn test_empty_batch() {
        let mut store = SessionStore::new(5);
        store.absorb(batch(0..2));
        assert!(store.absorb(Vec::new()).is_none());
        assert_eq!(store.latest().unwrap().index, 1);
        assert_eq!(store.counters().last_drain, 0);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut store = SessionStore::new(10);
        store.absorb(batch(0..3));
        let latest = store.absorb(vec![Sample::new(1, 0.0), Sample::new(3, 6.0)]);

        assert_eq!(latest.unwrap().index, 3);
        assert_eq!(store.len(), 4);
        assert_eq!(store.counters().rejected, 1);
        assert!(store.samples().windows(2).all(|w| w[0].index < w[1].index));
    }

    #[test]
    fn test_durable_never_shorter_than_window() {
        let mut store = SessionStore::new(3);
        for start in (0..30).step_by(3) {
            store.absorb(batch(start..start + 3));
            assert!(store.len() >= store.window().len());
            assert!(store.window().len() <= 3);
        }
    }

    #[test]
    fn test_reset_clears_everything() {
        fn assert_cleared(store: &SessionStore) {
            assert!(store.is_empty());
            assert!(store.window().is_empty());
            assert!(store.latest().is_none());
            assert_eq!(*store.counters(), PerformanceCounters::default());
            assert_eq!(store.statistics().count, 0);
        }

        let mut store = SessionStore::new(4);
        store.absorb(batch(0..6));
        store.absorb(batch(2..4));
        assert!(store.counters().rejected > 0);
        let old_id = store.session_id();

        store.reset();
        assert_cleared(&store);
        let first_id = store.session_id();
        assert_ne!(first_id, old_id);

        // A second reset leaves the store just as empty
        store.reset();
        assert_cleared(&store);
        assert_ne!(store.session_id(), first_id);

        // Numbering restarts after a reset
        assert!(store.absorb(batch(0..1)).is_some());
    }

    #[test]
    fn test_set_max_history_keeps_recent() {
        let mut store = SessionStore::new(10);
        store.absorb(batch(0..10));
        store.set_max_history(3);

        let window: Vec<u64> = store.window().iter().map(|s| s.index).collect();
        assert_eq!(window, vec![7, 8, 9]);
        assert_eq!(store.len(), 10);

        store.set_max_history(6);
        store.absorb(batch(10..12));
        assert_eq!(store.window().len(), 5);
    }

    #[test]
    fn test_statistics_follow_durable() {
        let mut store = SessionStore::new(2);
        store.absorb(vec![Sample::new(0, 1.0), Sample::new(1, 3.0), Sample::new(2, 5.0)]);
        let stats = store.statistics();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
        assert!((stats.mean - 3.0).abs() < 1e-12);
    }
}
