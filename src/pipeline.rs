//! Consumer context
//!
//! Drains the ingestion queue on a fixed interval, absorbs each batch into the
//! session store and hands it to the render batcher as one redraw. The same
//! tick polls the connection manager so reconnection runs on this thread.

use crossbeam_channel::{select, tick};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::acquisition::queue::IngestionQueue;
use crate::acquisition::sample::Sample;
use crate::config::StorageConfig;
use crate::connection::events::{Severity, StatusEvent, StatusKind};
use crate::connection::manager::ConnectionManager;
use crate::render::batcher::{RenderBatcher, Renderer};
use crate::storage::store::SessionStore;

/// What one drain did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Samples absorbed
    pub drained: usize,
    /// Newest sample after the drain
    pub latest: Option<Sample>,
    /// Queue depth before draining
    pub queue_depth_before: usize,
    /// The queue crossed its high-water mark since the last drain
    pub backpressure: bool,
}

/// Queue, store and batcher driven together
pub struct Pipeline<R: Renderer> {
    queue: IngestionQueue,
    store: SessionStore,
    batcher: RenderBatcher<R>,
    drain_interval: Duration,
    seen_high_water_hits: u64,
}

impl<R: Renderer> Pipeline<R> {
    pub fn new(queue: IngestionQueue, config: &StorageConfig, renderer: R) -> Self {
        Self {
            queue,
            store: SessionStore::new(config.max_history),
            batcher: RenderBatcher::new(config.render_capacity, renderer),
            drain_interval: config.drain_interval(),
            seen_high_water_hits: 0,
        }
    }

    /// Drain everything queued and push it through store and batcher
    pub fn tick(&mut self) -> DrainReport {
        let queue_depth_before = self.queue.len();
        let batch = self.queue.drain_all();
        let stats = self.queue.stats();

        let backpressure = stats.high_water_hits > self.seen_high_water_hits;
        self.seen_high_water_hits = stats.high_water_hits;
        self.store.record_queue(queue_depth_before, &stats);

        if batch.is_empty() {
            return DrainReport {
                drained: 0,
                latest: self.store.latest(),
                queue_depth_before,
                backpressure,
            };
        }

        let before = self.store.counters().total_received;
        let latest = self.store.absorb(batch);
        let drained = (self.store.counters().total_received - before) as usize;

        // Accepted samples are the tail of the durable record
        let samples = self.store.samples();
        let points: Vec<(u64, f64)> = samples[samples.len() - drained..]
            .iter()
            .map(Sample::point)
            .collect();
        self.batcher.push_batch(&points);

        tracing::trace!("Drained {} samples (queue depth {})", drained, queue_depth_before);
        DrainReport {
            drained,
            latest,
            queue_depth_before,
            backpressure,
        }
    }

    /// Tick at the drain interval until `stop` is set
    ///
    /// Each tick first lets the manager handle worker events and pending
    /// reconnects, then drains. Backpressure becomes a status event.
    pub fn run(&mut self, manager: &mut ConnectionManager, stop: &AtomicBool) {
        let ticker = tick(self.drain_interval);
        tracing::info!("Drain loop running every {:?}", self.drain_interval);

        while !stop.load(Ordering::SeqCst) {
            select! {
                recv(ticker) -> _ => {
                    manager.poll();
                    let report = self.tick();
                    if report.backpressure {
                        manager.notify(StatusEvent::new(
                            StatusKind::Backpressure {
                                depth: report.queue_depth_before,
                            },
                            Severity::Warning,
                            format!(
                                "Queue above high-water mark ({} samples waiting)",
                                report.queue_depth_before
                            ),
                        ));
                    }
                }
            }
        }

        // Pick up whatever arrived after the last tick
        manager.poll();
        self.tick();
        tracing::info!("Drain loop stopped with {} samples stored", self.store.len());
    }

    /// Discard the session: queue, store, window and sample numbering
    pub fn reset_session(&mut self, manager: &ConnectionManager) {
        let dropped = manager.reset_sequence() + self.queue.clear();
        self.store.reset();
        self.batcher.clear();
        self.seen_high_water_hits = self.queue.stats().high_water_hits;
        if dropped > 0 {
            tracing::debug!("Dropped {} queued samples on reset", dropped);
        }
    }

    pub fn set_max_history(&mut self, max_history: usize) {
        self.store.set_max_history(max_history);
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn batcher(&self) -> &RenderBatcher<R> {
        &self.batcher
    }

    pub fn queue(&self) -> &IngestionQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingRenderer {
        redraws: usize,
        last_len: usize,
        last_xs: Vec<f64>,
    }

    impl Renderer for CountingRenderer {
        fn redraw(&mut self, xs: &[f64], _ys: &[f64]) {
            self.redraws += 1;
            self.last_len = xs.len();
            self.last_xs = xs.to_vec();
        }
    }

    fn config() -> StorageConfig {
        StorageConfig {
            max_history: 4,
            render_capacity: 4,
            high_water_mark: 10,
            ..Default::default()
        }
    }

    fn pipeline() -> Pipeline<CountingRenderer> {
        let config = config();
        let queue = IngestionQueue::unbounded(config.high_water_mark);
        Pipeline::new(queue, &config, CountingRenderer::default())
    }

    fn feed(queue: &IngestionQueue, range: std::ops::Range<u64>) {
        for i in range {
            queue.enqueue(Sample::new(i, i as f64));
        }
    }

    #[test]
    fn test_tick_moves_batch_through() {
        let mut p = pipeline();
        feed(p.queue(), 0..6);

        let report = p.tick();
        assert_eq!(report.drained, 6);
        assert_eq!(report.queue_depth_before, 6);
        assert_eq!(report.latest.unwrap().index, 5);
        assert!(!report.backpressure);

        assert!(p.queue().is_empty());
        assert_eq!(p.store().len(), 6);
        assert_eq!(p.store().window().len(), 4);
        assert_eq!(p.batcher().renderer().redraws, 1);
        assert_eq!(p.batcher().renderer().last_len, 4);
    }

    #[test]
    fn test_rejected_samples_are_not_drawn() {
        let mut p = pipeline();
        feed(p.queue(), 0..3);
        p.tick();

        for i in [2, 5, 1, 6] {
            p.queue().enqueue(Sample::new(i, i as f64));
        }
        let report = p.tick();
        assert_eq!(report.drained, 2);
        assert_eq!(p.store().counters().rejected, 2);
        assert_eq!(p.batcher().renderer().last_xs, vec![1.0, 2.0, 5.0, 6.0]);

        // A batch refused entirely leaves the plot alone
        p.queue().enqueue(Sample::new(4, 4.0));
        assert_eq!(p.tick().drained, 0);
        assert_eq!(p.batcher().renderer().redraws, 2);
    }

    #[test]
    fn test_empty_tick_does_not_redraw() {
        let mut p = pipeline();
        let report = p.tick();
        assert_eq!(report.drained, 0);
        assert!(report.latest.is_none());
        assert_eq!(p.batcher().redraws(), 0);
    }

    #[test]
    fn test_backpressure_reported_once_per_crossing() {
        let mut p = pipeline();
        feed(p.queue(), 0..15);
        assert!(p.tick().backpressure);

        feed(p.queue(), 15..17);
        assert!(!p.tick().backpressure);

        feed(p.queue(), 17..30);
        assert!(p.tick().backpressure);
    }

    #[test]
    fn test_reset_session() {
        let config = crate::config::AppConfig::default();
        let manager = ConnectionManager::new(&config, IngestionQueue::unbounded(100));

        let mut p = pipeline();
        feed(p.queue(), 0..3);
        p.tick();
        feed(p.queue(), 3..5);

        p.reset_session(&manager);
        assert!(p.queue().is_empty());
        assert_eq!(p.store().counters().total_received, 0);
        assert!(p.store().is_empty());
        assert!(p.batcher().window().is_empty());
        assert_eq!(manager.next_sequence(), 0);

        feed(p.queue(), 0..2);
        assert_eq!(p.tick().drained, 2);
    }
}
