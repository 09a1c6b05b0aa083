//! Render batcher
//!
//! Collapses every drained batch into a single redraw over a fixed-capacity
//! scrolling window. The window owns two parallel pre-allocated buffers so a
//! redraw hands the renderer contiguous slices without allocating.

/// Something that can draw a series
pub trait Renderer {
    /// Redraw the full visible series
    fn redraw(&mut self, xs: &[f64], ys: &[f64]);
}

/// Scrolling window of `(x, y)` points
#[derive(Debug, Clone)]
pub struct RenderWindow {
    xs: Vec<f64>,
    ys: Vec<f64>,
    capacity: usize,
}

impl RenderWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            xs: Vec::with_capacity(capacity),
            ys: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a batch, shifting out the oldest points once full
    ///
    /// The shift happens once per batch regardless of its size.
    pub fn extend(&mut self, points: &[(u64, f64)]) {
        // Only the newest `capacity` points can survive
        let points = &points[points.len().saturating_sub(self.capacity)..];
        let overflow = (self.xs.len() + points.len()).saturating_sub(self.capacity);

        if overflow > 0 {
            let keep = self.xs.len() - overflow;
            self.xs.copy_within(overflow.., 0);
            self.ys.copy_within(overflow.., 0);
            self.xs.truncate(keep);
            self.ys.truncate(keep);
        }

        for &(x, y) in points {
            self.xs.push(x as f64);
            self.ys.push(y);
        }
    }

    /// Change the capacity, keeping the most recent points
    pub fn resize(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        let excess = self.xs.len().saturating_sub(capacity);
        if excess > 0 {
            self.xs.drain(..excess);
            self.ys.drain(..excess);
        }
        self.xs.shrink_to(capacity);
        self.ys.shrink_to(capacity);
        self.xs.reserve_exact(capacity - self.xs.len());
        self.ys.reserve_exact(capacity - self.ys.len());
        self.capacity = capacity;
    }

    pub fn clear(&mut self) {
        self.xs.clear();
        self.ys.clear();
    }

    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.xs.len() == self.capacity
    }
}

/// Feeds batches into a window and redraws once per batch
pub struct RenderBatcher<R: Renderer> {
    window: RenderWindow,
    renderer: R,
    redraws: u64,
}

impl<R: Renderer> RenderBatcher<R> {
    pub fn new(capacity: usize, renderer: R) -> Self {
        Self {
            window: RenderWindow::new(capacity),
            renderer,
            redraws: 0,
        }
    }

    /// Apply a batch and redraw; an empty batch changes nothing
    pub fn push_batch(&mut self, points: &[(u64, f64)]) {
        if points.is_empty() {
            return;
        }
        self.window.extend(points);
        self.redraw();
    }

    /// Empty the window and redraw once
    pub fn clear(&mut self) {
        self.window.clear();
        self.redraw();
    }

    pub fn resize(&mut self, capacity: usize) {
        self.window.resize(capacity);
        self.redraw();
    }

    fn redraw(&mut self) {
        self.renderer.redraw(self.window.xs(), self.window.ys());
        self.redraws += 1;
    }

    pub fn window(&self) -> &RenderWindow {
        &self.window
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    /// Number of redraws issued
    pub fn redraws(&self) -> u64 {
        self.redraws
    }
}

/// Renderer that logs a summary of every redraw
#[derive(Debug, Default)]
pub struct LogRenderer {
    redraws: u64,
}

impl LogRenderer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Renderer for LogRenderer {
    fn redraw(&mut self, xs: &[f64], ys: &[f64]) {
        self.redraws += 1;
        match (xs.first(), xs.last(), ys.last()) {
            (Some(first), Some(last), Some(value)) => tracing::debug!(
                "Redraw {}: {} points, x {}..={}, last value {}",
                self.redraws,
                xs.len(),
                first,
                last,
                value
            ),
            _ => tracing::debug!("Redraw {}: empty", self.redraws),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Remembers what it was asked to draw
    #[derive(Default)]
    struct Recorder {
        frames: Vec<(Vec<f64>, Vec<f64>)>,
    }

    impl Renderer for Recorder {
        fn redraw(&mut self, xs: &[f64], ys: &[f64]) {
            self.frames.push((xs.to_vec(), ys.to_vec()));
        }
    }

    fn points(range: std::ops::Range<u64>) -> Vec<(u64, f64)> {
        range.map(|i| (i, i as f64 * 10.0)).collect()
    }

    #[test]
    fn test_one_redraw_per_batch() {
        let mut batcher = RenderBatcher::new(100, Recorder::default());
        batcher.push_batch(&points(0..50));
        batcher.push_batch(&points(50..51));
        batcher.push_batch(&[]);

        assert_eq!(batcher.redraws(), 2);
        assert_eq!(batcher.renderer().frames.len(), 2);
        assert_eq!(batcher.window().len(), 51);
    }

    #[test]
    fn test_window_scrolls_when_full() {
        let mut window = RenderWindow::new(5);
        window.extend(&points(0..4));
        assert!(!window.is_full());

        window.extend(&points(4..7));
        assert_eq!(window.xs(), &[2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(window.ys(), &[20.0, 30.0, 40.0, 50.0, 60.0]);
    }

    #[test]
    fn test_batch_larger_than_capacity() {
        let mut window = RenderWindow::new(3);
        window.extend(&points(0..2));
        window.extend(&points(2..10));
        assert_eq!(window.xs(), &[7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_resize_keeps_recent() {
        let mut window = RenderWindow::new(10);
        window.extend(&points(0..8));

        window.resize(3);
        assert_eq!(window.xs(), &[5.0, 6.0, 7.0]);
        assert_eq!(window.capacity(), 3);

        window.resize(6);
        window.extend(&points(8..12));
        assert_eq!(window.xs(), &[6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_clear_redraws_empty() {
        let mut batcher = RenderBatcher::new(4, Recorder::default());
        batcher.push_batch(&points(0..3));
        batcher.clear();

        assert_eq!(batcher.redraws(), 2);
        assert!(batcher.renderer().frames[1].0.is_empty());
        assert!(batcher.window().is_empty());
    }
}
