//! Decoded measurement sample

use chrono::{DateTime, Local};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One decoded event
///
/// Samples are immutable once the worker creates them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Sequence index assigned at decode time
    pub index: u64,
    /// Decoded payload after unit conversion
    pub value: f64,
    /// Wall-clock arrival time
    pub timestamp: DateTime<Local>,
}

impl Sample {
    /// Create a sample stamped with the current time
    pub fn new(index: u64, value: f64) -> Self {
        Self::at(index, value, Local::now())
    }

    pub fn at(index: u64, value: f64, timestamp: DateTime<Local>) -> Self {
        Self {
            index,
            value,
            timestamp,
        }
    }

    /// `(index, value)` pair handed to renderers
    pub fn point(&self) -> (u64, f64) {
        (self.index, self.value)
    }
}

/// Next sequence index, shared between the worker and the session owner
///
/// The worker holds the lock while it numbers and enqueues a batch, so a
/// restart can never interleave with a half-published batch.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    next: Arc<Mutex<u64>>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the counter for numbering a batch
    pub fn lock(&self) -> MutexGuard<'_, u64> {
        self.next.lock()
    }

    /// Get the index the next sample will receive
    pub fn peek(&self) -> u64 {
        *self.next.lock()
    }

    /// Restart at zero and run `under_lock` before the worker can number again
    pub fn restart<R>(&self, under_lock: impl FnOnce() -> R) -> R {
        let mut next = self.next.lock();
        *next = 0;
        under_lock()
    }
}
