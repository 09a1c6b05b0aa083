//! Acquisition worker
//!
//! A dedicated thread that reads bytes from the active transport, decodes
//! them and pushes samples onto the ingestion queue. It never blocks on the
//! consumer and never retries a lost connection itself; loss is reported to
//! the connection manager through the worker event channel.

use bytes::BytesMut;
use crossbeam_channel::Sender;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::acquisition::queue::IngestionQueue;
use crate::acquisition::sample::{Sample, SequenceCounter};
use crate::acquisition::transport::SharedTransport;
use crate::config::AcquisitionConfig;
use crate::connection::events::{EventHub, SampleEvent};
use crate::connection::state::{ConnectionState, SharedState};
use crate::error::ConnectionError;
use crate::protocol::SampleDecoder;

/// Events the worker reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The link is gone; the worker has exited
    ConnectionLost { reason: String },
}

/// Everything a worker run needs
pub struct WorkerContext {
    pub transport: SharedTransport,
    pub decoder: Box<dyn SampleDecoder>,
    pub queue: IngestionQueue,
    pub state: SharedState,
    /// Next sequence index, shared so it survives reconnects
    pub sequence: SequenceCounter,
    pub samples: EventHub<SampleEvent>,
    pub events: Sender<WorkerEvent>,
    pub config: AcquisitionConfig,
    pub read_chunk: usize,
}

/// How a read failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadFault {
    NoData,
    Transient,
    Lost,
}

fn classify(error: &io::Error) -> ReadFault {
    use io::ErrorKind::*;
    match error.kind() {
        TimedOut | WouldBlock | Interrupted => ReadFault::NoData,
        BrokenPipe | NotConnected | ConnectionReset | ConnectionAborted | ConnectionRefused
        | UnexpectedEof | NotFound | PermissionDenied => ReadFault::Lost,
        _ => ReadFault::Transient,
    }
}

/// Worker counters shared with the thread
#[derive(Default)]
struct Counters {
    samples: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// Handle to the acquisition thread
pub struct AcquisitionWorker {
    /// Whether the thread is running
    running: Arc<AtomicBool>,

    /// Thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Bounded join timeout on stop
    join_timeout: Duration,

    counters: Arc<Counters>,
}

impl AcquisitionWorker {
    pub fn new(join_timeout: Duration) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            join_timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Start the thread
    ///
    /// Does nothing if a worker is already running.
    pub fn start(&mut self, ctx: WorkerContext) -> Result<(), ConnectionError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        // A previous run that exited on its own still needs reaping
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }

        self.counters = Arc::new(Counters::default());
        let counters = self.counters.clone();
        let running = self.running.clone();
        let name = format!("acquire-{}", ctx.decoder.name());

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                run(ctx, &running, &counters);
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ConnectionError::WorkerSpawn(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Signal the thread to stop and wait up to the join timeout
    ///
    /// Returns false if the thread did not finish in time; it is detached
    /// and will exit on its next flag check.
    pub fn stop(&mut self) -> bool {
        self.running.store(false, Ordering::SeqCst);

        let Some(handle) = self.thread_handle.take() else {
            return true;
        };

        let deadline = Instant::now() + self.join_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "Acquisition worker did not stop within {:?}, detaching",
                    self.join_timeout
                );
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }

        if handle.join().is_err() {
            tracing::error!("Acquisition worker panicked");
        }
        true
    }

    /// Check if the thread is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Samples produced by the current run
    pub fn samples_produced(&self) -> u64 {
        self.counters.samples.load(Ordering::Relaxed)
    }

    /// Bytes read by the current run
    pub fn bytes_read(&self) -> u64 {
        self.counters.bytes.load(Ordering::Relaxed)
    }

    /// Values dropped because they were not finite after conversion
    pub fn samples_dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Transient read errors seen by the current run
    pub fn read_errors(&self) -> u64 {
        self.counters.errors.load(Ordering::Relaxed)
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut ctx: WorkerContext, running: &AtomicBool, counters: &Counters) {
    let cfg = ctx.config.clone();
    let mut buf = BytesMut::with_capacity(ctx.read_chunk * 2);
    let mut chunk = vec![0u8; ctx.read_chunk.max(1)];
    let mut consecutive_errors = 0u32;
    let mut last_data = Instant::now();
    let mut window_start = Instant::now();
    let mut window_samples = 0u64;
    let stats_interval = Duration::from_secs(cfg.stats_interval_secs.max(1));

    tracing::info!(
        "Acquisition worker started on {} ({})",
        ctx.transport.lock().describe(),
        ctx.decoder.name()
    );

    let lost_reason = loop {
        if !running.load(Ordering::Relaxed) {
            break None;
        }

        if !ctx.state.is(ConnectionState::Acquiring) {
            thread::sleep(cfg.idle_poll());
            last_data = Instant::now();
            continue;
        }

        let result = ctx.transport.lock().read(&mut chunk);
        let fault = match result {
            Ok(0) => Some(ReadFault::NoData),
            Ok(n) => {
                consecutive_errors = 0;
                last_data = Instant::now();
                counters.bytes.fetch_add(n as u64, Ordering::Relaxed);
                buf.extend_from_slice(&chunk[..n]);
                let values = ctx.decoder.decode_values(&mut buf);
                window_samples += publish(&ctx, values, counters);
                None
            }
            Err(e) => match classify(&e) {
                ReadFault::Lost => break Some(e.to_string()),
                ReadFault::Transient => {
                    consecutive_errors += 1;
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Read error ({} in a row): {}", consecutive_errors, e);
                    if consecutive_errors > cfg.max_consecutive_errors {
                        break Some(format!(
                            "{} consecutive read errors, last: {}",
                            consecutive_errors, e
                        ));
                    }
                    Some(ReadFault::Transient)
                }
                ReadFault::NoData => Some(ReadFault::NoData),
            },
        };

        match fault {
            Some(ReadFault::NoData) => {
                if let Some(timeout) = cfg.data_timeout() {
                    if last_data.elapsed() > timeout {
                        break Some(format!("no data for {:?}", timeout));
                    }
                }
                thread::sleep(cfg.empty_read_sleep());
            }
            Some(ReadFault::Transient) => thread::sleep(cfg.error_backoff()),
            _ => {}
        }

        if window_start.elapsed() >= stats_interval {
            let secs = window_start.elapsed().as_secs_f64();
            tracing::info!(
                "Acquired {} samples in {:.1}s ({:.1}/s), queue depth {}",
                window_samples,
                secs,
                window_samples as f64 / secs,
                ctx.queue.len()
            );
            window_start = Instant::now();
            window_samples = 0;
        }
    };

    match lost_reason {
        Some(reason) => {
            tracing::error!("Connection lost: {}", reason);
            let _ = ctx.events.send(WorkerEvent::ConnectionLost { reason });
        }
        None => tracing::info!("Acquisition worker stopped"),
    }
}

/// Stamp, enqueue and announce decoded values; returns how many were kept
fn publish(ctx: &WorkerContext, values: Vec<f64>, counters: &Counters) -> u64 {
    let mut kept = 0;
    let announce = ctx.samples.has_subscribers();
    let mut next = ctx.sequence.lock();

    for raw in values {
        let value = raw * ctx.config.unit_scale;
        if !value.is_finite() {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Dropping non-numeric sample {}", raw);
            continue;
        }

        let index = *next;
        *next += 1;
        ctx.queue.enqueue(Sample::new(index, value));
        if announce {
            ctx.samples.publish(SampleEvent { index, value });
        }
        kept += 1;
    }

    counters.samples.fetch_add(kept, Ordering::Relaxed);
    kept
}
