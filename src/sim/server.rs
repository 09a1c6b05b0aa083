//! Simulation server threads
//!
//! UDP: clients register with a `CONNECT:<ip>:<port>` datagram and the server
//! streams one record per datagram to the most recent client. TCP: every
//! accepted client gets its own streaming thread.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::acquisition::transport::UDP_CONNECT_PREFIX;
use crate::config::SimulatorConfig;
use crate::error::SimError;
use crate::protocol::SimRecord;
use crate::sim::{SimProtocol, SimTiming};

/// Longest delay between two records, whatever the timing
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Poll interval of the TCP accept loop
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Longest uninterrupted sleep before the stop flag is checked again
const MAX_NAP: Duration = Duration::from_millis(50);

/// Computes the delay before each record
struct Pacer {
    timing: SimTiming,
    rng: ChaCha8Rng,
    previous_time: Option<f64>,
}

impl Pacer {
    fn new(timing: SimTiming, seed: u64) -> Self {
        Self {
            timing,
            rng: ChaCha8Rng::seed_from_u64(seed),
            previous_time: None,
        }
    }

    fn interval(rate_hz: f64) -> Duration {
        if rate_hz > 0.0 && rate_hz.is_finite() {
            clamp_secs(1.0 / rate_hz)
        } else {
            Duration::from_millis(10)
        }
    }

    /// Delay to wait before sending `record`
    fn delay_before(&mut self, record: &SimRecord) -> Duration {
        match self.timing {
            SimTiming::Fixed { rate_hz } => Self::interval(rate_hz),
            SimTiming::Jitter { rate_hz, jitter_ms } => {
                let base = Self::interval(rate_hz).as_secs_f64();
                let jitter = if jitter_ms.is_finite() {
                    (jitter_ms.abs() / 1000.0).min(MAX_DELAY.as_secs_f64())
                } else {
                    0.0
                };
                let offset = if jitter > 0.0 {
                    self.rng.gen_range(-jitter..=jitter)
                } else {
                    0.0
                };
                clamp_secs(base + offset)
            }
            SimTiming::Replay => {
                let gap = match self.previous_time {
                    Some(prev) => {
                        let us = record.current_time - prev;
                        if us.is_finite() && us > 0.0 {
                            clamp_secs(us / 1_000_000.0)
                        } else {
                            Duration::ZERO
                        }
                    }
                    None => Duration::ZERO,
                };
                self.previous_time = Some(record.current_time);
                gap
            }
        }
    }

    /// Forget the previous timestamp when a loop restarts
    fn restart(&mut self) {
        self.previous_time = None;
    }
}

/// Convert seconds to a delay within `[0, MAX_DELAY]`
fn clamp_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_DELAY)
        .min(MAX_DELAY)
}

/// Sleep up to `duration`, returning early once `running` is cleared
fn nap(running: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(MAX_NAP));
    }
}

/// Address announced in a `CONNECT` datagram
///
/// Falls back to the datagram's source when the payload is not a usable
/// address.
fn parse_registration(payload: &str, from: SocketAddr) -> Option<SocketAddr> {
    let rest = payload.trim().strip_prefix(UDP_CONNECT_PREFIX)?;
    let announced = rest
        .rsplit_once(':')
        .and_then(|(ip, port)| Some((ip.parse::<IpAddr>().ok()?, port.parse::<u16>().ok()?)));

    Some(match announced {
        Some((ip, port)) if !ip.is_unspecified() => SocketAddr::new(ip, port),
        Some((_, port)) => SocketAddr::new(from.ip(), port),
        None => from,
    })
}

/// State shared by the server threads
struct Shared {
    records: Arc<Vec<SimRecord>>,
    timing: SimTiming,
    looped: bool,
    seed: u64,
    running: Arc<AtomicBool>,
    lines_sent: Arc<AtomicU64>,
}

/// Record streaming server
pub struct SimServer {
    config: SimulatorConfig,
    records: Arc<Vec<SimRecord>>,
    seed: u64,

    /// Whether the server threads are running
    running: Arc<AtomicBool>,

    /// Main thread handle
    thread_handle: Option<JoinHandle<()>>,

    lines_sent: Arc<AtomicU64>,
    local_addr: Option<SocketAddr>,
}

impl SimServer {
    pub fn new(config: SimulatorConfig, records: Vec<SimRecord>) -> Result<Self, SimError> {
        if records.is_empty() {
            return Err(SimError::NoRecords);
        }
        Ok(Self {
            config,
            records: Arc::new(records),
            seed: 0,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            lines_sent: Arc::new(AtomicU64::new(0)),
            local_addr: None,
        })
    }

    /// Seed for the jitter RNG
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Bind and start serving; returns the bound address
    pub fn start(&mut self) -> Result<SocketAddr, SimError> {
        if self.running.load(Ordering::SeqCst) {
            if let Some(addr) = self.local_addr {
                return Ok(addr);
            }
        }

        let bind = (self.config.bind_address.as_str(), self.config.port);
        self.running.store(true, Ordering::SeqCst);
        let shared = Shared {
            records: self.records.clone(),
            timing: self.config.timing,
            looped: self.config.looped,
            seed: self.seed,
            running: self.running.clone(),
            lines_sent: self.lines_sent.clone(),
        };

        let (addr, spawned) = match self.config.protocol {
            SimProtocol::Udp => {
                let socket = UdpSocket::bind(bind)?;
                socket.set_read_timeout(Some(Duration::from_millis(1)))?;
                let addr = socket.local_addr()?;
                (addr, spawn("sim-udp", move || serve_udp(socket, shared)))
            }
            SimProtocol::Tcp => {
                let listener = TcpListener::bind(bind)?;
                listener.set_nonblocking(true)?;
                let addr = listener.local_addr()?;
                (addr, spawn("sim-tcp", move || serve_tcp(listener, shared)))
            }
        };

        match spawned {
            Ok(handle) => self.thread_handle = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(SimError::Spawn(e.to_string()));
            }
        }

        self.local_addr = Some(addr);
        tracing::info!(
            "Simulation server on {}://{} with {} records ({:?}, loop {})",
            self.config.protocol,
            addr,
            self.records.len(),
            self.config.timing,
            self.config.looped
        );
        Ok(addr)
    }

    /// Stop all server threads and wait for them
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Simulation server thread panicked");
            }
            tracing::info!(
                "Simulation server stopped after {} lines",
                self.lines_sent()
            );
        }
    }

    /// Whether the server is still serving
    ///
    /// Turns false on its own once a non-looping UDP run is exhausted.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Lines sent to all clients
    pub fn lines_sent(&self) -> u64 {
        self.lines_sent.load(Ordering::Relaxed)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn<F>(name: &str, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}

fn serve_udp(socket: UdpSocket, shared: Shared) {
    let mut pacer = Pacer::new(shared.timing, shared.seed);
    let mut client: Option<SocketAddr> = None;
    let mut buf = [0u8; 256];
    let mut index = 0usize;
    let mut next_send = Instant::now();

    while shared.running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                let payload = String::from_utf8_lossy(&buf[..n]);
                match parse_registration(&payload, from) {
                    Some(addr) => {
                        if client != Some(addr) {
                            tracing::info!("UDP client registered: {}", addr);
                        }
                        client = Some(addr);
                        next_send = Instant::now();
                    }
                    None => tracing::debug!("Ignoring datagram from {}", from),
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                tracing::warn!("UDP receive error: {}", e);
                thread::sleep(Duration::from_millis(10));
            }
        }

        let Some(target) = client else {
            continue;
        };
        if Instant::now() < next_send {
            continue;
        }

        let record = &shared.records[index];
        let line = format!("{}\n", record.to_line());
        match socket.send_to(line.as_bytes(), target) {
            Ok(_) => {
                shared.lines_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::warn!("UDP send to {} failed: {}", target, e),
        }

        index += 1;
        if index == shared.records.len() {
            if !shared.looped {
                tracing::info!("All {} records sent", shared.records.len());
                shared.running.store(false, Ordering::SeqCst);
                break;
            }
            index = 0;
            pacer.restart();
        }
        next_send = Instant::now() + pacer.delay_before(&shared.records[index]);
    }
}

fn serve_tcp(listener: TcpListener, shared: Shared) {
    let mut clients: Vec<JoinHandle<()>> = Vec::new();
    let mut accepted = 0u64;

    while shared.running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                accepted += 1;
                tracing::info!("TCP client connected: {}", peer);
                let client = Shared {
                    records: shared.records.clone(),
                    timing: shared.timing,
                    looped: shared.looped,
                    seed: shared.seed.wrapping_add(accepted),
                    running: shared.running.clone(),
                    lines_sent: shared.lines_sent.clone(),
                };
                let spawned = spawn(&format!("sim-tcp-{}", accepted), move || {
                    if let Err(e) = stream_to_client(stream, &client) {
                        tracing::info!("TCP client {} gone: {}", peer, e);
                    }
                });
                match spawned {
                    Ok(handle) => clients.push(handle),
                    Err(e) => tracing::error!("Failed to spawn client thread: {}", e),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!("TCP accept error: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
        clients.retain(|handle| !handle.is_finished());
    }

    for handle in clients {
        let _ = handle.join();
    }
}

fn stream_to_client(mut stream: TcpStream, shared: &Shared) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let mut pacer = Pacer::new(shared.timing, shared.seed);

    loop {
        for record in shared.records.iter() {
            if !shared.running.load(Ordering::Relaxed) {
                return Ok(());
            }
            nap(&shared.running, pacer.delay_before(record));

            let line = format!("{}\n", record.to_line());
            stream.write_all(line.as_bytes())?;
            shared.lines_sent.fetch_add(1, Ordering::Relaxed);
        }
        if !shared.looped {
            tracing::info!("All {} records sent", shared.records.len());
            return Ok(());
        }
        pacer.restart();
    }
}
