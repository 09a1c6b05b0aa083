//! Simulation server
//!
//! Streams a recorded CSV (or generated data) over UDP or TCP so the
//! acquisition pipeline can be exercised without hardware. Connect with
//! `acquire udp://127.0.0.1:12345` or `acquire tcp://127.0.0.1:12345`.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulse_link::{
    config::AppConfig,
    sim::{generate_records, load_records, SimProtocol, SimServer, SimTiming},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Protocol {
    Udp,
    Tcp,
}

impl From<Protocol> for SimProtocol {
    fn from(p: Protocol) -> Self {
        match p {
            Protocol::Udp => SimProtocol::Udp,
            Protocol::Tcp => SimProtocol::Tcp,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "simulator", version, about = "Stream CSV records to an acquisition client")]
struct Args {
    /// CSV recording with a header row; generated data when omitted
    #[arg(long)]
    csv: Option<PathBuf>,

    #[arg(long, value_enum)]
    protocol: Option<Protocol>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    bind: Option<String>,

    /// Records per second
    #[arg(short, long)]
    rate: Option<f64>,

    /// Uniform random jitter in milliseconds added to every interval
    #[arg(long)]
    jitter_ms: Option<f64>,

    /// Pace records by their recorded timestamps instead of a fixed rate
    #[arg(long, conflicts_with_all = ["rate", "jitter_ms"])]
    replay: bool,

    /// Stop after the last record instead of starting over
    #[arg(long)]
    no_loop: bool,

    /// Number of generated records
    #[arg(long, default_value_t = 10_000)]
    count: usize,

    /// Seed for generated data and jitter
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Config file (defaults to the platform config location)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AppConfig::load_or_default(),
    }
    .simulator;

    if let Some(protocol) = args.protocol {
        config.protocol = protocol.into();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if args.no_loop {
        config.looped = false;
    }

    let base_rate = match config.timing {
        SimTiming::Fixed { rate_hz } | SimTiming::Jitter { rate_hz, .. } => rate_hz,
        SimTiming::Replay => 100.0,
    };
    config.timing = if args.replay {
        SimTiming::Replay
    } else {
        let rate_hz = args.rate.unwrap_or(base_rate);
        match args.jitter_ms {
            Some(jitter_ms) if jitter_ms > 0.0 => SimTiming::Jitter { rate_hz, jitter_ms },
            _ if args.rate.is_some() => SimTiming::Fixed { rate_hz },
            _ => config.timing,
        }
    };
    config.validate().context("invalid simulator timing")?;

    let records = match &args.csv {
        Some(path) => load_records(path)
            .with_context(|| format!("loading records from {}", path.display()))?,
        None => {
            tracing::info!("No CSV given, generating {} records", args.count);
            generate_records(args.count, args.seed)
        }
    };

    let mut server = SimServer::new(config, records)?.with_seed(args.seed);
    let addr = server.start()?;
    tracing::info!("Serving on {} - press Ctrl+C to stop", addr);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("installing Ctrl+C handler")?;
    }

    let mut last_report = 0u64;
    let mut ticks = 0u32;
    while !stop.load(Ordering::SeqCst) && server.is_running() {
        thread::sleep(Duration::from_millis(100));
        ticks += 1;

        // Periodic stats logging
        if ticks % 100 == 0 {
            let sent = server.lines_sent();
            tracing::info!("Sent {} lines ({} in the last 10 s)", sent, sent - last_report);
            last_report = sent;
        }
    }

    server.stop();
    Ok(())
}
