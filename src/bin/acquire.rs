//! Acquisition front end
//!
//! Connects to a counter (or the built-in mock, or a simulation server),
//! streams samples into the session store until Ctrl+C or `--duration`, then
//! exports the session as CSV with a JSON sidecar.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulse_link::{
    acquisition::{list_ports, queue::IngestionQueue},
    config::AppConfig,
    connection::{events::Severity, ConnectionManager, MeasurementSettings},
    constants::MOCK_TARGET,
    pipeline::Pipeline,
    protocol::CountingDuration,
    render::LogRenderer,
    storage::export::{export_auto, FileNamer, MeasurementLabel},
};

#[derive(Parser, Debug)]
#[command(name = "acquire", version, about = "Acquire counter intervals into a session")]
struct Args {
    /// Serial port, `udp://host:port`, `tcp://host:port` or `mock`
    #[arg(default_value = MOCK_TARGET)]
    target: String,

    /// Config file (defaults to the platform config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Export directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Measurement name used in the export file name
    #[arg(long, default_value = "measurement")]
    name: String,

    /// Group letter or name
    #[arg(long, default_value = "A")]
    group: String,

    /// Subgroup appended to the export folder
    #[arg(long, default_value = "")]
    subterm: String,

    /// Tube voltage in volts
    #[arg(long)]
    voltage: Option<u16>,

    /// Counting duration preset index (0 = unlimited .. 5 = 300 s)
    #[arg(long)]
    counting_time: Option<u8>,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
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

    if args.list_ports {
        println!("\n=== Available Ports ===");
        for port in list_ports() {
            let marker = if port.is_mock { " [MOCK]" } else { "" };
            println!("  {}{}: {}", port.name, marker, port.description);
        }
        println!();
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AppConfig::load_or_default(),
    };

    let queue = IngestionQueue::new(
        config.storage.queue_capacity,
        config.storage.high_water_mark,
    );
    let mut manager = ConnectionManager::new(&config, queue.clone());
    let mut pipeline = Pipeline::new(queue, &config.storage, LogRenderer::new());

    // Log status events as they happen
    let status_rx = manager.status_hub().subscribe();
    thread::Builder::new()
        .name("status-log".into())
        .spawn(move || {
            for event in status_rx {
                match event.severity {
                    Severity::Error => tracing::error!("{}", event.message),
                    Severity::Warning => tracing::warn!("{}", event.message),
                    Severity::Info | Severity::Success => tracing::info!("{}", event.message),
                }
            }
        })
        .context("spawning status logger")?;

    manager
        .connect(&args.target)
        .with_context(|| format!("connecting to {}", args.target))?;

    if let Some(info) = manager.device_info() {
        tracing::info!("Device: {} ({})", info.version, info.copyright);
    }

    if args.voltage.is_some() || args.counting_time.is_some() {
        let profile = manager.profile();
        if !profile.is_some_and(|p| p.supports_commands()) {
            bail!("device settings need a counter that accepts commands");
        }
        let mut settings = MeasurementSettings::default();
        if let Some(volts) = args.voltage {
            settings.voltage = volts;
        }
        if let Some(index) = args.counting_time {
            settings.counting_time = CountingDuration::from_index(index)?;
        }
        manager.device().configure_measurement(&settings)?;
        tracing::info!("Applied {:?}", settings);
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("installing Ctrl+C handler")?;
    }
    if let Some(secs) = args.duration {
        let stop = stop.clone();
        thread::Builder::new()
            .name("duration".into())
            .spawn(move || {
                thread::sleep(Duration::from_secs(secs));
                stop.store(true, Ordering::SeqCst);
            })
            .context("spawning duration timer")?;
    }

    manager.start_acquisition()?;
    tracing::info!("Acquiring from {} - press Ctrl+C to stop", args.target);

    pipeline.run(&mut manager, &stop);
    manager.stop_acquisition();

    let store = pipeline.store();
    let counters = store.counters();
    let stats = store.statistics();
    tracing::info!(
        "Session {}: {} samples, {} rejected, {} dropped by queue",
        store.session_id(),
        counters.total_received,
        counters.rejected,
        counters.queue_dropped
    );
    if stats.count > 0 {
        tracing::info!(
            "Interval stats: min {:.0}, max {:.0}, mean {:.1}, stdev {:.1}",
            stats.min,
            stats.max,
            stats.mean,
            stats.stdev
        );
    }

    let dir = args
        .output
        .or_else(|| config.storage.export_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    if store.is_empty() {
        tracing::warn!("Nothing recorded, skipping export");
    } else {
        let label = MeasurementLabel {
            name: args.name,
            group: args.group,
            subterm: args.subterm,
        };
        let summary = export_auto(
            store,
            &dir,
            &mut FileNamer::new(),
            &label,
            "",
            manager.target().map(|t| t.to_string()),
            manager.device_info().cloned(),
        )?;
        tracing::info!(
            "Exported {} rows to {} (metadata {})",
            summary.rows,
            summary.csv_path.display(),
            summary.metadata_path.display()
        );
    }

    manager.disconnect();
    Ok(())
}
