//! Session storage: durable record, display window, statistics and export

pub mod export;
pub mod stats;
pub mod store;

pub use export::{
    export_auto, export_session, write_csv, ExportMetadata, ExportSummary, FileNamer,
    MeasurementLabel,
};
pub use stats::{RunningStats, Statistics};
pub use store::{DisplayWindow, PerformanceCounters, SessionStore};
