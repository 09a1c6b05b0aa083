//! Error types for the acquisition pipeline

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Simulation error: {0}")]
    Sim(#[from] SimError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection lifecycle errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Failed to open {target}: {reason}")]
    OpenFailed { target: String, reason: String },

    #[error("Worker failed to start: {0}")]
    WorkerSpawn(String),
}

/// Errors from the device command protocol
///
/// Every command on the device facade returns one of these instead of
/// silently doing nothing when the link is down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Command not supported by the {0} profile")]
    Unsupported(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Device busy: {0}")]
    Busy(&'static str),

    #[error("No response within {0} ms")]
    Timeout(u64),

    #[error("Malformed response: {0}")]
    Parse(String),

    #[error("Write failed: {0}")]
    Io(String),
}

/// Byte transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("Address resolution failed: {0}")]
    Resolve(String),
}

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Nothing to export")]
    Empty,

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Metadata error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Simulation server errors
#[derive(Error, Debug)]
pub enum SimError {
    #[error("No records to serve")]
    NoRecords,

    #[error("Failed to read records: {0}")]
    Csv(#[from] csv::Error),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server failed to start: {0}")]
    Spawn(String),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
