//! Simulation transport server
//!
//! Streams recorded or generated CSV records to a client over UDP or TCP so
//! the whole pipeline can run without hardware.

pub mod records;
pub mod server;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use records::{generate_records, load_records};
pub use server::SimServer;

/// Socket type served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimProtocol {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for SimProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimProtocol::Udp => f.write_str("udp"),
            SimProtocol::Tcp => f.write_str("tcp"),
        }
    }
}

/// How records are paced
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimTiming {
    /// Constant rate
    Fixed { rate_hz: f64 },
    /// Constant rate with uniform ± jitter
    Jitter { rate_hz: f64, jitter_ms: f64 },
    /// Reproduce the recorded `current_time` spacing
    Replay,
}
