//! # Pulse Link
//!
//! Low-latency acquisition of counter events from a serial device (or a
//! simulated one) into a durable session record and a bounded live display.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── ACQUISITION THREAD ────────────────────────────────┐
//! │                                                                                     │
//! │  ┌──────────────┐   bytes   ┌──────────────────┐  values  ┌──────────────────────┐  │
//! │  │  Transport   │ ────────► │  SampleDecoder   │ ───────► │  Sample (index, ts)  │  │
//! │  │ serial / udp │           │  frame | line    │          │                      │  │
//! │  │ tcp / mock   │           └──────────────────┘          └──────────┬───────────┘  │
//! │  └──────────────┘                                                    │ enqueue      │
//! └──────────────────────────────────────────────────────────────────────┼──────────────┘
//!                                                                        ▼
//!                                                       ┌────────────────────────────┐
//!                                                       │ IngestionQueue (lock-free) │
//!                                                       └─────────────┬──────────────┘
//!                                                                     │ drain_all (tick)
//! ┌──────────────────────────────── CONSUMER CONTEXT ─────────────────┼────────────────┐
//! │                                                                   ▼                │
//! │  ┌─────────────────────┐   poll    ┌──────────────────────────────────────────┐   │
//! │  │ ConnectionManager   │ ◄──────── │               Pipeline                   │   │
//! │  │ connect / reconnect │           └──────┬───────────────────────┬───────────┘   │
//! │  │ start / stop worker │                  ▼                       ▼               │
//! │  └──────────┬──────────┘      ┌──────────────────────┐  ┌───────────────────┐    │
//! │             │ StatusEvent     │ SessionStore         │  │ RenderBatcher     │    │
//! │             ▼                 │  durable + window    │  │  one redraw/batch │    │
//! │      EventHub subscribers     └──────────────────────┘  └───────────────────┘    │
//! └────────────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod acquisition;
pub mod config;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod render;
pub mod sim;
pub mod storage;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Frame start marker
    pub const START_BYTE: u8 = 0xAA;

    /// Frame end marker
    pub const END_BYTE: u8 = 0x55;

    /// Total frame length: marker + u32 payload + marker
    pub const FRAME_LEN: usize = 6;

    /// Default serial baud rate
    pub const DEFAULT_BAUD_RATE: u32 = 115_200;

    /// Default bounded read timeout in milliseconds
    pub const DEFAULT_READ_TIMEOUT_MS: u64 = 2;

    /// Default display window capacity
    pub const DEFAULT_MAX_HISTORY: usize = 1000;

    /// Default drain interval in milliseconds
    pub const DEFAULT_DRAIN_INTERVAL_MS: u64 = 100;

    /// Default queue depth that raises a backpressure warning
    pub const DEFAULT_HIGH_WATER_MARK: usize = 10_000;

    /// Default number of reconnection attempts
    pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

    /// Default delay between reconnection attempts in milliseconds
    pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

    /// Target string that selects the built-in mock device
    pub const MOCK_TARGET: &str = "mock";

    /// Default UDP/TCP port of the simulation server
    pub const DEFAULT_SIM_PORT: u16 = 12345;
}
