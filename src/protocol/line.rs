//! Line-oriented CSV protocol of the simulation transport
//!
//! Each record is one line:
//!
//! ```text
//! current_time,frequency,accel_x,accel_y,accel_z,gyro_x,gyro_y,gyro_z
//! ```
//!
//! A header line may precede the data; when present it decides which
//! column carries which field. Corrupted lines are counted and skipped.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::protocol::SampleDecoder;

/// Column names in their default order
pub const COLUMNS: [&str; 8] = [
    "current_time",
    "frequency",
    "accel_x",
    "accel_y",
    "accel_z",
    "gyro_x",
    "gyro_y",
    "gyro_z",
];

/// Lines longer than this are treated as corruption
pub const MAX_LINE_LEN: usize = 500;

/// An unterminated buffer longer than this is discarded
pub const MAX_PENDING_BYTES: usize = 1000;

/// One simulation record
///
/// Empty fields deserialize to `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimRecord {
    /// Recording timestamp in microseconds
    pub current_time: f64,
    pub frequency: Option<f64>,
    pub accel_x: Option<f64>,
    pub accel_y: Option<f64>,
    pub accel_z: Option<f64>,
    pub gyro_x: Option<f64>,
    pub gyro_y: Option<f64>,
    pub gyro_z: Option<f64>,
}

impl SimRecord {
    /// The value fed into the pipeline: frequency, else accel_z, else gyro_z
    pub fn primary_value(&self) -> Option<f64> {
        [self.frequency, self.accel_z, self.gyro_z]
            .into_iter()
            .flatten()
            .find(|v| v.is_finite())
    }

    /// Encode as one CSV line without the newline
    pub fn to_line(&self) -> String {
        let opt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        format!(
            "{},{},{},{},{},{},{},{}",
            self.current_time,
            opt(self.frequency),
            opt(self.accel_x),
            opt(self.accel_y),
            opt(self.accel_z),
            opt(self.gyro_x),
            opt(self.gyro_y),
            opt(self.gyro_z)
        )
    }
}

/// Why a line did not produce a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRejection {
    Blank,
    Header,
    NonAscii,
    TooLong,
    FieldCount,
    NoValue,
}

/// Column positions of the fields the decoder reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    width: usize,
    frequency: Option<usize>,
    accel_z: Option<usize>,
    gyro_z: Option<usize>,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            width: COLUMNS.len(),
            frequency: Some(1),
            accel_z: Some(4),
            gyro_z: Some(7),
        }
    }
}

impl Layout {
    fn from_header(fields: &[&str]) -> Self {
        let find = |name: &str| fields.iter().position(|f| f.eq_ignore_ascii_case(name));
        Self {
            width: fields.len(),
            frequency: find("frequency"),
            accel_z: find("accel_z"),
            gyro_z: find("gyro_z"),
        }
    }
}

/// Streaming decoder for newline-delimited CSV records
#[derive(Debug, Default)]
pub struct LineDecoder {
    layout: Layout,
    header_seen: bool,
    stats: LineStats,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a header line has been seen
    pub fn has_header(&self) -> bool {
        self.header_seen
    }

    /// Interpret one line (without its terminator)
    pub fn parse_line(&mut self, line: &str) -> Result<f64, LineRejection> {
        let line = line.trim();
        if line.is_empty() {
            return Err(LineRejection::Blank);
        }
        if !line.is_ascii() {
            return Err(LineRejection::NonAscii);
        }
        if line.len() > MAX_LINE_LEN {
            return Err(LineRejection::TooLong);
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let numeric = fields.iter().filter(|f| f.parse::<f64>().is_ok()).count();

        if numeric == 0 {
            if !self.header_seen {
                self.layout = Layout::from_header(&fields);
                self.header_seen = true;
                tracing::info!("CSV header detected: {:?}", fields);
            }
            return Err(LineRejection::Header);
        }

        if fields.len() != self.layout.width {
            return Err(LineRejection::FieldCount);
        }

        let column = |idx: Option<usize>| {
            idx.and_then(|i| fields.get(i))
                .and_then(|f| f.parse::<f64>().ok())
                .filter(|v| v.is_finite())
        };

        column(self.layout.frequency)
            .or_else(|| column(self.layout.accel_z))
            .or_else(|| column(self.layout.gyro_z))
            .ok_or(LineRejection::NoValue)
    }

    /// Get decoder statistics
    pub fn stats(&self) -> LineStats {
        self.stats.clone()
    }
}

impl SampleDecoder for LineDecoder {
    fn decode_values(&mut self, buf: &mut BytesMut) -> Vec<f64> {
        let mut values = Vec::new();

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let raw = buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw[..pos]);
            match self.parse_line(&line) {
                Ok(value) => {
                    self.stats.lines_decoded += 1;
                    values.push(value);
                }
                Err(LineRejection::Blank) => {}
                Err(LineRejection::Header) => self.stats.header_lines += 1,
                Err(reason) => {
                    self.stats.lines_rejected += 1;
                    tracing::debug!(?reason, "skipping line: {:.30}", line);
                }
            }
        }

        if buf.len() > MAX_PENDING_BYTES {
            tracing::warn!("Discarding {} unterminated bytes", buf.len());
            self.stats.bytes_discarded += buf.len() as u64;
            buf.advance(buf.len());
        }

        values
    }

    fn name(&self) -> &'static str {
        "csv-line"
    }
}

/// Line decoder statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineStats {
    pub lines_decoded: u64,
    pub header_lines: u64,
    pub lines_rejected: u64,
    pub bytes_discarded: u64,
}
