//! Binary wire frame codec with byte-level resynchronization
//!
//! # Frame Format
//!
//! ```text
//! +-----------+------------------------+-----------+
//! | 0xAA (1)  | payload (4, u32 LE)    | 0x55 (1)  |
//! +-----------+------------------------+-----------+
//! ```
//!
//! The payload is an unsigned interval in microseconds between two trigger
//! events. The decoder does not interpret it.
//!
//! Resynchronization is purely byte-pattern based. A payload byte equal to
//! the start marker can make the decoder lock onto the wrong offset for one
//! frame; this is an accepted limitation of the protocol and is not masked.

use bytes::{Buf, BytesMut};

use crate::constants::{END_BYTE, FRAME_LEN, START_BYTE};
use crate::protocol::SampleDecoder;

/// Encode one payload into a wire frame
pub fn encode_frame(value: u32) -> [u8; FRAME_LEN] {
    let p = value.to_le_bytes();
    [START_BYTE, p[0], p[1], p[2], p[3], END_BYTE]
}

/// Streaming frame decoder
///
/// The decoder itself is stateless apart from diagnostics; the byte buffer
/// belongs to the caller and carries partial frames between calls.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume every complete frame and all garbage from the front of `buf`
    ///
    /// Undecodable tails (a partial frame, or up to five trailing bytes that
    /// might start one) stay in `buf` for the next call.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Vec<u32> {
        let mut values = Vec::new();

        loop {
            if buf.len() < FRAME_LEN {
                break;
            }

            match buf.iter().position(|&b| b == START_BYTE) {
                None => {
                    // A marker may be split across reads, keep the tail
                    let garbage = buf.len() - (FRAME_LEN - 1);
                    buf.advance(garbage);
                    self.stats.garbage_bytes += garbage as u64;
                    break;
                }
                Some(0) => {}
                Some(offset) => {
                    buf.advance(offset);
                    self.stats.garbage_bytes += offset as u64;
                    continue;
                }
            }

            if buf[FRAME_LEN - 1] == END_BYTE {
                let value = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
                buf.advance(FRAME_LEN);
                self.stats.frames_decoded += 1;
                tracing::trace!(value, "frame decoded");
                values.push(value);
            } else {
                // Drop only the bad marker so an adjacent frame survives
                buf.advance(1);
                self.stats.corrupt_frames += 1;
                self.stats.garbage_bytes += 1;
            }
        }

        values
    }

    /// Get decoder statistics
    pub fn stats(&self) -> DecoderStats {
        self.stats.clone()
    }

    /// Reset statistics
    pub fn reset_stats(&mut self) {
        self.stats = DecoderStats::default();
    }
}

impl SampleDecoder for FrameDecoder {
    fn decode_values(&mut self, buf: &mut BytesMut) -> Vec<f64> {
        self.decode(buf).into_iter().map(f64::from).collect()
    }

    fn name(&self) -> &'static str {
        "binary-frame"
    }
}

/// Frame decoder statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    /// Bytes discarded while searching for a frame
    pub garbage_bytes: u64,
    /// Start markers whose end marker did not match
    pub corrupt_frames: u64,
}
