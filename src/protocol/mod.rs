//! Wire protocols: binary frames, device commands and simulation lines

pub mod command;
pub mod frame;
pub mod line;

use bytes::BytesMut;

pub use command::{
    CountingDuration, DeviceCommand, DeviceInfo, DeviceProfile, DeviceStatus, SpeakerMode,
};
pub use frame::{encode_frame, DecoderStats, FrameDecoder};
pub use line::{LineDecoder, SimRecord};

/// Turns accumulated bytes into sample values
///
/// Implementations consume what they can from the front of `buf` and leave
/// incomplete input in place for the next call.
pub trait SampleDecoder: Send {
    fn decode_values(&mut self, buf: &mut BytesMut) -> Vec<f64>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}
