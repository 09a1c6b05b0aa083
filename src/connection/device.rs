//! Device command facade
//!
//! Thin typed layer over the shared transport. Every command reports why it
//! could not be carried out instead of silently doing nothing.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::acquisition::transport::{SharedTransport, Transport};
use crate::error::DeviceError;
use crate::protocol::command::{
    CountingDuration, DeviceCommand, DeviceInfo, DeviceProfile, DeviceStatus, SpeakerMode,
    STREAM_STATUS_NOW,
};

/// Streaming mode with periodic status lines
const STREAM_AUTO_QUERY: u8 = 4;
/// Streaming mode with a status line at the end of each measurement
const STREAM_ON_COMPLETE: u8 = 1;
/// Streaming disabled
const STREAM_OFF: u8 = 0;

const DEFAULT_VOLTAGE: u16 = 500;

/// Settings applied together before a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementSettings {
    pub repeat: bool,
    /// Have the device send status lines on its own
    pub auto_query: bool,
    pub counting_time: CountingDuration,
    pub voltage: u16,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            repeat: false,
            auto_query: false,
            counting_time: CountingDuration::Unlimited,
            voltage: DEFAULT_VOLTAGE,
        }
    }
}

/// Borrowed command handle for the connected device
pub struct Device<'a> {
    transport: Option<&'a SharedTransport>,
    profile: DeviceProfile,
    acquiring: bool,
    reply_timeout: Duration,
}

impl<'a> Device<'a> {
    pub fn new(
        transport: Option<&'a SharedTransport>,
        profile: DeviceProfile,
        acquiring: bool,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            profile,
            acquiring,
            reply_timeout,
        }
    }

    /// Get the negotiated profile
    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    fn link(&self) -> Result<&'a SharedTransport, DeviceError> {
        let transport = self.transport.ok_or(DeviceError::NotConnected)?;
        if !self.profile.supports_commands() {
            return Err(DeviceError::Unsupported(self.profile.name()));
        }
        Ok(transport)
    }

    /// Send a command that has no reply
    pub fn send(&self, command: DeviceCommand) -> Result<(), DeviceError> {
        let bytes = command.encode()?;
        let transport = self.link()?;
        tracing::debug!("Sending {}", command);
        transport
            .lock()
            .write_all(&bytes)
            .map_err(|e| DeviceError::Io(e.to_string()))
    }

    /// Send a command and wait for its reply line
    ///
    /// Refused while acquiring, where replies would interleave with frames.
    pub fn query(&self, command: DeviceCommand) -> Result<String, DeviceError> {
        command.validate()?;
        let transport = self.link()?;
        if self.acquiring {
            return Err(DeviceError::Busy("queries are unavailable while acquiring"));
        }
        let mut guard = transport.lock();
        guard
            .clear_input()
            .map_err(|e| DeviceError::Io(e.to_string()))?;
        exchange(&mut **guard, command, self.reply_timeout)
    }

    /// Request one status record (`b2`)
    pub fn status(&self) -> Result<DeviceStatus, DeviceError> {
        let line = self.query(DeviceCommand::SetStream(STREAM_STATUS_NOW))?;
        DeviceStatus::parse(&line)
    }

    /// Query copyright and version strings
    pub fn info(&self) -> Result<DeviceInfo, DeviceError> {
        Ok(DeviceInfo {
            copyright: self.query(DeviceCommand::Copyright)?,
            version: self.query(DeviceCommand::Version)?,
        })
    }

    pub fn set_stream(&self, mode: u8) -> Result<(), DeviceError> {
        self.send(DeviceCommand::SetStream(mode))
    }

    pub fn set_voltage(&self, volts: u16) -> Result<(), DeviceError> {
        self.send(DeviceCommand::SetVoltage(volts))
    }

    pub fn set_repeat(&self, on: bool) -> Result<(), DeviceError> {
        self.send(DeviceCommand::SetRepeat(on))
    }

    pub fn set_counting(&self, on: bool) -> Result<(), DeviceError> {
        self.send(DeviceCommand::SetCounting(on))
    }

    pub fn set_speaker(&self, mode: SpeakerMode) -> Result<(), DeviceError> {
        self.send(DeviceCommand::SetSpeaker(mode))
    }

    pub fn set_counting_time(&self, duration: CountingDuration) -> Result<(), DeviceError> {
        self.send(DeviceCommand::SetCountingTime(duration))
    }

    pub fn clear_register(&self) -> Result<(), DeviceError> {
        self.send(DeviceCommand::ClearRegister)
    }

    /// Apply repeat, streaming mode, counting time and voltage in one go
    ///
    /// The voltage is checked before anything is sent.
    pub fn configure_measurement(&self, settings: &MeasurementSettings) -> Result<(), DeviceError> {
        DeviceCommand::SetVoltage(settings.voltage).validate()?;
        let stream = if settings.auto_query {
            STREAM_AUTO_QUERY
        } else {
            STREAM_ON_COMPLETE
        };

        self.set_repeat(settings.repeat)?;
        self.set_stream(stream)?;
        self.set_counting_time(settings.counting_time)?;
        self.set_voltage(settings.voltage)?;
        tracing::info!(
            repeat = settings.repeat,
            stream,
            counting_time = ?settings.counting_time,
            voltage = settings.voltage,
            "Measurement settings applied"
        );
        Ok(())
    }

    /// Restore factory settings: no repeat, no streaming, unlimited, 500 V
    pub fn reset_defaults(&self) -> Result<(), DeviceError> {
        self.set_repeat(false)?;
        self.set_stream(STREAM_OFF)?;
        self.set_counting_time(CountingDuration::Unlimited)?;
        self.set_voltage(DEFAULT_VOLTAGE)?;
        tracing::info!("Device settings reset to defaults");
        Ok(())
    }
}

/// Write a command and read the first non-empty reply line
fn exchange(
    transport: &mut dyn Transport,
    command: DeviceCommand,
    timeout: Duration,
) -> Result<String, DeviceError> {
    let bytes = command.encode()?;
    transport
        .write_all(&bytes)
        .map_err(|e| DeviceError::Io(e.to_string()))?;
    read_line(transport, timeout)
}

/// Read until a non-empty newline-terminated line arrives or the timeout passes
fn read_line(transport: &mut dyn Transport, timeout: Duration) -> Result<String, DeviceError> {
    let deadline = Instant::now() + timeout;
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];

    loop {
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                return Ok(text);
            }
        }

        if Instant::now() >= deadline {
            return Err(DeviceError::Timeout(timeout.as_millis() as u64));
        }

        let n = transport
            .read(&mut chunk)
            .map_err(|e| DeviceError::Io(e.to_string()))?;
        pending.extend_from_slice(&chunk[..n]);
    }
}

fn is_printable(line: &str) -> bool {
    !line.is_empty() && line.chars().all(|c| c.is_ascii() && !c.is_ascii_control())
}

fn probe(transport: &mut dyn Transport, timeout: Duration) -> Result<DeviceInfo, DeviceError> {
    let stop = DeviceCommand::SetStream(STREAM_OFF).encode()?;
    transport
        .write_all(&stop)
        .map_err(|e| DeviceError::Io(e.to_string()))?;
    transport
        .clear_input()
        .map_err(|e| DeviceError::Io(e.to_string()))?;

    let mut replies = Vec::with_capacity(2);
    for command in [DeviceCommand::Copyright, DeviceCommand::Version] {
        let line = exchange(transport, command, timeout)?;
        if !is_printable(&line) {
            return Err(DeviceError::Parse(format!("unprintable reply to {}", command)));
        }
        replies.push(line);
    }

    let version = replies.pop().unwrap_or_default();
    let copyright = replies.pop().unwrap_or_default();
    Ok(DeviceInfo { copyright, version })
}

/// Probe the device protocol on a freshly opened link
///
/// Stops any streaming, flushes input, then asks for the copyright and
/// version strings. Anything but two printable replies means a raw byte
/// source.
pub fn negotiate(
    transport: &mut dyn Transport,
    timeout: Duration,
) -> (DeviceProfile, Option<DeviceInfo>) {
    match probe(transport, timeout) {
        Ok(info) => {
            tracing::info!(
                "Negotiated {} profile: {} / {}",
                DeviceProfile::GmCounter.name(),
                info.copyright,
                info.version
            );
            (DeviceProfile::GmCounter, Some(info))
        }
        Err(e) => {
            tracing::info!("No command protocol on link ({}), using raw profile", e);
            (DeviceProfile::Raw, None)
        }
    }
}
