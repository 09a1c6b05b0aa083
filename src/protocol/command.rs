//! Device command protocol
//!
//! Commands are a single ASCII letter with an optional numeric suffix,
//! terminated by a newline. Replies are newline-terminated ASCII lines.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::error::DeviceError;

/// Accepted high-voltage range in volts
pub const VOLTAGE_RANGE: RangeInclusive<u16> = 300..=700;

/// Highest streaming mode the firmware understands
pub const MAX_STREAM_MODE: u8 = 8;

/// Streaming mode that makes the device send one status line now
pub const STREAM_STATUS_NOW: u8 = 2;

/// Speaker bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerMode {
    /// Click on every counted event (bit 0)
    pub event_sound: bool,
    /// Beep when a measurement is ready (bit 1)
    pub ready_sound: bool,
}

impl SpeakerMode {
    pub fn bits(self) -> u8 {
        u8::from(self.event_sound) | (u8::from(self.ready_sound) << 1)
    }

    pub fn from_bits(bits: u8) -> Result<Self, DeviceError> {
        if bits > 3 {
            return Err(DeviceError::InvalidArgument(format!(
                "speaker mask {} outside 0..=3",
                bits
            )));
        }
        Ok(Self {
            event_sound: bits & 0b01 != 0,
            ready_sound: bits & 0b10 != 0,
        })
    }
}

/// Counting duration preset selected with `f<n>`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountingDuration {
    #[default]
    Unlimited,
    OneSecond,
    TenSeconds,
    SixtySeconds,
    HundredSeconds,
    ThreeHundredSeconds,
}

impl CountingDuration {
    const ALL: [CountingDuration; 6] = [
        CountingDuration::Unlimited,
        CountingDuration::OneSecond,
        CountingDuration::TenSeconds,
        CountingDuration::SixtySeconds,
        CountingDuration::HundredSeconds,
        CountingDuration::ThreeHundredSeconds,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Result<Self, DeviceError> {
        Self::ALL.get(index as usize).copied().ok_or_else(|| {
            DeviceError::InvalidArgument(format!("counting duration index {} outside 0..=5", index))
        })
    }

    /// Wall-clock length, `None` for unlimited counting
    pub fn duration(self) -> Option<Duration> {
        let secs = match self {
            CountingDuration::Unlimited => return None,
            CountingDuration::OneSecond => 1,
            CountingDuration::TenSeconds => 10,
            CountingDuration::SixtySeconds => 60,
            CountingDuration::HundredSeconds => 100,
            CountingDuration::ThreeHundredSeconds => 300,
        };
        Some(Duration::from_secs(secs))
    }
}

/// A command understood by the counter firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// `b<n>` streaming mode
    SetStream(u8),
    /// `c`
    Copyright,
    /// `v`
    Version,
    /// `j<n>` high voltage in volts
    SetVoltage(u16),
    /// `o<0|1>`
    SetRepeat(bool),
    /// `s<0|1>`
    SetCounting(bool),
    /// `U<n>`
    SetSpeaker(SpeakerMode),
    /// `f<n>`
    SetCountingTime(CountingDuration),
    /// `w` clears the count register
    ClearRegister,
}

impl DeviceCommand {
    /// Check argument ranges without encoding
    pub fn validate(&self) -> Result<(), DeviceError> {
        match *self {
            DeviceCommand::SetVoltage(v) if !VOLTAGE_RANGE.contains(&v) => {
                Err(DeviceError::InvalidArgument(format!(
                    "voltage {} V outside {}..={}",
                    v,
                    VOLTAGE_RANGE.start(),
                    VOLTAGE_RANGE.end()
                )))
            }
            DeviceCommand::SetStream(mode) if mode > MAX_STREAM_MODE => Err(
                DeviceError::InvalidArgument(format!("stream mode {} outside 0..=8", mode)),
            ),
            _ => Ok(()),
        }
    }

    /// Wire bytes including the trailing newline
    pub fn encode(&self) -> Result<Vec<u8>, DeviceError> {
        self.validate()?;
        Ok(format!("{}\n", self).into_bytes())
    }

    /// Whether the device answers this command with a line
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            DeviceCommand::Copyright
                | DeviceCommand::Version
                | DeviceCommand::SetStream(STREAM_STATUS_NOW)
                | DeviceCommand::SetStream(3)
        )
    }

    /// Parse one command line as the firmware would
    pub fn parse(line: &str) -> Result<Self, DeviceError> {
        let line = line.trim();
        let mut chars = line.chars();
        let letter = chars
            .next()
            .ok_or_else(|| DeviceError::Parse("empty command".to_string()))?;
        let arg = chars.as_str();

        let number = |what: &str| -> Result<u16, DeviceError> {
            arg.parse::<u16>()
                .map_err(|_| DeviceError::Parse(format!("{} argument '{}'", what, arg)))
        };
        let flag = |what: &str| -> Result<bool, DeviceError> {
            match arg {
                "0" => Ok(false),
                "1" => Ok(true),
                _ => Err(DeviceError::Parse(format!("{} flag '{}'", what, arg))),
            }
        };
        let small = |what: &str| -> Result<u8, DeviceError> {
            u8::try_from(number(what)?)
                .map_err(|_| DeviceError::Parse(format!("{} argument '{}'", what, arg)))
        };

        let command = match letter {
            'b' => DeviceCommand::SetStream(small("stream")?),
            'c' if arg.is_empty() => DeviceCommand::Copyright,
            'v' if arg.is_empty() => DeviceCommand::Version,
            'j' => DeviceCommand::SetVoltage(number("voltage")?),
            'o' => DeviceCommand::SetRepeat(flag("repeat")?),
            's' => DeviceCommand::SetCounting(flag("counting")?),
            'U' => DeviceCommand::SetSpeaker(SpeakerMode::from_bits(small("speaker")?)?),
            'f' => DeviceCommand::SetCountingTime(CountingDuration::from_index(small("duration")?)?),
            'w' if arg.is_empty() => DeviceCommand::ClearRegister,
            _ => return Err(DeviceError::Parse(format!("unknown command '{}'", line))),
        };
        command.validate()?;
        Ok(command)
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::SetStream(mode) => write!(f, "b{}", mode),
            DeviceCommand::Copyright => write!(f, "c"),
            DeviceCommand::Version => write!(f, "v"),
            DeviceCommand::SetVoltage(v) => write!(f, "j{}", v),
            DeviceCommand::SetRepeat(on) => write!(f, "o{}", u8::from(*on)),
            DeviceCommand::SetCounting(on) => write!(f, "s{}", u8::from(*on)),
            DeviceCommand::SetSpeaker(mode) => write!(f, "U{}", mode.bits()),
            DeviceCommand::SetCountingTime(d) => write!(f, "f{}", d.index()),
            DeviceCommand::ClearRegister => write!(f, "w"),
        }
    }
}

/// Structured status reply to `b2`
///
/// Field order on the wire: count, last_count, counting_time, repeat,
/// progress, voltage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Events counted in the running measurement
    pub count: u64,
    /// Events counted in the previous measurement
    pub last_count: u64,
    /// Counting duration in seconds, 0 when unlimited
    pub counting_time: u32,
    pub repeat: bool,
    /// Progress of the running measurement in percent
    pub progress: u32,
    /// High voltage in volts
    pub voltage: u16,
}

impl DeviceStatus {
    const FIELDS: usize = 6;

    /// Parse a status line
    ///
    /// The firmware's separator modes (comma, semicolon, space, tab) are all
    /// accepted, as is a single trailing separator.
    pub fn parse(line: &str) -> Result<Self, DeviceError> {
        let line = line.trim_matches(|c| c == '\r' || c == '\n');
        let mut parts: Vec<&str> = line
            .split(|c: char| matches!(c, ',' | ';' | '\t' | ' '))
            .map(str::trim).collect();
        if parts.last() == Some(&"") {
            parts.pop();
        }
        if parts.len() != Self::FIELDS {
            return Err(DeviceError::Parse(format!(
                "expected {} fields, got {} in '{}'",
                Self::FIELDS,
                parts.len(),
                line
            )));
        }

        fn field<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, DeviceError> {
            raw.parse::<T>()
                .map_err(|_| DeviceError::Parse(format!("{} '{}' is not numeric", name, raw)))
        }

        let repeat = match field::<u8>("repeat", parts[3])? {
            0 => false,
            1 => true,
            other => {
                return Err(DeviceError::Parse(format!("repeat flag {} is not 0/1", other)))
            }
        };

        Ok(Self {
            count: field("count", parts[0])?,
            last_count: field("last_count", parts[1])?,
            counting_time: field("counting_time", parts[2])?,
            repeat,
            progress: field("progress", parts[4])?,
            voltage: field("voltage", parts[5])?,
        })
    }

    /// Encode as the firmware does (comma separated, trailing comma)
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},",
            self.count,
            self.last_count,
            self.counting_time,
            u8::from(self.repeat),
            self.progress,
            self.voltage
        )
    }
}

/// Identification strings queried during negotiation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub copyright: String,
    pub version: String,
}

/// Capability level negotiated on connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProfile {
    /// Full command/response protocol
    GmCounter,
    /// Byte stream only, no commands
    Raw,
}

impl DeviceProfile {
    pub fn name(self) -> &'static str {
        match self {
            DeviceProfile::GmCounter => "gm-counter",
            DeviceProfile::Raw => "raw",
        }
    }

    pub fn supports_commands(self) -> bool {
        matches!(self, DeviceProfile::GmCounter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        assert_eq!(DeviceCommand::SetStream(2).encode().unwrap(), b"b2\n");
        assert_eq!(DeviceCommand::Copyright.encode().unwrap(), b"c\n");
        assert_eq!(DeviceCommand::SetVoltage(500).encode().unwrap(), b"j500\n");
        assert_eq!(DeviceCommand::SetRepeat(true).encode().unwrap(), b"o1\n");
        assert_eq!(DeviceCommand::SetCounting(false).encode().unwrap(), b"s0\n");
        assert_eq!(DeviceCommand::ClearRegister.encode().unwrap(), b"w\n");
        assert_eq!(
            DeviceCommand::SetCountingTime(CountingDuration::SixtySeconds)
                .encode()
                .unwrap(),
            b"f3\n"
        );
    }

    #[test]
    fn test_speaker_bits() {
        let both = SpeakerMode {
            event_sound: true,
            ready_sound: true,
        };
        assert_eq!(both.bits(), 3);
        assert!(SpeakerMode::from_bits(2).unwrap().ready_sound);
        assert!(!SpeakerMode::from_bits(2).unwrap().event_sound);
        assert!(SpeakerMode::from_bits(4).is_err());
        assert_eq!(DeviceCommand::SetSpeaker(both).encode().unwrap(), b"U3\n");
    }

    #[test]
    fn test_voltage_range_enforced() {
        assert!(DeviceCommand::SetVoltage(300).encode().is_ok());
        assert!(DeviceCommand::SetVoltage(700).encode().is_ok());
        assert!(matches!(
            DeviceCommand::SetVoltage(299).encode(),
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(matches!(
            DeviceCommand::SetVoltage(701).encode(),
            Err(DeviceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_counting_duration_index() {
        assert_eq!(CountingDuration::from_index(0).unwrap(), CountingDuration::Unlimited);
        assert_eq!(
            CountingDuration::from_index(5).unwrap().duration(),
            Some(Duration::from_secs(300))
        );
        assert!(CountingDuration::from_index(6).is_err());
        assert_eq!(CountingDuration::Unlimited.duration(), None);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(DeviceCommand::parse("b2\n").unwrap(), DeviceCommand::SetStream(2));
        assert_eq!(DeviceCommand::parse("v").unwrap(), DeviceCommand::Version);
        assert_eq!(DeviceCommand::parse("j450").unwrap(), DeviceCommand::SetVoltage(450));
        assert_eq!(
            DeviceCommand::parse("U1").unwrap(),
            DeviceCommand::SetSpeaker(SpeakerMode {
                event_sound: true,
                ready_sound: false
            })
        );
        assert!(DeviceCommand::parse("j900").is_err());
        assert!(DeviceCommand::parse("o2").is_err());
        assert!(DeviceCommand::parse("x").is_err());
        assert!(DeviceCommand::parse("").is_err());
    }

    #[test]
    fn test_status_parse() {
        let status = DeviceStatus::parse("120,98,3,1,45,500,\r\n").unwrap();
        assert_eq!(
            status,
            DeviceStatus {
                count: 120,
                last_count: 98,
                counting_time: 3,
                repeat: true,
                progress: 45,
                voltage: 500,
            }
        );
    }

    #[test]
    fn test_status_alternate_separator() {
        let status = DeviceStatus::parse("1;2;0;0;100;420").unwrap();
        assert_eq!(status.voltage, 420);
        assert!(!status.repeat);
    }

    #[test]
    fn test_status_rejects_malformed() {
        assert!(matches!(DeviceStatus::parse("1,2,3"), Err(DeviceError::Parse(_))));
        assert!(matches!(
            DeviceStatus::parse("1,2,x,0,0,500"),
            Err(DeviceError::Parse(_))
        ));
        assert!(matches!(
            DeviceStatus::parse("1,2,3,7,0,500"),
            Err(DeviceError::Parse(_))
        ));
    }

    #[test]
    fn test_status_line_roundtrip() {
        let status = DeviceStatus {
            count: 5,
            last_count: 4,
            counting_time: 2,
            repeat: false,
            progress: 50,
            voltage: 650,
        };
        assert_eq!(status.to_line(), "5,4,2,0,50,650,");
        assert_eq!(DeviceStatus::parse(&status.to_line()).unwrap(), status);
    }
}
