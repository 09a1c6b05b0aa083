//! Synthetic counter device
//!
//! Behaves like the real firmware at the byte level: it answers the command
//! protocol with ASCII lines and, while counting, emits one binary frame per
//! simulated trigger event carrying the interval since the previous event.
//! Intervals are drawn uniformly from a configurable range with a seeded
//! ChaCha8 RNG so runs are reproducible.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::acquisition::transport::Transport;
use crate::config::MockConfig;
use crate::constants::MOCK_TARGET;
use crate::protocol::command::{
    CountingDuration, DeviceCommand, DeviceStatus, STREAM_STATUS_NOW,
};
use crate::protocol::frame::encode_frame;

pub const MOCK_COPYRIGHT: &str = "(C) Pulse Link mock counter";
pub const MOCK_VERSION: &str = "MockVersion 1.0.0";

/// Handle that can cut the mock's link from outside, like pulling a cable
#[derive(Clone, Default)]
pub struct MockLink {
    severed: Arc<AtomicBool>,
}

impl MockLink {
    pub fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
    }

    pub fn is_severed(&self) -> bool {
        self.severed.load(Ordering::SeqCst)
    }
}

/// Firmware-visible settings and counters
#[derive(Debug, Clone)]
struct Registers {
    voltage: u16,
    repeat: bool,
    counting_time: CountingDuration,
    counting: bool,
    count: u64,
    last_count: u64,
    started_at: Option<Instant>,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            voltage: 500,
            repeat: false,
            counting_time: CountingDuration::Unlimited,
            counting: false,
            count: 0,
            last_count: 0,
            started_at: None,
        }
    }
}

/// Mock counter device exposed as a [`Transport`]
pub struct MockDevice {
    rng: ChaCha8Rng,
    min_interval_us: u32,
    max_interval_us: u32,
    read_timeout: Duration,
    regs: Registers,
    next_interval_us: u32,
    next_event_at: Instant,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    link: MockLink,
}

impl MockDevice {
    pub fn new(config: &MockConfig, read_timeout: Duration) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let min = config.min_interval_us.max(1);
        let max = config.max_interval_us.max(min);

        Self {
            rng,
            min_interval_us: min,
            max_interval_us: max,
            read_timeout,
            regs: Registers::default(),
            next_interval_us: 0,
            next_event_at: Instant::now(),
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            link: MockLink::default(),
        }
    }

    /// Get a handle that can sever this device's link
    pub fn link(&self) -> MockLink {
        self.link.clone()
    }

    /// Whether the device is currently counting
    pub fn is_counting(&self) -> bool {
        self.regs.counting
    }

    fn draw_interval(&mut self) -> u32 {
        self.rng.gen_range(self.min_interval_us..=self.max_interval_us)
    }

    fn schedule_next(&mut self, from: Instant) {
        self.next_interval_us = self.draw_interval();
        self.next_event_at = from + Duration::from_micros(u64::from(self.next_interval_us));
    }

    fn start_counting(&mut self) {
        if self.regs.counting {
            return;
        }
        let now = Instant::now();
        self.regs.counting = true;
        self.regs.last_count = self.regs.count;
        self.regs.count = 0;
        self.regs.started_at = Some(now);
        self.schedule_next(now);
        tracing::debug!("Mock counting started");
    }

    fn stop_counting(&mut self) {
        if self.regs.counting {
            self.regs.counting = false;
            tracing::debug!(count = self.regs.count, "Mock counting stopped");
        }
    }

    fn status(&self) -> DeviceStatus {
        let limit = self.regs.counting_time.duration();
        let progress = match (self.regs.counting, limit, self.regs.started_at) {
            (true, Some(limit), Some(start)) => {
                let pct = start.elapsed().as_secs_f64() / limit.as_secs_f64() * 100.0;
                pct.min(100.0) as u32
            }
            _ => 0,
        };
        DeviceStatus {
            count: self.regs.count,
            last_count: self.regs.last_count,
            counting_time: limit.map(|d| d.as_secs() as u32).unwrap_or(0),
            repeat: self.regs.repeat,
            progress,
            voltage: self.regs.voltage,
        }
    }

    fn reply(&mut self, line: &str) {
        self.outbox.extend(line.as_bytes());
        self.outbox.push_back(b'\n');
    }

    fn handle_command(&mut self, command: DeviceCommand) {
        // The firmware ignores everything but a stop while counting
        if self.regs.counting && command != DeviceCommand::SetCounting(false) {
            tracing::debug!("Mock ignoring {} while counting", command);
            return;
        }

        match command {
            DeviceCommand::SetStream(STREAM_STATUS_NOW) | DeviceCommand::SetStream(3) => {
                let line = self.status().to_line();
                self.reply(&line);
            }
            DeviceCommand::SetStream(_) => {}
            DeviceCommand::Copyright => self.reply(MOCK_COPYRIGHT),
            DeviceCommand::Version => self.reply(MOCK_VERSION),
            DeviceCommand::SetVoltage(v) => self.regs.voltage = v,
            DeviceCommand::SetRepeat(on) => self.regs.repeat = on,
            DeviceCommand::SetCounting(true) => self.start_counting(),
            DeviceCommand::SetCounting(false) => self.stop_counting(),
            DeviceCommand::SetSpeaker(mode) => {
                tracing::debug!(bits = mode.bits(), "Mock speaker mode set")
            }
            DeviceCommand::SetCountingTime(d) => self.regs.counting_time = d,
            DeviceCommand::ClearRegister => {
                self.regs.count = 0;
                self.regs.last_count = 0;
            }
        }
    }

    /// Emit frames for every event that is due
    fn generate(&mut self, now: Instant) {
        if !self.regs.counting {
            return;
        }

        while self.regs.counting && now >= self.next_event_at {
            if let (Some(limit), Some(start)) =
                (self.regs.counting_time.duration(), self.regs.started_at)
            {
                if self.next_event_at.duration_since(start) >= limit {
                    self.stop_counting();
                    if self.regs.repeat {
                        self.start_counting();
                    }
                    continue;
                }
            }

            self.regs.count += 1;
            let frame = encode_frame(self.next_interval_us);
            self.outbox.extend(frame);
            let fired_at = self.next_event_at;
            self.schedule_next(fired_at);
        }
    }

    fn check_link(&self) -> io::Result<()> {
        if self.link.is_severed() {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock device unplugged"))
        } else {
            Ok(())
        }
    }
}

impl Transport for MockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            self.check_link()?;
            let now = Instant::now();
            self.generate(now);

            if !self.outbox.is_empty() {
                let n = buf.len().min(self.outbox.len());
                for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }

            if now >= deadline {
                return Ok(0);
            }
            let wake = if self.regs.counting {
                deadline.min(self.next_event_at)
            } else {
                deadline
            };
            thread::sleep(wake.saturating_duration_since(now));
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.check_link()?;
        self.inbox.extend_from_slice(data);

        while let Some(pos) = self.inbox.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.inbox.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            match DeviceCommand::parse(&text) {
                Ok(command) => self.handle_command(command),
                Err(e) => tracing::debug!("Mock rejected command {:?}: {}", text.trim(), e),
            }
        }
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.check_link()?;
        self.outbox.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        MOCK_TARGET.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::FrameDecoder;
    use bytes::BytesMut;

    fn fast_mock() -> MockDevice {
        let config = MockConfig {
            min_interval_us: 100,
            max_interval_us: 500,
            seed: Some(42),
        };
        MockDevice::new(&config, Duration::from_millis(2))
    }

    fn read_line(device: &mut MockDevice) -> String {
        let mut buf = [0u8; 128];
        let n = device.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).trim_end().to_string()
    }

    #[test]
    fn test_identification() {
        let mut device = fast_mock();
        device.write_all(b"c\n").unwrap();
        assert_eq!(read_line(&mut device), MOCK_COPYRIGHT);
        device.write_all(b"v\n").unwrap();
        assert_eq!(read_line(&mut device), MOCK_VERSION);
    }

    #[test]
    fn test_status_reflects_settings() {
        let mut device = fast_mock();
        device.write_all(b"j650\no1\nf1\nb2\n").unwrap();
        let status = DeviceStatus::parse(&read_line(&mut device)).unwrap();
        assert_eq!(status.voltage, 650);
        assert!(status.repeat);
        assert_eq!(status.counting_time, 1);
    }

    #[test]
    fn test_silent_until_counting() {
        let mut device = fast_mock();
        let mut buf = [0u8; 64];
        assert_eq!(device.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_emits_frames_within_interval_range() {
        let mut device = fast_mock();
        device.write_all(b"f0\ns1\n").unwrap();

        let mut decoder = FrameDecoder::new();
        let mut acc = BytesMut::new();
        let mut values = Vec::new();
        let mut buf = [0u8; 256];
        let started = Instant::now();
        while values.len() < 20 && started.elapsed() < Duration::from_secs(2) {
            let n = device.read(&mut buf).unwrap();
            acc.extend_from_slice(&buf[..n]);
            values.extend(decoder.decode(&mut acc));
        }

        assert!(values.len() >= 20);
        assert!(values.iter().all(|v| (100..=500).contains(v)));
        assert_eq!(decoder.stats().corrupt_frames, 0);
    }

    #[test]
    fn test_only_stop_accepted_while_counting() {
        let mut device = fast_mock();
        device.write_all(b"f0\ns1\nj400\n").unwrap();
        assert!(device.is_counting());
        device.write_all(b"s0\n").unwrap();
        assert!(!device.is_counting());

        device.clear_input().unwrap();
        device.write_all(b"b2\n").unwrap();
        let status = DeviceStatus::parse(&read_line(&mut device)).unwrap();
        assert_eq!(status.voltage, 500);
    }

    #[test]
    fn test_severed_link_errors() {
        let mut device = fast_mock();
        let link = device.link();
        link.sever();
        let mut buf = [0u8; 8];
        let err = device.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(device.write_all(b"c\n").is_err());
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let mut a = fast_mock();
        let mut b = fast_mock();
        let xs: Vec<u32> = (0..16).map(|_| a.draw_interval()).collect();
        let ys: Vec<u32> = (0..16).map(|_| b.draw_interval()).collect();
        assert_eq!(xs, ys);
    }
}
