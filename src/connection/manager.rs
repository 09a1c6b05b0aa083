//! Connection manager
//!
//! Owns the active link and its acquisition worker, runs the connection state
//! machine and drives reconnection after a link is lost. All methods are
//! called from the consumer context; the worker only talks back through its
//! event channel.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::acquisition::mock::{MockDevice, MockLink};
use crate::acquisition::queue::IngestionQueue;
use crate::acquisition::sample::SequenceCounter;
use crate::acquisition::transport::{
    share, SerialTransport, SharedTransport, TcpTransport, Transport, UdpTransport,
};
use crate::acquisition::worker::{AcquisitionWorker, WorkerContext, WorkerEvent};
use crate::config::{AcquisitionConfig, AppConfig, MockConfig, ReconnectConfig, SerialConfig};
use crate::connection::device::{negotiate, Device};
use crate::connection::events::{EventHub, SampleEvent, Severity, StatusEvent, StatusKind};
use crate::connection::state::{ConnectionState, SharedState};
use crate::constants::MOCK_TARGET;
use crate::error::{ConnectionError, Error, Result};
use crate::protocol::{DeviceInfo, DeviceProfile, FrameDecoder, LineDecoder, SampleDecoder};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const STATUS_CLEAR_AFTER: Duration = Duration::from_secs(5);

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Built-in synthetic device
    Mock,
    /// Serial port path such as `/dev/ttyUSB0` or `COM3`
    Serial(String),
    /// Simulation server over UDP, `host:port`
    Udp(String),
    /// Simulation server over TCP, `host:port`
    Tcp(String),
}

impl Target {
    /// Decoder matching the bytes this target produces
    pub fn decoder(&self) -> Box<dyn SampleDecoder> {
        match self {
            Target::Mock | Target::Serial(_) => Box::new(FrameDecoder::new()),
            Target::Udp(_) | Target::Tcp(_) => Box::new(LineDecoder::new()),
        }
    }

    /// Whether the device command protocol is probed on connect
    pub fn negotiates(&self) -> bool {
        matches!(self, Target::Mock | Target::Serial(_))
    }
}

impl FromStr for Target {
    type Err = ConnectionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConnectionError::InvalidTarget("empty target".to_string()));
        }
        if s.eq_ignore_ascii_case(MOCK_TARGET) {
            return Ok(Target::Mock);
        }

        let remote = |rest: &str| {
            if rest.is_empty() {
                Err(ConnectionError::InvalidTarget(format!("{}: missing address", s)))
            } else {
                Ok(rest.to_string())
            }
        };
        if let Some(rest) = s.strip_prefix("udp://") {
            return remote(rest).map(Target::Udp);
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            return remote(rest).map(Target::Tcp);
        }
        if s.contains("://") {
            return Err(ConnectionError::InvalidTarget(format!("{}: unknown scheme", s)));
        }
        Ok(Target::Serial(s.to_string()))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Mock => f.write_str(MOCK_TARGET),
            Target::Serial(path) => f.write_str(path),
            Target::Udp(addr) => write!(f, "udp://{}", addr),
            Target::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Opens transports for targets
pub trait Connector: Send {
    fn open(&mut self, target: &Target) -> std::result::Result<Box<dyn Transport>, ConnectionError>;
}

/// Connector for real serial ports, simulation servers and the mock device
pub struct SystemConnector {
    serial: SerialConfig,
    mock: MockConfig,
    mock_link: Option<MockLink>,
}

impl SystemConnector {
    pub fn new(serial: SerialConfig, mock: MockConfig) -> Self {
        Self {
            serial,
            mock,
            mock_link: None,
        }
    }

    /// Get the link handle of the most recently opened mock device
    pub fn mock_link(&self) -> Option<MockLink> {
        self.mock_link.clone()
    }
}

impl Connector for SystemConnector {
    fn open(&mut self, target: &Target) -> std::result::Result<Box<dyn Transport>, ConnectionError> {
        let read_timeout = self.serial.read_timeout();
        let failed = |reason: String| ConnectionError::OpenFailed {
            target: target.to_string(),
            reason,
        };

        let transport: Box<dyn Transport> = match target {
            Target::Mock => {
                let device = MockDevice::new(&self.mock, read_timeout);
                self.mock_link = Some(device.link());
                Box::new(device)
            }
            Target::Serial(path) => Box::new(
                SerialTransport::open(path, self.serial.baud_rate, read_timeout)
                    .map_err(|e| failed(e.to_string()))?,
            ),
            Target::Udp(addr) => Box::new(
                UdpTransport::open(addr, read_timeout).map_err(|e| failed(e.to_string()))?,
            ),
            Target::Tcp(addr) => Box::new(
                TcpTransport::open(addr, TCP_CONNECT_TIMEOUT, read_timeout)
                    .map_err(|e| failed(e.to_string()))?,
            ),
        };
        Ok(transport)
    }
}

/// An open link
struct Link {
    transport: SharedTransport,
    target: Target,
    profile: DeviceProfile,
    info: Option<DeviceInfo>,
}

/// Pending reconnection
#[derive(Debug, Clone, Copy)]
struct ReconnectPlan {
    attempt: u32,
    next_at: Instant,
    resume_acquiring: bool,
}

/// Connection lifecycle and reconnection policy
pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    serial: SerialConfig,
    acquisition: AcquisitionConfig,
    reconnect: ReconnectConfig,

    state: SharedState,
    link: Option<Link>,
    last_target: Option<Target>,
    plan: Option<ReconnectPlan>,

    worker: AcquisitionWorker,
    worker_tx: Sender<WorkerEvent>,
    worker_rx: Receiver<WorkerEvent>,

    queue: IngestionQueue,
    sequence: SequenceCounter,
    status: EventHub<StatusEvent>,
    samples: EventHub<SampleEvent>,
}

impl ConnectionManager {
    /// Create a manager opening real transports
    pub fn new(config: &AppConfig, queue: IngestionQueue) -> Self {
        let connector = SystemConnector::new(config.serial.clone(), config.mock.clone());
        Self::with_connector(config, queue, Box::new(connector))
    }

    pub fn with_connector(
        config: &AppConfig,
        queue: IngestionQueue,
        connector: Box<dyn Connector>,
    ) -> Self {
        let (worker_tx, worker_rx) = unbounded();
        Self {
            connector,
            serial: config.serial.clone(),
            acquisition: config.acquisition.clone(),
            reconnect: config.reconnect.clone(),
            state: SharedState::default(),
            link: None,
            last_target: None,
            plan: None,
            worker: AcquisitionWorker::new(config.acquisition.join_timeout()),
            worker_tx,
            worker_rx,
            queue,
            sequence: SequenceCounter::new(),
            status: EventHub::new(),
            samples: EventHub::new(),
        }
    }

    /// Open a link to `target` and start its worker in the idle state
    ///
    /// Any existing link is closed first.
    pub fn connect(&mut self, target: &str) -> Result<()> {
        if self.link.is_some() || self.plan.is_some() {
            self.disconnect();
        }

        let target = match target.parse::<Target>() {
            Ok(target) => target,
            Err(e) => return Err(self.connect_failed(target, e)),
        };

        self.state.set(ConnectionState::Connecting);
        tracing::info!("Connecting to {}", target);

        match self.establish(&target) {
            Ok(()) => {
                self.last_target = Some(target.clone());
                self.state.set(ConnectionState::ConnectedIdle);
                self.emit(
                    StatusEvent::new(
                        StatusKind::Connected,
                        Severity::Success,
                        format!("Connected to {}", target),
                    )
                    .clear_after(STATUS_CLEAR_AFTER),
                );
                Ok(())
            }
            Err(e) => {
                self.state.set(ConnectionState::Disconnected);
                Err(self.connect_failed(&target.to_string(), e))
            }
        }
    }

    fn connect_failed(&self, target: &str, error: ConnectionError) -> Error {
        tracing::error!("Failed to connect to {}: {}", target, error);
        self.emit(StatusEvent::new(
            StatusKind::ConnectFailed,
            Severity::Error,
            format!("Connection to {} failed: {}", target, error),
        ));
        Error::Connection(error)
    }

    /// Open, negotiate and start the worker
    fn establish(&mut self, target: &Target) -> std::result::Result<(), ConnectionError> {
        let mut transport = self.connector.open(target)?;

        let (profile, info) = if target.negotiates() {
            negotiate(&mut *transport, self.serial.negotiation_timeout())
        } else {
            (DeviceProfile::Raw, None)
        };

        let link = Link {
            transport: share(transport),
            target: target.clone(),
            profile,
            info,
        };

        self.worker.start(WorkerContext {
            transport: link.transport.clone(),
            decoder: target.decoder(),
            queue: self.queue.clone(),
            state: self.state.clone(),
            sequence: self.sequence.clone(),
            samples: self.samples.clone(),
            events: self.worker_tx.clone(),
            config: self.acquisition.clone(),
            read_chunk: self.serial.read_chunk,
        })?;

        tracing::info!("Link to {} up ({} profile)", target, profile.name());
        self.link = Some(link);
        Ok(())
    }

    /// Close the link and cancel any pending reconnection
    pub fn disconnect(&mut self) {
        let had_plan = self.plan.take().is_some();
        if self.state.is(ConnectionState::Acquiring) {
            self.stop_acquisition();
        }

        self.worker.stop();
        let closed = self.link.take();
        while self.worker_rx.try_recv().is_ok() {}
        self.state.set(ConnectionState::Disconnected);

        if let Some(link) = closed {
            tracing::info!("Disconnected from {}", link.target);
            self.emit(StatusEvent::new(
                StatusKind::Disconnected,
                Severity::Info,
                format!("Disconnected from {}", link.target),
            ));
        } else if had_plan {
            tracing::info!("Reconnection cancelled");
            self.emit(StatusEvent::new(
                StatusKind::Disconnected,
                Severity::Info,
                "Reconnection cancelled",
            ));
        }
    }

    /// Begin acquiring on the open link
    ///
    /// A no-op while already acquiring.
    pub fn start_acquisition(&mut self) -> Result<()> {
        if self.state.is(ConnectionState::Acquiring) {
            return Ok(());
        }
        if self.link.is_none() || !self.state.get().is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }

        self.begin_acquisition();
        self.emit(
            StatusEvent::new(
                StatusKind::AcquisitionStarted,
                Severity::Info,
                "Acquisition started",
            )
            .clear_after(STATUS_CLEAR_AFTER),
        );
        Ok(())
    }

    fn begin_acquisition(&self) {
        let Some(link) = &self.link else {
            return;
        };

        if let Err(e) = link.transport.lock().clear_input() {
            tracing::warn!("Failed to flush input before acquiring: {}", e);
        }
        if link.profile.supports_commands() {
            if let Err(e) = self.device().set_counting(true) {
                tracing::warn!("Failed to start counting: {}", e);
            }
        }
        self.state.set(ConnectionState::Acquiring);
        tracing::info!("Acquisition started on {}", link.target);
    }

    /// Return to the idle connected state
    pub fn stop_acquisition(&mut self) {
        if !self.state.is(ConnectionState::Acquiring) {
            return;
        }

        self.state.set(ConnectionState::ConnectedIdle);
        if let Some(link) = &self.link {
            if link.profile.supports_commands() {
                if let Err(e) = self.device().set_counting(false) {
                    tracing::warn!("Failed to stop counting: {}", e);
                }
            }
        }

        tracing::info!(
            "Acquisition stopped after {} samples",
            self.worker.samples_produced()
        );
        self.emit(
            StatusEvent::new(
                StatusKind::AcquisitionStopped,
                Severity::Info,
                "Acquisition stopped",
            )
            .clear_after(STATUS_CLEAR_AFTER),
        );
    }

    /// Handle worker events and drive reconnection; call once per tick
    pub fn poll(&mut self) {
        while let Ok(event) = self.worker_rx.try_recv() {
            match event {
                WorkerEvent::ConnectionLost { reason } => self.handle_loss(reason),
            }
        }
        self.drive_reconnect();
    }

    fn handle_loss(&mut self, reason: String) {
        let Some(link) = self.link.take() else {
            return;
        };
        let resume_acquiring = self.state.is(ConnectionState::Acquiring);
        self.worker.stop();
        drop(link);

        if !self.reconnect.enabled() {
            self.state.set(ConnectionState::Disconnected);
            self.emit(StatusEvent::new(
                StatusKind::ConnectionLost,
                Severity::Error,
                format!("Connection lost: {}", reason),
            ));
            return;
        }

        self.state.set(ConnectionState::Connecting);
        self.plan = Some(ReconnectPlan {
            attempt: 0,
            next_at: Instant::now() + self.reconnect.delay(),
            resume_acquiring,
        });
        tracing::warn!(
            "Connection lost ({}), reconnecting in {:?}",
            reason,
            self.reconnect.delay()
        );
        self.emit(StatusEvent::new(
            StatusKind::ConnectionLost,
            Severity::Warning,
            format!("Connection lost: {}", reason),
        ));
    }

    fn drive_reconnect(&mut self) {
        let Some(mut plan) = self.plan else {
            return;
        };
        if Instant::now() < plan.next_at {
            return;
        }
        let Some(target) = self.last_target.clone() else {
            self.plan = None;
            return;
        };

        plan.attempt += 1;
        let max_attempts = self.reconnect.max_attempts;
        self.emit(StatusEvent::new(
            StatusKind::Reconnecting {
                attempt: plan.attempt,
                max_attempts,
            },
            Severity::Warning,
            format!("Reconnecting (attempt {}/{})", plan.attempt, max_attempts),
        ));

        match self.establish(&target) {
            Ok(()) => {
                self.plan = None;
                self.state.set(ConnectionState::ConnectedIdle);
                tracing::info!("Reconnected to {} on attempt {}", target, plan.attempt);
                self.emit(
                    StatusEvent::new(
                        StatusKind::Reconnected,
                        Severity::Success,
                        format!("Reconnected to {}", target),
                    )
                    .clear_after(STATUS_CLEAR_AFTER),
                );
                if plan.resume_acquiring {
                    self.begin_acquisition();
                }
            }
            Err(e) if plan.attempt >= max_attempts => {
                self.plan = None;
                self.state.set(ConnectionState::Disconnected);
                tracing::error!(
                    "Giving up on {} after {} attempts: {}",
                    target,
                    plan.attempt,
                    e
                );
                self.emit(StatusEvent::new(
                    StatusKind::ReconnectFailed,
                    Severity::Error,
                    format!("Reconnection failed after {} attempts", plan.attempt),
                ));
            }
            Err(e) => {
                tracing::warn!("Reconnect attempt {} failed: {}", plan.attempt, e);
                plan.next_at = Instant::now() + self.reconnect.delay();
                self.plan = Some(plan);
            }
        }
    }

    fn emit(&self, event: StatusEvent) {
        self.status.publish(event);
    }

    /// Publish a status event from outside the manager
    pub fn notify(&self, event: StatusEvent) {
        self.emit(event);
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Whether a reconnection is pending
    pub fn is_reconnecting(&self) -> bool {
        self.plan.is_some()
    }

    /// Command handle for the connected device
    pub fn device(&self) -> Device<'_> {
        let profile = self
            .link
            .as_ref()
            .map(|link| link.profile)
            .unwrap_or(DeviceProfile::Raw);
        Device::new(
            self.link.as_ref().map(|link| &link.transport),
            profile,
            self.state.is(ConnectionState::Acquiring),
            self.serial.negotiation_timeout(),
        )
    }

    /// Get the negotiated profile of the open link
    pub fn profile(&self) -> Option<DeviceProfile> {
        self.link.as_ref().map(|link| link.profile)
    }

    /// Get the identification strings of the open link
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.link.as_ref().and_then(|link| link.info.as_ref())
    }

    /// Get the open or most recent target
    pub fn target(&self) -> Option<&Target> {
        self.link
            .as_ref()
            .map(|link| &link.target)
            .or(self.last_target.as_ref())
    }

    /// Restart sample numbering at zero and drop everything still queued
    ///
    /// Both happen under the sequence lock, so no sample numbered before the
    /// restart can reach the queue afterwards. Returns the dropped count.
    pub fn reset_sequence(&self) -> usize {
        self.sequence.restart(|| self.queue.clear())
    }

    /// Get the index the next sample will receive
    pub fn next_sequence(&self) -> u64 {
        self.sequence.peek()
    }

    /// Samples produced by the current worker run
    pub fn samples_produced(&self) -> u64 {
        self.worker.samples_produced()
    }

    pub fn queue(&self) -> &IngestionQueue {
        &self.queue
    }

    pub fn status_hub(&self) -> &EventHub<StatusEvent> {
        &self.status
    }

    pub fn sample_hub(&self) -> &EventHub<SampleEvent> {
        &self.samples
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.link.is_some() {
            self.disconnect();
        }
    }
}
