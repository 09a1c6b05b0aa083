//! Connection subsystem: lifecycle, device commands and status events

pub mod device;
pub mod events;
pub mod manager;
pub mod state;

pub use device::{negotiate, Device, MeasurementSettings};
pub use events::{EventHub, SampleEvent, Severity, StatusEvent, StatusKind};
pub use manager::{ConnectionManager, Connector, SystemConnector, Target};
pub use state::{ConnectionState, SharedState};
