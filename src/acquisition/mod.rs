//! Acquisition subsystem: transports, the worker thread and the ingestion queue

pub mod mock;
pub mod ports;
pub mod queue;
pub mod sample;
pub mod transport;
pub mod worker;

pub use mock::{MockDevice, MockLink};
pub use ports::{list_ports, PortInfo};
pub use queue::{IngestionQueue, OverflowPolicy, QueueCapacity, QueueStats};
pub use sample::{Sample, SequenceCounter};
pub use transport::{share, SerialTransport, SharedTransport, TcpTransport, Transport, UdpTransport};
pub use worker::{AcquisitionWorker, WorkerContext, WorkerEvent};
