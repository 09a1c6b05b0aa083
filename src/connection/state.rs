//! Connection state shared with the acquisition thread

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    ConnectedIdle = 2,
    Acquiring = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::ConnectedIdle,
            3 => ConnectionState::Acquiring,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Whether a link is open
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::ConnectedIdle | ConnectionState::Acquiring)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ConnectedIdle => "connected",
            ConnectionState::Acquiring => "acquiring",
        };
        f.write_str(name)
    }
}

/// Atomic cell holding the current state
///
/// Written by the connection manager, polled by the worker every loop.
#[derive(Debug, Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn new(state: ConnectionState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::debug!("Connection state {} -> {}", previous, state);
        }
    }

    pub fn is(&self, state: ConnectionState) -> bool {
        self.get() == state
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_state_roundtrip() {
        let state = SharedState::default();
        let view = state.clone();
        assert!(view.is(ConnectionState::Disconnected));

        for s in [
            ConnectionState::Connecting,
            ConnectionState::ConnectedIdle,
            ConnectionState::Acquiring,
        ] {
            state.set(s);
            assert_eq!(view.get(), s);
        }
        assert!(view.get().is_connected());
    }
}
