//! Exchange connection management
//!
//! A [`ConnectionSupervisor`] keeps one websocket alive per endpoint: it owns
//! the transport, the liveness timers and the subscription history, and
//! reconnects after any fault.

pub mod supervisor;
pub mod timer;
pub mod transport;

pub use supervisor::{ConnectionSupervisor, SupervisorHandle};
pub use timer::Timer;
pub use transport::{Inbound, Transport, WsTransport};

use std::fmt;
use std::time::Duration;

/// Timing parameters of a supervised connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Silence tolerated before the connection is considered dead
    pub connection_timeout: Duration,
    /// Time allowed for a pong after a ping
    pub pong_timeout: Duration,
    pub ping_interval: Duration,
    /// Fixed delay between a fault and the next connect attempt
    pub reconnect_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(120),
            reconnect_interval: Duration::from_secs(10),
        }
    }
}

/// Lifecycle state of a supervised connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but the venue asked for a pause; sends are rejected.
    Paused,
    ReconnectPending,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Paused => "paused",
            ConnectionState::ReconnectPending => "reconnect_pending",
        }
    }

    /// Numeric code exported as a gauge
    pub fn code(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Paused => 3,
            ConnectionState::ReconnectPending => 4,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
