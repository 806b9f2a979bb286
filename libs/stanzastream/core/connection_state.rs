//! Atomic connection state cell
//!
//! The negotiation path is strictly linear; the only way back is a full
//! disconnect. State is read from many threads (user calls, reader task,
//! reconnection manager) so it lives in a single atomic.

use std::sync::atomic::{AtomicU8, Ordering};

/// Position in the stream negotiation path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    /// Socket connect in progress
    Connecting = 1,
    /// Opening tags exchanged
    StreamOpened = 2,
    /// `<starttls/>` sent, handshake not finished
    TlsNegotiating = 3,
    /// TLS handshake done, stream reopened
    Secured = 4,
    /// Compression requested, waiting for the verdict
    Compressing = 5,
    /// SASL or legacy auth exchange running
    Authenticating = 6,
    ResourceBinding = 7,
    SessionEstablishing = 8,
    /// Fully logged in with a bound resource
    Authenticated = 9,
    /// Orderly shutdown in progress
    Closing = 10,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::StreamOpened,
            3 => ConnectionState::TlsNegotiating,
            4 => ConnectionState::Secured,
            5 => ConnectionState::Compressing,
            6 => ConnectionState::Authenticating,
            7 => ConnectionState::ResourceBinding,
            8 => ConnectionState::SessionEstablishing,
            9 => ConnectionState::Authenticated,
            _ => ConnectionState::Closing,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::StreamOpened => "stream-opened",
            ConnectionState::TlsNegotiating => "tls-negotiating",
            ConnectionState::Secured => "secured",
            ConnectionState::Compressing => "compressing",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::ResourceBinding => "resource-binding",
            ConnectionState::SessionEstablishing => "session-establishing",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Lock-free state cell shared between the connection handle and its
/// background tasks
pub struct AtomicConnectionState {
    state: AtomicU8,
}

impl AtomicConnectionState {
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
        }
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Stream negotiated and not shutting down: the connection accepts
    /// traffic
    pub fn is_connected(&self) -> bool {
        !matches!(
            self.get(),
            ConnectionState::Disconnected | ConnectionState::Connecting | ConnectionState::Closing
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.get() == ConnectionState::Authenticated
    }

    pub fn is_closing(&self) -> bool {
        self.get() == ConnectionState::Closing
    }
}

impl Default for AtomicConnectionState {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_state() {
        let cell = AtomicConnectionState::default();
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::StreamOpened,
            ConnectionState::TlsNegotiating,
            ConnectionState::Secured,
            ConnectionState::Compressing,
            ConnectionState::Authenticating,
            ConnectionState::ResourceBinding,
            ConnectionState::SessionEstablishing,
            ConnectionState::Authenticated,
            ConnectionState::Closing,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn connected_excludes_edges_of_lifecycle() {
        let cell = AtomicConnectionState::default();
        assert!(!cell.is_connected());
        cell.set(ConnectionState::StreamOpened);
        assert!(cell.is_connected());
        cell.set(ConnectionState::Authenticated);
        assert!(cell.is_connected());
        assert!(cell.is_authenticated());
        cell.set(ConnectionState::Closing);
        assert!(!cell.is_connected());
    }
}
