use thiserror::Error;

/// Main error type for stanzastream
///
/// Variants map to the failure classes of the engine: bounded waits that
/// expired, server-reported failures, configuration that contradicts what
/// the server offers, socket failures, and misuse of the connection
/// lifecycle (double login, sending while disconnected).
#[derive(Error, Debug, Clone)]
pub enum StreamEngineError {
    /// No server response within the bound for a synchronous operation
    #[error("timed out waiting for {operation} after {waited_ms}ms")]
    ConnectionTimeout {
        operation: &'static str,
        waited_ms: u64,
    },

    /// Server-reported failure (IQ error, SASL failure, malformed traffic)
    #[error("protocol failure: {0}")]
    ProtocolFailure(String),

    /// Fatal `<stream:error/>` from the server
    #[error("stream error <{condition}/>{}", text.as_deref().map(|t| format!(": {t}")).unwrap_or_default())]
    StreamError {
        condition: String,
        text: Option<String>,
    },

    /// Configuration demands something the server does not offer
    #[error("configuration conflict: {0}")]
    ConfigurationConflict(String),

    /// Socket read/write failure
    #[error("io failure: {0}")]
    IoFailure(String),

    /// Operation invalid in the current connection state
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Credentials rejected by every attempted mechanism
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A negotiation step the caller requires is absent from the offer
    #[error("{feature} not offered by server")]
    NotOffered { feature: &'static str },
}

impl StreamEngineError {
    /// True for the stream error that signals a duplicate-resource kick.
    ///
    /// A conflict means another session replaced this one; reconnecting
    /// would only kick the other session back, so the reconnection
    /// manager must never act on it.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StreamEngineError::StreamError { condition, .. } if condition == "conflict")
    }

    pub(crate) fn timeout(operation: &'static str, waited: std::time::Duration) -> Self {
        StreamEngineError::ConnectionTimeout {
            operation,
            waited_ms: waited.as_millis() as u64,
        }
    }
}

impl From<std::io::Error> for StreamEngineError {
    fn from(error: std::io::Error) -> Self {
        StreamEngineError::IoFailure(error.to_string())
    }
}

/// Result type for stanzastream operations
pub type Result<T> = std::result::Result<T, StreamEngineError>;
