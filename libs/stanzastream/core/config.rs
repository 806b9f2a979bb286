use std::sync::Arc;
use std::time::Duration;

use crate::mechanism::MechanismRegistry;
use crate::reconnect::{RandomIncreasingDelay, ReconnectPolicy};

/// How to treat TLS during stream negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Fail the connection when the server does not offer starttls
    Required,
    /// Negotiate TLS when offered, continue in plaintext otherwise
    Enabled,
    /// Never negotiate TLS
    Disabled,
}

/// Connection configuration.
///
/// Built with [`crate::builder()`]; the server address is the only
/// required input, enforced at compile time by the type-state builder.
pub struct ConnectionConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) service_name: String,
    pub(crate) security: SecurityMode,
    pub(crate) sasl_enabled: bool,
    pub(crate) compression_enabled: bool,
    pub(crate) reconnection_allowed: bool,
    pub(crate) reply_timeout: Duration,
    pub(crate) collector_capacity: usize,
    pub(crate) keep_alive_interval: Duration,
    pub(crate) tls_config: Option<Arc<tokio_rustls::rustls::ClientConfig>>,
    pub(crate) accept_invalid_certs: bool,
    pub(crate) mechanisms: Arc<MechanismRegistry>,
    pub(crate) reconnect_policy: Arc<dyn ReconnectPolicy>,
}

impl ConnectionConfig {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The protocol domain used in the stream header and for TLS SNI;
    /// may differ from the socket host
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn security(&self) -> SecurityMode {
        self.security
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn collector_capacity(&self) -> usize {
        self.collector_capacity
    }

    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
    }

    pub fn is_reconnection_allowed(&self) -> bool {
        self.reconnection_allowed
    }

    pub fn is_compression_enabled(&self) -> bool {
        self.compression_enabled
    }
}

pub(crate) mod defaults {
    use std::time::Duration;

    pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
    pub const COLLECTOR_CAPACITY: usize = 5000;
    pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
}

pub(crate) fn default_reconnect_policy() -> Arc<dyn ReconnectPolicy> {
    Arc::new(RandomIncreasingDelay::new())
}
