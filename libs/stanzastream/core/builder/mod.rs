pub mod states;

use std::sync::Arc;
use std::time::Duration;

use states::*;

use crate::config::{defaults, default_reconnect_policy, ConnectionConfig, SecurityMode};
use crate::mechanism::MechanismRegistry;
use crate::reconnect::ReconnectPolicy;

/// Type-state builder for [`ConnectionConfig`]
///
/// The server address is required and enforced by the type system;
/// everything else has defaults matching a plain client deployment:
/// TLS when offered, SASL on, compression off, reconnection on.
pub struct ConnectionConfigBuilder<A>
where
    A: AddressState,
{
    _state: TypeState<A>,
    host: Option<String>,
    port: u16,
    service_name: Option<String>,
    security: SecurityMode,
    sasl_enabled: bool,
    compression_enabled: bool,
    reconnection_allowed: bool,
    reply_timeout: Duration,
    collector_capacity: usize,
    keep_alive_interval: Duration,
    tls_config: Option<Arc<tokio_rustls::rustls::ClientConfig>>,
    accept_invalid_certs: bool,
    mechanisms: Option<MechanismRegistry>,
    reconnect_policy: Option<Arc<dyn ReconnectPolicy>>,
}

impl ConnectionConfigBuilder<NoAddress> {
    pub fn new() -> Self {
        Self {
            _state: TypeState::new(),
            host: None,
            port: 5222,
            service_name: None,
            security: SecurityMode::Enabled,
            sasl_enabled: true,
            compression_enabled: false,
            reconnection_allowed: true,
            reply_timeout: defaults::REPLY_TIMEOUT,
            collector_capacity: defaults::COLLECTOR_CAPACITY,
            keep_alive_interval: defaults::KEEP_ALIVE_INTERVAL,
            tls_config: None,
            accept_invalid_certs: false,
            mechanisms: None,
            reconnect_policy: None,
        }
    }

    /// Set host, port and service name in one step. The service name is
    /// the protocol domain (stream `to=`, TLS SNI); the host is the
    /// socket target.
    pub fn address(
        self,
        host: impl Into<String>,
        port: u16,
        service_name: impl Into<String>,
    ) -> ConnectionConfigBuilder<HasAddress> {
        ConnectionConfigBuilder {
            _state: TypeState::new(),
            host: Some(host.into()),
            port,
            service_name: Some(service_name.into()),
            security: self.security,
            sasl_enabled: self.sasl_enabled,
            compression_enabled: self.compression_enabled,
            reconnection_allowed: self.reconnection_allowed,
            reply_timeout: self.reply_timeout,
            collector_capacity: self.collector_capacity,
            keep_alive_interval: self.keep_alive_interval,
            tls_config: self.tls_config,
            accept_invalid_certs: self.accept_invalid_certs,
            mechanisms: self.mechanisms,
            reconnect_policy: self.reconnect_policy,
        }
    }
}

impl Default for ConnectionConfigBuilder<NoAddress> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> ConnectionConfigBuilder<A>
where
    A: AddressState,
{
    pub fn security(mut self, mode: SecurityMode) -> Self {
        self.security = mode;
        self
    }

    /// Disable SASL; login goes straight to the legacy handshake
    pub fn disable_sasl(mut self) -> Self {
        self.sasl_enabled = false;
        self
    }

    /// Negotiate zlib stream compression when the server offers it
    pub fn enable_compression(mut self) -> Self {
        self.compression_enabled = true;
        self
    }

    /// Allow or forbid the automatic reconnection manager
    pub fn reconnection(mut self, allowed: bool) -> Self {
        self.reconnection_allowed = allowed;
        self
    }

    /// Bound for synchronous replies; stream negotiation waits up to
    /// three times this value
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Buffer capacity of newly created collectors
    pub fn collector_capacity(mut self, capacity: usize) -> Self {
        self.collector_capacity = capacity.max(1);
        self
    }

    /// Idle interval after which one keep-alive byte is written
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Inject a fully custom rustls client configuration (truststore,
    /// client certificates)
    pub fn tls_config(mut self, config: Arc<tokio_rustls::rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Skip certificate verification. For test servers only.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Replace the mechanism registry (default: SCRAM-SHA-256, PLAIN)
    pub fn mechanisms(mut self, registry: MechanismRegistry) -> Self {
        self.mechanisms = Some(registry);
        self
    }

    /// Replace the reconnection backoff policy (default: random
    /// increasing delay)
    pub fn reconnect_policy(mut self, policy: impl ReconnectPolicy + 'static) -> Self {
        self.reconnect_policy = Some(Arc::new(policy));
        self
    }
}

// Build is only available once the address is set
impl ConnectionConfigBuilder<HasAddress> {
    pub fn build(self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.host.expect("address state guarantees host"),
            port: self.port,
            service_name: self.service_name.expect("address state guarantees service name"),
            security: self.security,
            sasl_enabled: self.sasl_enabled,
            compression_enabled: self.compression_enabled,
            reconnection_allowed: self.reconnection_allowed,
            reply_timeout: self.reply_timeout,
            collector_capacity: self.collector_capacity,
            keep_alive_interval: self.keep_alive_interval,
            tls_config: self.tls_config,
            accept_invalid_certs: self.accept_invalid_certs,
            mechanisms: Arc::new(self.mechanisms.unwrap_or_else(MechanismRegistry::with_defaults)),
            reconnect_policy: self.reconnect_policy.unwrap_or_else(default_reconnect_policy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_defaults() {
        let config = ConnectionConfigBuilder::new()
            .address("localhost", 5222, "example.test")
            .build();
        assert_eq!(config.security(), SecurityMode::Enabled);
        assert_eq!(config.reply_timeout(), defaults::REPLY_TIMEOUT);
        assert!(config.is_reconnection_allowed());
        assert!(!config.is_compression_enabled());
        assert_eq!(config.service_name(), "example.test");
    }

    #[test]
    fn builder_overrides_stick() {
        let config = ConnectionConfigBuilder::new()
            .address("127.0.0.1", 15222, "example.test")
            .security(SecurityMode::Disabled)
            .disable_sasl()
            .enable_compression()
            .reconnection(false)
            .reply_timeout(Duration::from_millis(250))
            .collector_capacity(16)
            .build();
        assert_eq!(config.security(), SecurityMode::Disabled);
        assert!(!config.sasl_enabled);
        assert!(config.is_compression_enabled());
        assert!(!config.is_reconnection_allowed());
        assert_eq!(config.collector_capacity(), 16);
    }
}
