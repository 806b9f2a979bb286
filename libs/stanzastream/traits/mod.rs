//! # stanzastream traits
//!
//! Core traits and types for the stanzastream connection engine:
//!
//! - **StanzaFilter**: select which stanzas a collector or listener sees
//! - **StanzaListener / StanzaInterceptor / ConnectionListener**: the
//!   callback seams of the pipeline
//! - **SaslMechanism**: pluggable challenge/response authentication
//! - **ReconnectPolicy**: control backoff between reconnection attempts
//!
//! ## Example
//!
//! ```rust,ignore
//! use stanzastream::traits::*;
//!
//! // A filter is just a predicate; closures work directly:
//! let errors_only = |s: &Stanza| s.is_error();
//!
//! // A custom mechanism plugs into the registry:
//! let mut registry = MechanismRegistry::with_defaults();
//! registry.register_preferred("X-TOKEN", |creds| Box::new(TokenMechanism::new(creds)));
//! ```

pub mod error;
pub mod filter;
pub mod listener;
pub mod mechanism;
pub mod reconnect;
pub mod stanza;

// Re-export commonly used types
pub use error::{Result, StreamEngineError};
pub use filter::{AcceptAll, AndFilter, IdFilter, KindFilter, StanzaFilter};
pub use listener::{ConnectionEvent, ConnectionListener, StanzaInterceptor, StanzaListener};
pub use mechanism::{
    Anonymous, Credentials, External, MechanismRegistry, Plain, SaslMechanism, ScramSha256,
};
pub use reconnect::{FixedDelay, NeverReconnect, RandomIncreasingDelay, ReconnectPolicy};
pub use stanza::{Stanza, StanzaError, StanzaKind, StreamHeader};
