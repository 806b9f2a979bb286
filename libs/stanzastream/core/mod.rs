//! # stanzastream core
//!
//! The connection engine: stream negotiation, the reader/writer/
//! dispatcher pipeline, collectors, authentication, and configuration.
//!
//! ## Example
//!
//! ```rust,ignore
//! use stanzastream::{builder, SecurityMode, XmppConnection};
//!
//! #[tokio::main]
//! async fn main() -> stanzastream::Result<()> {
//!     let config = stanzastream::builder()
//!         .address("talk.example.test", 5222, "example.test")
//!         .security(SecurityMode::Required)
//!         .build();
//!
//!     let connection = XmppConnection::new(config);
//!     connection.connect().await?;
//!     let address = connection.login("alice", "correct horse", "laptop").await?;
//!     println!("logged in as {address}");
//!
//!     connection.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod collector;
pub mod compression;
pub mod config;
pub mod connection;
pub mod connection_state;
pub mod dispatcher;
pub mod features;
pub mod framing;
pub mod heartbeat;
pub mod reader;
pub mod requests;
pub mod sasl;
pub mod tls;
pub mod writer;

// Re-export main types
pub use builder::{states, ConnectionConfigBuilder};
pub use collector::StanzaCollector;
pub use config::{ConnectionConfig, SecurityMode};
pub use connection::XmppConnection;
pub use connection_state::{AtomicConnectionState, ConnectionState};
pub use features::StreamFeatures;

// Re-export traits for convenience
pub use crate::traits::*;

/// Create a new connection configuration builder
///
/// This is a convenience function for starting the builder pattern.
///
/// # Example
/// ```ignore
/// let config = stanzastream::builder()
///     .address("127.0.0.1", 5222, "example.test")
///     .reply_timeout(Duration::from_secs(10))
///     .enable_compression()
///     .build();
/// ```
pub fn builder() -> ConnectionConfigBuilder<builder::states::NoAddress> {
    ConnectionConfigBuilder::new()
}
