//! # stanzastream
//!
//! A client-side connection engine for XML-streaming instant-messaging
//! (XMPP-style) servers, built around strict pipeline ownership and a
//! synchronous request/response surface over an async stream.
//!
//! ## Features
//!
//! - **Full stream negotiation**: plaintext connect, STARTTLS, SASL
//!   (SCRAM-SHA-256, PLAIN, pluggable), legacy auth fallback, resource
//!   binding, session establishment, zlib stream compression
//! - **Strict pipeline ownership**: one reader task, one writer task,
//!   one keep-alive task, one dispatcher thread per connection
//! - **Blocking collectors**: filtered, bounded buffers that turn the
//!   async stream into synchronous request/response calls
//! - **Automatic reconnection**: backoff-driven, with per-second
//!   countdown notifications and conflict suppression
//!
//! ## Example
//!
//! ```rust,ignore
//! use stanzastream::{KindFilter, Stanza, StanzaKind, XmppConnection};
//!
//! #[tokio::main]
//! async fn main() -> stanzastream::Result<()> {
//!     let config = stanzastream::builder()
//!         .address("127.0.0.1", 5222, "example.test")
//!         .build();
//!     let connection = XmppConnection::new(config);
//!     connection.connect().await?;
//!     connection.login("alice", "hunter2", "cli").await?;
//!
//!     // Synchronous request/response over the async stream:
//!     let replies = connection.collector(KindFilter::new(StanzaKind::Message));
//!     connection.send(Stanza::build(
//!         StanzaKind::Message,
//!         None,
//!         Some("bob@example.test"),
//!         Some("chat"),
//!         "<body>ping</body>",
//!     ))?;
//!     if let Some(reply) = replies.next_timeout(std::time::Duration::from_secs(5))? {
//!         println!("got {}", reply.as_xml());
//!     }
//!     replies.cancel();
//!
//!     connection.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod traits;

pub mod core;

pub mod manager;

// Re-export all traits
pub use traits::*;

// Re-export the core modules so engine internals read as crate::<module>
pub use self::core::{
    builder, collector, compression, config, connection, connection_state, dispatcher, features,
    framing, heartbeat, reader, requests, sasl, tls, writer,
};

// Re-export core engine types
pub use self::core::{
    ConnectionConfig, ConnectionConfigBuilder, ConnectionState, SecurityMode, StanzaCollector,
    StreamFeatures, XmppConnection,
};

// Re-export manager
pub use manager::ReconnectionManager;

// Note: `builder()` is re-exported from `self::core` above (the core module
// exposes both the `builder` module and a `builder()` fn), so
// `stanzastream::builder()` and `stanzastream::builder::states` both resolve.
