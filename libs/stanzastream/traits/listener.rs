use crate::error::{Result, StreamEngineError};
use crate::stanza::Stanza;

/// Callback for received (or, as a send listener, queued) stanzas.
///
/// Stanza listeners run on the dispatcher thread, never on the I/O path.
/// An `Err` return is logged and dispatch continues; a listener cannot
/// take the pipeline down.
pub trait StanzaListener: Send + Sync {
    fn on_stanza(&self, stanza: &Stanza) -> Result<()>;
}

impl<F> StanzaListener for F
where
    F: Fn(&Stanza) -> Result<()> + Send + Sync,
{
    fn on_stanza(&self, stanza: &Stanza) -> Result<()> {
        self(stanza)
    }
}

/// Hook invoked on outgoing stanzas before they are queued.
///
/// Interceptors may rewrite the stanza; they run on the caller's thread
/// inside `send`, in registration order.
pub trait StanzaInterceptor: Send + Sync {
    fn intercept(&self, stanza: &mut Stanza);
}

impl<F> StanzaInterceptor for F
where
    F: Fn(&mut Stanza) + Send + Sync,
{
    fn intercept(&self, stanza: &mut Stanza) {
        self(stanza)
    }
}

/// Connection lifecycle events, the asynchronous error channel of the
/// engine.
///
/// The set is closed on purpose: consumers dispatch with an exhaustive
/// `match` instead of multi-method callback interfaces.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Stream negotiation finished; the connection is usable
    Connected,
    /// Login completed; carries the bound full address
    Authenticated { address: String },
    /// Orderly close requested by this side
    Closed,
    /// The connection died without an explicit close
    ClosedOnError(StreamEngineError),
    /// Countdown notification, once per second before a reconnect attempt
    ReconnectingIn(u64),
    /// A reconnect attempt restored the connection (and prior login)
    ReconnectionSucceeded,
    /// A reconnect attempt failed; the manager will retry
    ReconnectionFailed(StreamEngineError),
}

/// Observer of connection lifecycle events.
///
/// Invoked inline from whichever task detected the transition, so
/// implementations must be quick and must not block.
pub trait ConnectionListener: Send + Sync {
    fn on_event(&self, event: &ConnectionEvent);
}

impl<F> ConnectionListener for F
where
    F: Fn(&ConnectionEvent) + Send + Sync,
{
    fn on_event(&self, event: &ConnectionEvent) {
        self(event)
    }
}
