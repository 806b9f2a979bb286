//! Automatic reconnection.
//!
//! One manager per connection, attached at construction when the
//! configuration allows reconnection. An abrupt `ClosedOnError` starts a
//! single background loop (never two) that waits out the backoff policy,
//! announcing a once-per-second countdown, then replays `connect()` -
//! which itself replays the prior login. A planned close disables the
//! manager until the connection comes up again.
//!
//! The one error that never triggers reconnection is a "conflict" stream
//! error: another session took this resource, and reconnecting would
//! just fight over it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::connection::ConnectionCore;
use crate::error::StreamEngineError;
use crate::listener::{ConnectionEvent, ConnectionListener};
use crate::reconnect::ReconnectPolicy;

pub struct ReconnectionManager {
    core: Weak<ConnectionCore>,
    policy: Arc<dyn ReconnectPolicy>,
    /// A reconnection loop is alive
    running: AtomicBool,
    /// Cleared by a planned close, set again when the connection is up
    enabled: AtomicBool,
}

impl ReconnectionManager {
    /// Create the manager and register it as a connection listener. The
    /// manager holds the connection weakly: it dies with the connection,
    /// never the other way around.
    pub(crate) fn attach(core: &Arc<ConnectionCore>) -> Arc<ReconnectionManager> {
        let manager = Arc::new(ReconnectionManager {
            core: Arc::downgrade(core),
            policy: Arc::clone(&core.config.reconnect_policy),
            running: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
        });
        core.add_connection_listener(Arc::new(ManagerListener {
            manager: Arc::clone(&manager),
        }));
        manager
    }

    fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("reconnection loop already running");
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run().await;
            manager.running.store(false, Ordering::Release);
        });
    }

    /// The backoff loop: wait, notify the countdown, attempt, repeat
    /// until connected, disabled, or the policy gives up.
    async fn run(&self) {
        let mut attempt: u32 = 0;

        loop {
            let Some(core) = self.core.upgrade() else {
                return;
            };
            if core.is_connected() || !self.enabled.load(Ordering::Acquire) {
                return;
            }
            drop(core);

            attempt += 1;
            let Some(delay) = self.policy.next_delay(attempt) else {
                info!(attempt, "reconnection policy gave up");
                return;
            };
            debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");

            // Countdown, one notification per second
            let mut remaining = delay;
            while remaining >= Duration::from_secs(1) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                remaining -= Duration::from_secs(1);

                let Some(core) = self.core.upgrade() else {
                    return;
                };
                if core.is_connected() || !self.enabled.load(Ordering::Acquire) {
                    return;
                }
                core.notify_event(&ConnectionEvent::ReconnectingIn(remaining.as_secs()));
            }
            if !remaining.is_zero() {
                tokio::time::sleep(remaining).await;
            }

            let Some(core) = self.core.upgrade() else {
                return;
            };
            if core.is_connected() || !self.enabled.load(Ordering::Acquire) {
                return;
            }
            core.notify_event(&ConnectionEvent::ReconnectingIn(0));

            // connect() replays the previous login on its own
            match core.connect().await {
                Ok(()) => {
                    info!(attempt, "reconnection successful");
                    core.notify_event(&ConnectionEvent::ReconnectionSucceeded);
                    return;
                }
                Err(StreamEngineError::StateConflict(_)) => {
                    // Someone else reconnected concurrently
                    debug!("connection already re-established elsewhere");
                    return;
                }
                Err(error) => {
                    warn!(attempt, error = %error, "reconnection attempt failed");
                    core.notify_event(&ConnectionEvent::ReconnectionFailed(error));
                }
            }
        }
    }
}

/// Listener half: translates connection events into manager actions
struct ManagerListener {
    manager: Arc<ReconnectionManager>,
}

impl ConnectionListener for ManagerListener {
    fn on_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::ClosedOnError(error) => {
                if error.is_conflict() {
                    // Duplicate-resource kick: reconnecting would bounce
                    // the other session right back.
                    info!("conflict stream error, automatic reconnection suppressed");
                    return;
                }
                if self.manager.enabled.load(Ordering::Acquire) {
                    self.manager.start();
                }
            }
            ConnectionEvent::Closed => {
                self.manager.enabled.store(false, Ordering::Release);
            }
            ConnectionEvent::Connected => {
                self.manager.enabled.store(true, Ordering::Release);
            }
            _ => {}
        }
    }
}
