//! Pending request correlation.
//!
//! Internal negotiation steps (resource bind, session, legacy auth) are
//! IQ request/response pairs. Each outgoing request registers its stanza
//! id here; the reader task completes the matching oneshot when the
//! reply arrives. This is the future-based twin of the public collector.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::stanza::Stanza;

#[derive(Default)]
pub(crate) struct PendingIqMap {
    pending: Mutex<HashMap<String, oneshot::Sender<Stanza>>>,
}

impl PendingIqMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the reply to `id`
    pub fn register(&self, id: &str) -> oneshot::Receiver<Stanza> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.to_string(), tx);
        rx
    }

    /// Complete a pending request; true when a waiter existed
    pub fn complete(&self, id: &str, stanza: Stanza) -> bool {
        match self.pending.lock().remove(id) {
            Some(tx) => {
                let _ = tx.send(stanza);
                true
            }
            None => {
                debug!(id, "iq reply without pending request");
                false
            }
        }
    }

    /// Drop a single pending request after its wait expired
    pub fn forget(&self, id: &str) {
        self.pending.lock().remove(id);
    }

    /// Drop every pending request; their waiters observe a closed
    /// channel. Called when the connection goes down.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_registered_request() {
        let map = PendingIqMap::new();
        let rx = map.register("q1");
        let reply = Stanza::parse("<iq type='result' id='q1'/>").unwrap();
        assert!(map.complete("q1", reply));
        assert_eq!(rx.await.unwrap().id.as_deref(), Some("q1"));
    }

    #[tokio::test]
    async fn unknown_id_is_reported() {
        let map = PendingIqMap::new();
        let reply = Stanza::parse("<iq type='result' id='nope'/>").unwrap();
        assert!(!map.complete("nope", reply));
    }

    #[tokio::test]
    async fn clear_fails_outstanding_waiters() {
        let map = PendingIqMap::new();
        let rx = map.register("q2");
        map.clear();
        assert!(rx.await.is_err());
    }
}
