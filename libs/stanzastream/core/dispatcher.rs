//! Listener dispatcher thread.
//!
//! User stanza callbacks never run on the I/O path: the reader task
//! forwards each delivered stanza over a channel, and this dedicated OS
//! thread walks the listener registry and invokes callbacks. A faulty
//! listener is logged and skipped; it cannot take the pipeline down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::filter::StanzaFilter;
use crate::listener::StanzaListener;
use crate::stanza::Stanza;

/// A registered listener with its filter
pub(crate) struct ListenerEntry {
    pub filter: Box<dyn StanzaFilter>,
    pub listener: Arc<dyn StanzaListener>,
}

/// Registry supporting snapshot iteration while other threads mutate it
pub(crate) type ListenerRegistry = Arc<RwLock<Vec<Arc<ListenerEntry>>>>;

/// Deliver one stanza to every matching listener in the registry.
/// Callback errors are logged; dispatch continues.
pub(crate) fn deliver(registry: &ListenerRegistry, stanza: &Stanza) {
    let snapshot: Vec<Arc<ListenerEntry>> = registry.read().iter().cloned().collect();
    for entry in snapshot {
        if entry.filter.accept(stanza) {
            if let Err(e) = entry.listener.on_stanza(stanza) {
                error!(error = %e, "stanza listener failed");
            }
        }
    }
}

/// Spawn the dispatcher thread. It exits when the channel closes or the
/// shutdown flag is set.
pub(crate) fn spawn_dispatcher(
    rx: Receiver<Stanza>,
    listeners: ListenerRegistry,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("stanzastream-dispatcher".into())
        .spawn(move || {
            debug!("dispatcher thread started");
            loop {
                match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(stanza) => deliver(&listeners, &stanza),
                    Err(RecvTimeoutError::Timeout) => {
                        if shutdown.load(Ordering::Acquire) {
                            debug!("shutdown flag detected, dispatcher thread exiting");
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        debug!("dispatch channel closed, dispatcher thread exiting");
                        break;
                    }
                }
            }
        })
        .expect("dispatcher thread spawn")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamEngineError;
    use crate::filter::AcceptAll;
    use std::sync::atomic::AtomicUsize;

    fn presence() -> Stanza {
        Stanza::parse("<presence/>").unwrap()
    }

    #[test]
    fn faulty_listener_does_not_stop_dispatch() {
        let registry: ListenerRegistry = Arc::new(RwLock::new(Vec::new()));
        let delivered = Arc::new(AtomicUsize::new(0));

        registry.write().push(Arc::new(ListenerEntry {
            filter: Box::new(AcceptAll),
            listener: Arc::new(|_: &Stanza| -> crate::error::Result<()> {
                Err(StreamEngineError::ProtocolFailure("listener bug".into()))
            }),
        }));
        let counter = Arc::clone(&delivered);
        registry.write().push(Arc::new(ListenerEntry {
            filter: Box::new(AcceptAll),
            listener: Arc::new(move |_: &Stanza| -> crate::error::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        }));

        deliver(&registry, &presence());
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatcher_thread_drains_channel_and_honors_shutdown() {
        let registry: ListenerRegistry = Arc::new(RwLock::new(Vec::new()));
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        registry.write().push(Arc::new(ListenerEntry {
            filter: Box::new(AcceptAll),
            listener: Arc::new(move |_: &Stanza| -> crate::error::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        }));

        let (tx, rx) = crossbeam_channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_dispatcher(rx, registry, Arc::clone(&shutdown));

        tx.send(presence()).unwrap();
        tx.send(presence()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(delivered.load(Ordering::SeqCst), 2);

        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }
}
