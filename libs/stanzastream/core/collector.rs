//! Filtered, bounded, blocking stanza buffer.
//!
//! Collectors are the synchronous half of the engine: the reader task
//! pushes matching stanzas in, any thread can block on `next` /
//! `next_timeout` to pull them out. This is what turns the async stream
//! into request/response calls.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{Result, StreamEngineError};
use crate::filter::StanzaFilter;
use crate::stanza::Stanza;

/// Registry of live collectors, shared with the reader task
pub(crate) type CollectorRegistry = Arc<RwLock<Vec<Arc<StanzaCollector>>>>;

struct Queue {
    /// Most-recent-first: `push_front` on arrival, overflow drops the back
    stanzas: VecDeque<Stanza>,
    cancelled: bool,
}

/// Filtered, bounded, blocking buffer of received stanzas.
///
/// The queue is a sliding window of the most recently accepted matches,
/// NOT a strict FIFO: when full, the oldest buffered stanza is dropped
/// to make room. Consumers that need ordered multi-result consumption
/// must size the collector for their expected result count.
///
/// Every consumer must call [`cancel`](Self::cancel) when done; a live
/// collector keeps receiving (and buffering) matches until then.
pub struct StanzaCollector {
    filter: Box<dyn StanzaFilter>,
    capacity: usize,
    queue: Mutex<Queue>,
    available: Condvar,
    /// Registry to deregister from on cancel
    owner: Weak<RwLock<Vec<Arc<StanzaCollector>>>>,
}

impl StanzaCollector {
    pub(crate) fn register(
        registry: &CollectorRegistry,
        filter: Box<dyn StanzaFilter>,
        capacity: usize,
    ) -> Arc<StanzaCollector> {
        let collector = Arc::new(StanzaCollector {
            filter,
            capacity: capacity.max(1),
            queue: Mutex::new(Queue {
                stanzas: VecDeque::new(),
                cancelled: false,
            }),
            available: Condvar::new(),
            owner: Arc::downgrade(registry),
        });
        registry.write().push(Arc::clone(&collector));
        collector
    }

    /// Standalone collector, not tied to any reader registry
    pub(crate) fn detached(filter: Box<dyn StanzaFilter>, capacity: usize) -> Arc<StanzaCollector> {
        Arc::new(StanzaCollector {
            filter,
            capacity: capacity.max(1),
            queue: Mutex::new(Queue {
                stanzas: VecDeque::new(),
                cancelled: false,
            }),
            available: Condvar::new(),
            owner: Weak::new(),
        })
    }

    /// Offer a stanza; called by the reader task for every received
    /// stanza. Returns true when the filter accepted it.
    pub(crate) fn process(&self, stanza: &Stanza) -> bool {
        if !self.filter.accept(stanza) {
            return false;
        }
        let mut queue = self.queue.lock();
        if queue.cancelled {
            return false;
        }
        queue.stanzas.push_front(stanza.clone());
        if queue.stanzas.len() > self.capacity {
            queue.stanzas.pop_back();
        }
        drop(queue);
        self.available.notify_all();
        true
    }

    /// Most recent match, immediately; `None` when the buffer is empty
    pub fn poll(&self) -> Option<Stanza> {
        self.queue.lock().stanzas.pop_front()
    }

    /// Block until a match arrives. Errors when the collector was (or
    /// becomes) cancelled.
    pub fn next(&self) -> Result<Stanza> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(stanza) = queue.stanzas.pop_front() {
                return Ok(stanza);
            }
            if queue.cancelled {
                return Err(StreamEngineError::StateConflict(
                    "collector cancelled".into(),
                ));
            }
            self.available.wait(&mut queue);
        }
    }

    /// Block until a match arrives or the timeout elapses. The remaining
    /// wait is recomputed on every wakeup, so spurious wakeups never
    /// shorten the bound. `Ok(None)` after the full timeout.
    pub fn next_timeout(&self, timeout: std::time::Duration) -> Result<Option<Stanza>> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        loop {
            if let Some(stanza) = queue.stanzas.pop_front() {
                return Ok(Some(stanza));
            }
            if queue.cancelled {
                return Err(StreamEngineError::StateConflict(
                    "collector cancelled".into(),
                ));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let _ = self.available.wait_until(&mut queue, deadline);
        }
    }

    /// Cancel the collector: no further stanzas are queued and it is
    /// removed from the reader's registry. Idempotent; blocked waiters
    /// are woken and observe the cancellation.
    pub fn cancel(&self) {
        {
            let mut queue = self.queue.lock();
            if queue.cancelled {
                return;
            }
            queue.cancelled = true;
        }
        self.available.notify_all();

        if let Some(registry) = self.owner.upgrade() {
            registry
                .write()
                .retain(|c| !std::ptr::eq(Arc::as_ptr(c), self as *const _));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.queue.lock().cancelled
    }

    /// Number of buffered matches
    pub fn len(&self) -> usize {
        self.queue.lock().stanzas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AcceptAll, IdFilter};
    use std::time::Duration;

    fn message(id: &str) -> Stanza {
        Stanza::parse(&format!("<message id='{id}'><body>x</body></message>")).unwrap()
    }

    #[test]
    fn keeps_most_recent_when_full() {
        // Sliding window semantics: capacity C keeps the C most recently
        // accepted matches, most recent first. This is intentionally not
        // a strict FIFO.
        let collector = StanzaCollector::detached(Box::new(AcceptAll), 3);
        for i in 0..5 {
            collector.process(&message(&format!("m{i}")));
        }
        assert_eq!(collector.len(), 3);
        assert_eq!(collector.poll().unwrap().id.as_deref(), Some("m4"));
        assert_eq!(collector.poll().unwrap().id.as_deref(), Some("m3"));
        assert_eq!(collector.poll().unwrap().id.as_deref(), Some("m2"));
        assert!(collector.poll().is_none());
    }

    #[test]
    fn filter_gates_the_queue() {
        let collector = StanzaCollector::detached(Box::new(IdFilter::new("want")), 8);
        assert!(!collector.process(&message("other")));
        assert!(collector.process(&message("want")));
        assert_eq!(collector.len(), 1);
    }

    #[test]
    fn next_timeout_returns_none_only_after_deadline() {
        let collector = StanzaCollector::detached(Box::new(AcceptAll), 8);
        let started = Instant::now();
        let result = collector.next_timeout(Duration::from_millis(80)).unwrap();
        assert!(result.is_none());
        // Never early
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn next_returns_match_delivered_from_another_thread() {
        let collector = StanzaCollector::detached(Box::new(AcceptAll), 8);
        let producer = Arc::clone(&collector);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.process(&message("late"));
        });
        let stanza = collector.next_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(stanza.unwrap().id.as_deref(), Some("late"));
        handle.join().unwrap();
    }

    #[test]
    fn cancel_is_idempotent_and_final() {
        let collector = StanzaCollector::detached(Box::new(AcceptAll), 8);
        collector.cancel();
        collector.cancel();
        assert!(collector.is_cancelled());
        // No stanzas are queued after cancellation
        assert!(!collector.process(&message("m")));
        assert!(collector.next().is_err());
    }

    #[test]
    fn cancel_wakes_blocked_waiters() {
        let collector = StanzaCollector::detached(Box::new(AcceptAll), 8);
        let waiter = Arc::clone(&collector);
        let handle = std::thread::spawn(move || waiter.next());
        std::thread::sleep(Duration::from_millis(20));
        collector.cancel();
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn register_and_cancel_maintain_the_registry() {
        let registry: CollectorRegistry = Arc::new(RwLock::new(Vec::new()));
        let collector = StanzaCollector::register(&registry, Box::new(AcceptAll), 8);
        assert_eq!(registry.read().len(), 1);
        collector.cancel();
        assert!(registry.read().is_empty());
    }
}
