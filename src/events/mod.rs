//! Event bus for session negotiation
//!
//! Decouples the local media stack from the signaling channel: the media
//! stack publishes "authorize this" events carrying a [`Completion`], and a
//! handler wired by the session controller performs the network round-trip
//! and settles it.
//!
//! Delivery is synchronous and in registration order. The set of handlers is
//! snapshotted when [`EventBus::emit`] starts, so handlers registered from
//! inside a handler only see later emits.

pub mod types;

pub use types::{Completion, EventName, Pending, SessionEvent};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Handler registration id, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Registration {
    id: HandlerId,
    name: EventName,
    handler: Handler,
    /// Set for `once` registrations; flipped by the first delivery
    fired: Option<Arc<AtomicBool>>,
}

/// Typed publish/subscribe bus
///
/// # Example
///
/// ```no_run
/// use mediaroom::events::{EventBus, EventName, SessionEvent};
///
/// let bus = EventBus::new();
/// bus.on(EventName::ProducerClosed, |event| {
///     if let SessionEvent::ProducerClosed { producer_id } = event {
///         println!("producer {} closed", producer_id);
///     }
/// });
/// bus.emit(SessionEvent::ProducerClosed { producer_id: "p1".to_string() });
/// ```
pub struct EventBus {
    handlers: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler invoked for every event with this name
    pub fn on<F>(&self, name: EventName, handler: F) -> HandlerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.register(name, Arc::new(handler), None)
    }

    /// Register a handler invoked for at most one event with this name
    pub fn once<F>(&self, name: EventName, handler: F) -> HandlerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.register(name, Arc::new(handler), Some(Arc::new(AtomicBool::new(false))))
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|r| r.id != id);
        handlers.len() != before
    }

    /// Deliver an event to the handlers currently registered for its name
    ///
    /// Returns the number of handlers invoked.
    pub fn emit(&self, event: SessionEvent) -> usize {
        let name = event.name();
        let snapshot: Vec<(HandlerId, Handler, Option<Arc<AtomicBool>>)> = {
            let handlers = self.handlers.lock();
            handlers
                .iter()
                .filter(|r| r.name == name)
                .map(|r| (r.id, r.handler.clone(), r.fired.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, handler, fired) in snapshot {
            if let Some(fired) = fired {
                // Concurrent emits race here; only one wins the flag
                if fired.swap(true, Ordering::AcqRel) {
                    continue;
                }
                self.off(id);
            }
            handler(&event);
            delivered += 1;
        }
        delivered
    }

    /// Number of handlers registered for a name
    pub fn handler_count(&self, name: EventName) -> usize {
        self.handlers.lock().iter().filter(|r| r.name == name).count()
    }

    fn register(&self, name: EventName, handler: Handler, fired: Option<Arc<AtomicBool>>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push(Registration {
            id,
            name,
            handler,
            fired,
        });
        id
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn closed(id: &str) -> SessionEvent {
        SessionEvent::ProducerClosed {
            producer_id: id.to_string(),
        }
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            bus.on(EventName::ProducerClosed, move |_| order.lock().push(i));
        }

        assert_eq!(bus.emit(closed("p")), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_filters_by_name() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.on(EventName::ChannelOpen, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.emit(closed("p")), 0);
        assert_eq!(bus.emit(SessionEvent::ChannelOpen), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_added_during_emit_not_invoked() {
        let bus = Arc::new(EventBus::new());
        let late_hits = Arc::new(AtomicUsize::new(0));

        let bus_inner = bus.clone();
        let late = late_hits.clone();
        bus.on(EventName::ProducerClosed, move |_| {
            let late = late.clone();
            bus_inner.on(EventName::ProducerClosed, move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            });
        });

        bus.emit(closed("p"));
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);

        bus.emit(closed("p"));
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_once_fires_once() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.once(EventName::ChannelDisconnected, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(SessionEvent::ChannelDisconnected);
        bus.emit(SessionEvent::ChannelDisconnected);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(EventName::ChannelDisconnected), 0);
    }

    #[test]
    fn test_once_under_concurrent_emits() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.once(EventName::ChannelLost, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    bus.emit(SessionEvent::ChannelLost);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_removes_handler() {
        let bus = EventBus::new();
        let id = bus.on(EventName::ChannelOpen, |_| {});
        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.emit(SessionEvent::ChannelOpen), 0);
    }
}
