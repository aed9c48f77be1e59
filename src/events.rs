//! Explicit callback lists used for change propagation.
//!
//! Each event source owns an [`EventHandlers`] list. Subscribers get a
//! [`HandlerId`] back and must unsubscribe with it; there is no global bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Token identifying one subscription on one event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// A list of callbacks invoked with a shared argument.
pub struct EventHandlers<A> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(HandlerId, Handler<A>)>>,
}

impl<A> EventHandlers<A> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&A) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Returns `false` if the id was not subscribed.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Invoke every handler.
    ///
    /// The list is snapshotted first so handlers may subscribe or
    /// unsubscribe without deadlocking.
    pub fn emit(&self, args: &A) {
        let snapshot: Vec<Handler<A>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in snapshot {
            handler(args);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}

impl<A> Default for EventHandlers<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> std::fmt::Debug for EventHandlers<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("handlers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_and_unsubscribe() {
        let events = EventHandlers::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let sink = total.clone();
        let id = events.subscribe(move |value| {
            sink.fetch_add(*value as usize, Ordering::SeqCst);
        });

        events.emit(&3);
        assert_eq!(total.load(Ordering::SeqCst), 3);

        assert!(events.unsubscribe(id));
        assert!(!events.unsubscribe(id));
        events.emit(&3);
        assert_eq!(total.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_handler_may_unsubscribe_during_emit() {
        let events = Arc::new(EventHandlers::<()>::new());
        let weak = Arc::downgrade(&events);
        let slot = Arc::new(Mutex::new(None));
        let slot_in = slot.clone();
        let id = events.subscribe(move |_| {
            if let (Some(events), Some(id)) = (weak.upgrade(), *slot_in.lock()) {
                events.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        events.emit(&());
        assert!(events.is_empty());
    }
}
