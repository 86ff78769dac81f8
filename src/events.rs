//! A small named-event-sink abstraction.
//!
//! The source this crate's behavior is modeled on uses event emitters
//! liberally: `attached`, `detached`, `receiverError`, `requestClientError`,
//! and so on, each fanning out to zero or more observers. Rather than
//! reproduce one emitter type per channel, every component that needs to
//! notify observers holds one [`EventSink<T>`] per named channel and
//! subscribers get a [`EventStream<T>`] they can poll independently.
//!
//! Delivery is in-order per channel and lossless to every subscriber that
//! was registered before the event was sent (an `UnboundedSender` per
//! subscriber); a subscriber that's dropped its [`EventStream`] simply stops
//! receiving and is pruned lazily on the next send.

use tokio::sync::mpsc;

/// The sending half of a named event channel. Cloneable and cheap; every
/// subscriber gets its own unbounded queue so a slow subscriber cannot block
/// another or the component emitting the event.
#[derive(Debug)]
pub struct EventSink<T> {
    subscribers: parking_lot::Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Default for EventSink<T> {
    fn default() -> Self {
        EventSink {
            subscribers: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> EventSink<T> {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new observer, returning a stream it can poll for events
    /// emitted from this point onward.
    pub fn subscribe(&self) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventStream { rx }
    }

    /// Delivers `event` to every live subscriber, in subscription order,
    /// dropping any subscriber whose receiver has gone away.
    pub fn emit(&self, event: T) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// The receiving half handed to one observer of an [`EventSink`].
#[derive(Debug)]
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> EventStream<T> {
    /// Waits for the next event on this channel, or `None` if the sink was dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns the next already-buffered event without waiting, if any.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Attach/detach lifecycle events common to senders, receivers, and the
/// management client's links.
#[derive(Debug, Clone)]
pub enum LinkLifecycleEvent {
    /// The link (re)attached. Carries the link name and entity path.
    Attached {
        /// The link's name.
        name: String,
        /// The entity path the link is addressed at.
        path: String,
    },
    /// The link detached. Carries the link name, entity path, and whatever
    /// error information accompanied the detach frame.
    Detached {
        /// The link's name.
        name: String,
        /// The entity path the link is addressed at.
        path: String,
        /// Free-text detail extracted from the peer's detach error, if any.
        info: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let sink: EventSink<u32> = EventSink::new();
        let mut stream = sink.subscribe();
        sink.emit(1);
        sink.emit(2);
        sink.emit(3);
        assert_eq!(stream.recv().await, Some(1));
        assert_eq!(stream.recv().await, Some(2));
        assert_eq!(stream.recv().await, Some(3));
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_next_emit() {
        let sink: EventSink<u32> = EventSink::new();
        {
            let _stream = sink.subscribe();
            assert_eq!(sink.subscribers.lock().len(), 1);
        }
        sink.emit(1);
        assert_eq!(sink.subscribers.lock().len(), 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_every_event() {
        let sink: EventSink<u32> = EventSink::new();
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();
        sink.emit(42);
        assert_eq!(a.recv().await, Some(42));
        assert_eq!(b.recv().await, Some(42));
    }
}
