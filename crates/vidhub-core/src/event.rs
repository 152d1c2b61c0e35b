/*!
 * Typed event channels for vidhub.
 *
 * Every observable object owns its own [`EventChannel`] of a concrete event
 * type. Consumers subscribe explicitly and unsubscribe by dropping the
 * receiver; there is no global dispatch registry.
 */
use std::fmt::Debug;

use tokio::sync::broadcast;
use tracing::trace;

/// Maximum number of events that can be buffered per subscriber
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Receiving end of an [`EventChannel`]
pub type EventReceiver<T> = broadcast::Receiver<T>;

/// A broadcast channel carrying one event type
#[derive(Debug)]
pub struct EventChannel<T: Clone + Debug + Send + 'static> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Debug + Send + 'static> EventChannel<T> {
    /// Create a new channel with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new channel with a specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event, returning the number of subscribers that received it
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: T) -> usize {
        match self.sender.send(event) {
            Ok(n) => {
                trace!("Published event to {} receivers", n);
                n
            }
            Err(_) => 0,
        }
    }

    /// Publish a batch of events in order
    pub fn publish_all<I: IntoIterator<Item = T>>(&self, events: I) {
        for event in events {
            self.publish(event);
        }
    }

    /// Subscribe to all events published from now on
    pub fn subscribe(&self) -> EventReceiver<T> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone + Debug + Send + 'static> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}
