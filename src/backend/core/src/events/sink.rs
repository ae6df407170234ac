//! Notification sinks for queue events.
//!
//! The dispatcher, queue manager and runner never reach for ambient state to
//! publish events; they are handed an [`EventSink`] at construction.
//!
//! - **`EventBus`**: tokio broadcast channel for async subscribers
//! - **`Listeners`**: synchronous callbacks
//! - **`TracingSink`**: renders every event through `tracing`
//! - **`EventLog`**: in-memory record of emitted events

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::QueueEvent;

/// Receiver of queue events.
///
/// Emission is fire-and-forget: a sink must not fail the operation that
/// produced the event, and having no subscriber is not an error.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &QueueEvent);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: &QueueEvent) {
        (**self).emit(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &QueueEvent) {}
}

// =============================================================================
// Broadcast Bus
// =============================================================================

/// Broadcasts events to any number of async subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &QueueEvent) {
        counter!("mantle_queue_events_total", "type" => event.event_type()).increment(1);
        // Send only fails when nobody is subscribed.
        let _ = self.sender.send(event.clone());
    }
}

// =============================================================================
// Callback Listeners
// =============================================================================

type Listener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

/// Invokes registered callbacks in registration order.
///
/// Callbacks run outside the lock, so a callback may register further
/// listeners; those only see later events.
#[derive(Default)]
pub struct Listeners {
    listeners: RwLock<Vec<Listener>>,
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every event.
    pub fn listen<F>(&self, listener: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Register a callback for one event type.
    pub fn listen_for<F>(&self, event_type: &'static str, listener: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.listen(move |event| {
            if event.event_type() == event_type {
                listener(event);
            }
        });
    }

    /// Add another sink as a listener.
    pub fn forward_to(&self, sink: Arc<dyn EventSink>) {
        self.listen(move |event| sink.emit(event));
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for Listeners {
    fn emit(&self, event: &QueueEvent) {
        let snapshot = self.listeners.read().clone();
        for listener in &snapshot {
            listener(event);
        }
    }
}

// =============================================================================
// Tracing and Recording Sinks
// =============================================================================

/// Logs every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &QueueEvent) {
        event.log();
    }
}

/// Keeps every emitted event in memory. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<QueueEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events emitted so far.
    pub fn events(&self) -> Vec<QueueEvent> {
        self.events.lock().clone()
    }

    /// Event types in emission order.
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(QueueEvent::event_type).collect()
    }

    /// Number of emitted events of the given type.
    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: &QueueEvent) {
        self.events.lock().push(event.clone());
    }
}
