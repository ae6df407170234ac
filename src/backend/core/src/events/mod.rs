//! Queue lifecycle events.
//!
//! - **`event`**: The [`QueueEvent`] variants emitted around job state transitions.
//! - **`sink`**: The [`EventSink`] trait and the bundled sinks (broadcast bus,
//!   callback listeners, tracing, in-memory log).

pub mod event;
pub mod sink;

pub use event::QueueEvent;
pub use sink::{EventBus, EventLog, EventSink, Listeners, NullSink, TracingSink};
