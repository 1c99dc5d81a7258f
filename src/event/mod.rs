//! Event log + emitter: the ordered, persisted, subscribable event stream.

pub mod aggregator;
pub mod emitter;
pub mod record;
pub mod store;

pub use aggregator::{FlowEventAggregator, NodeEventEmitter};
pub use emitter::EventEmitter;
pub use record::{EventKind, EventRecord};
pub use store::{EventStore, InMemoryEventStore};
