//! The C4 Activity Queue: a priority, retrying, at-least-once delivery queue for outgoing
//! activities, backed by Redis Streams.
//!
//! Three priority streams (`urgent`, `normal`, `bulk`) are each consumed through a single
//! consumer group so in-flight claims survive worker restarts. See [crate::outbox] for the
//! code that decides which priority an activity gets and builds the per-destination envelopes
//! enqueued here.

/// The memory-pressure lifecycle worker: aggressive trim on high-water mark,
/// DLQ-to-cold-storage archival.
pub mod lifecycle;
pub(crate) mod request;
pub mod stream;

pub use stream::{ActivityQueue, DeliveryOutcome, Priority, QueueStats, QueuedMessage};
