//! Event store ("fes": the event-sourced state layer).
//!
//! - **`types`**: `Aggregate` identities and `Event`s.
//! - **`subject`**: aggregate to subject mapping and back.
//! - **`store`**: the `EventStore` (append, get, list, watch).
//! - **`pubsub`**: in-process fan-out of watched events.
//! - **`cache`**: projections folded from event logs and the invalidation-driven cache holding them.

pub mod cache;
pub mod pubsub;
pub mod store;
pub mod subject;
pub mod types;

pub use cache::{CacheWriter, EventLog, Projection, ProjectionCache};
pub use pubsub::{Publisher, SubscriptionOptions, Topic};
pub use store::EventStore;
pub use subject::{make_subject, parse_subject, type_matcher, type_wildcard};
pub use types::{validate_type, Aggregate, Event};
