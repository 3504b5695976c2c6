//! fleet-state: shared domain model for the fleet control loop.
//!
//! Holds the types every other crate speaks in (`FleetMember`,
//! `MetricSample`, `CapacityDelta`, ...), the in-memory `FleetState`
//! aggregate and `TargetGroup`, and a [redb](https://docs.rs/redb) backed
//! `StateStore` that persists tracked members and scaling activities.
//!
//! # Architecture
//!
//! ```text
//! FleetState (owned by the controller, behind one mutex)
//!   ├── desired_capacity, min_size, max_size
//!   └── members: id → FleetMember
//!
//! TargetGroup (owned by the registrar, behind one mutex)
//!   └── registered: id → Target
//!
//! StateStore (redb)
//!   ├── members   : every instance the controller is responsible for
//!   └── activities: bounded history of scale operations
//! ```
//!
//! Persisting members lets a restarted controller re-adopt instances it
//! launched before, so nothing it created is ever left untracked.

pub mod duration;
pub mod error;
pub mod fleet;
pub mod store;
pub mod tables;
pub mod types;

pub use duration::parse_duration;
pub use error::{StateError, StateResult};
pub use fleet::{FleetSnapshot, FleetState, HealthCounts, TargetGroup};
pub use store::StateStore;
pub use types::*;

/// Boxed, sendable future used by the collaborator traits across the
/// workspace so they can be held as `Arc<dyn Trait>`.
pub type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
