//! fleet-controller: owns fleet membership and applies capacity changes.
//!
//! # Architecture
//!
//! ```text
//! FleetController
//!   ├── scale_lock (one scale / converge sequence at a time)
//!   ├── FleetState (desired, bounds, members; one mutex)
//!   ├── dyn Provisioner ── launch / terminate, wrapped in RetryPolicy
//!   ├── LoadBalancerRegistrar ── deregister before terminate
//!   ├── HealthMonitor ── start on launch, stop on terminate
//!   └── StateStore ── members + scaling activities
//! ```
//!
//! Scale-out launches one instance at a time; a launch that still fails
//! after its retries stops the sequence and is reported as degraded
//! capacity. Scale-in picks victims with [`select_victims`] and only
//! forgets a member once the provisioner confirms termination.

pub mod controller;
pub mod error;
pub mod provisioner;
pub mod retry;
pub mod selection;

pub use controller::{ControllerSettings, DegradedCapacity, FleetController, ScaleOutcome};
pub use error::{ControllerError, ControllerResult, ProvisionError, ProvisionResult};
pub use provisioner::{LocalProvisioner, Provisioner};
pub use retry::RetryPolicy;
pub use selection::{rank_for_termination, select_victims};
