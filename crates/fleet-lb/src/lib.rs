//! fleet-lb: keeps the load balancer's target set in line with the fleet.
//!
//! # Architecture
//!
//! ```text
//! LoadBalancerRegistrar
//!   ├── TargetGroup (last confirmed registrations, one mutex)
//!   ├── reconcile(target, health, membership)  ← health transitions
//!   ├── deregister(member)                     ← termination, before destroy
//!   └── reconcile_all(members)                 ← periodic full sync
//!         │ only when desired != last confirmed
//!         ▼
//!   dyn LoadBalancer (register / deregister)
//!
//! RoutingTable: in-process LoadBalancer holding the registered targets
//! ```
//!
//! A target is registered iff it is an in-service member and Healthy.
//! The registrar never calls the collaborator when the desired state
//! already matches what it last confirmed, and a "target already in that
//! state" conflict counts as success.

pub mod balancer;
pub mod registrar;
pub mod routing;

pub use balancer::{LbError, LbResult, LoadBalancer};
pub use registrar::{LoadBalancerRegistrar, ReconcileStats, Registration};
pub use routing::RoutingTable;
