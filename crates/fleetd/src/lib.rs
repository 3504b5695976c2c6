//! fleetd: the fleet autoscaling daemon.
//!
//! Assembles the control loop from the fleet-* crates:
//! - Metric sampler and two utilization alarms
//! - Step scaling policies with cooldowns
//! - Fleet controller (provisioning, scale-in selection, convergence)
//! - Per-member health monitoring
//! - Load balancer target registration
//! - Read-only status server (`/metrics`, `/fleet`)
//!
//! `run` talks to HTTP collaborators named in `fleet.toml`; `simulate`
//! swaps in the in-process backends from [`sim`].

pub mod config;
pub mod daemon;
pub mod remote;
pub mod server;
pub mod sim;

pub use config::{ConfigError, FleetConfig, Settings};
pub use daemon::{Backends, Daemon};
pub use server::{StatusState, build_router};
