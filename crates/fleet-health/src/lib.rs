//! fleet-health: health checking for fleet members.
//!
//! Provides HTTP health probes, per-member consecutive-result tracking,
//! and a monitor that runs one background task per member.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── Per-member background task (shared interval, own timer)
//!   │   ├── HealthProbe::probe() bounded by the probe timeout
//!   │   ├── HealthTracker (consecutive successes / failures)
//!   │   └── HealthEvent on every state transition
//!   └── mpsc sender → controller (registration, replacement)
//! ```
//!
//! # State machine
//!
//! ```text
//! Unknown ──k successes──► Healthy ──k failures──► Unhealthy
//!    │                        ▲                        │
//!    └──────k failures────────┼────────────────────────┤
//!                             └──────k successes───────┘
//! ```
//!
//! A timed-out probe is one failure. A slow probe only delays its own
//! member; every member has its own task and timeout.

pub mod checker;
pub mod monitor;

pub use checker::{HealthProbe, HealthSettings, HealthTracker, HttpProbe, ProbeResult, http_probe};
pub use monitor::{HealthEvent, HealthMonitor, probe_with_timeout};
