//! fleet-metrics: utilization sampling for the fleet control loop.
//!
//! # Architecture
//!
//! ```text
//! MetricSampler
//!   ├── MetricSource::sample() ← bounded by a per-call timeout
//!   ├── broadcast Observation (Sample | Missing) to every alarm
//!   └── latest() → last good sample, for exposition
//!
//! SampleWindow
//!   └── bounded ring of recent samples (size = evaluation periods)
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```
//!
//! A failed or timed-out sample is published as `Observation::Missing`.
//! Alarms treat it as "no data": it neither counts toward nor resets a
//! breach run.

pub mod prometheus;
pub mod sampler;
pub mod source;
pub mod window;

pub use prometheus::{FleetGauges, render_prometheus};
pub use sampler::{MetricSampler, Observation};
pub use source::{MetricSource, ScriptedSource};
pub use window::SampleWindow;
