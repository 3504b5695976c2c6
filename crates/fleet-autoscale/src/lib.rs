//! fleet-autoscale: alarm-driven step scaling.
//!
//! Turns the sampled utilization stream into capacity deltas:
//!
//! ```text
//! Observation ──► AlarmEvaluator (high) ─┐
//!            └──► AlarmEvaluator (low)  ─┴─► mpsc AlarmEvent
//!                                              │ arrival order
//!                                              ▼
//!                                  Autoscaler ─► ScalingPolicyEngine
//!                                              │ Some(delta) unless cooling down
//!                                              ▼
//!                                        ScaleCallback (controller)
//! ```
//!
//! # Alarm state machine
//!
//! ```text
//! Idle ──breach──► Accumulating{n} ──breach, n+1 == periods──► Fired
//!  ▲                    │ non-breach                            │ next sample
//!  └────────────────────┴───────────────────────────────────────┘
//! ```
//!
//! A missing sample changes nothing. Fired emits exactly one event and
//! starts the next run from zero.
//!
//! # Cooldown
//!
//! Each policy remembers when it last applied. Events that arrive while
//! `now - last_applied_at < cooldown` (tokio monotonic clock, full
//! `Duration` precision) are dropped, not queued. The check
//! and the update happen under one lock per policy.

pub mod alarm;
pub mod policy;
pub mod scaler;

pub use alarm::{AlarmConfig, AlarmEvaluator, AlarmState, run_alarm};
pub use policy::{ScalingPolicy, ScalingPolicyEngine};
pub use scaler::{Autoscaler, ScaleCallback, ScaleDecision};
