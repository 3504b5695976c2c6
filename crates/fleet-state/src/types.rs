//! Domain types for the fleet control loop.
//!
//! All persisted types serialize to JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a fleet member (the provider's instance id).
pub type MemberId = String;

// ── Members ───────────────────────────────────────────────────────

/// Health classification produced by health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// A compute instance the controller is responsible for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetMember {
    pub id: MemberId,
    /// Address (ip:port) used for probing and load balancer registration.
    pub address: String,
    /// Unix timestamp (seconds) when the instance was launched.
    pub launch_time: u64,
    pub health_state: HealthState,
    /// Whether the load balancer currently routes to this member.
    pub registered: bool,
    /// Set while the member is being drained and terminated.
    #[serde(default)]
    pub terminating: bool,
}

impl FleetMember {
    /// A freshly launched member: health unknown, not routable.
    pub fn launched(handle: &InstanceHandle, launch_time: u64) -> Self {
        Self {
            id: handle.id.clone(),
            address: handle.address.clone(),
            launch_time,
            health_state: HealthState::Unknown,
            registered: false,
            terminating: false,
        }
    }

    /// Counts toward capacity and may be routed to.
    pub fn in_service(&self) -> bool {
        !self.terminating
    }

    pub fn handle(&self) -> InstanceHandle {
        InstanceHandle {
            id: self.id.clone(),
            address: self.address.clone(),
        }
    }

    pub fn target(&self) -> Target {
        Target {
            member_id: self.id.clone(),
            address: self.address.clone(),
        }
    }

    /// Build the key for the members table.
    pub fn table_key(&self) -> &str {
        &self.id
    }
}

/// What the provisioning collaborator hands back for a launched instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub id: String,
    pub address: String,
}

/// Template used for every launch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchTemplate {
    pub name: String,
    pub image: String,
    pub instance_type: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// A load balancer target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub member_id: MemberId,
    pub address: String,
}

// ── Metrics & alarms ──────────────────────────────────────────────

/// One observation of the fleet's aggregate utilization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Unix timestamp (seconds) of the observation.
    pub timestamp: u64,
    pub value: f64,
}

/// Which way an alarm watches the metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    HighUtilization,
    LowUtilization,
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmKind::HighUtilization => f.write_str("high_utilization"),
            AlarmKind::LowUtilization => f.write_str("low_utilization"),
        }
    }
}

/// Comparison between a sample and an alarm threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl Comparison {
    /// Whether `value` breaches `threshold` under this comparison.
    pub fn breaches(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThan => value > threshold,
            Comparison::GreaterThanOrEqual => value >= threshold,
            Comparison::LessThan => value < threshold,
            Comparison::LessThanOrEqual => value <= threshold,
        }
    }
}

/// Emitted once each time an alarm reaches its evaluation periods.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub kind: AlarmKind,
    /// Value of the sample that completed the breach run.
    pub value: f64,
    /// Unix timestamp (seconds) of that sample.
    pub at: u64,
}

// ── Scaling ───────────────────────────────────────────────────────

/// Capacity change requested by a scaling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CapacityDelta {
    /// Fixed step, e.g. +1 / -1.
    ChangeInCapacity { adjustment: i32 },
    /// Proportional step relative to the current desired capacity. The
    /// resolved step is at least `min_step` in magnitude.
    PercentChangeInCapacity { percent: i32, min_step: u32 },
}

impl CapacityDelta {
    pub fn step(adjustment: i32) -> Self {
        CapacityDelta::ChangeInCapacity { adjustment }
    }

    /// Resolve to a signed instance count against the current capacity.
    pub fn resolve(self, current: u32) -> i64 {
        match self {
            CapacityDelta::ChangeInCapacity { adjustment } => adjustment as i64,
            CapacityDelta::PercentChangeInCapacity { percent, min_step } => {
                if percent == 0 {
                    return 0;
                }
                // Truncates toward zero.
                let raw = current as i64 * percent as i64 / 100;
                let magnitude = raw.abs().max(min_step as i64);
                magnitude * (percent as i64).signum()
            }
        }
    }
}

/// Record of a completed scale operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingActivity {
    /// Monotonic sequence number assigned by the store.
    #[serde(default)]
    pub seq: u64,
    /// Why the operation ran ("alarm high_utilization", "converge", ...).
    pub cause: String,
    pub from_desired: u32,
    pub to_desired: u32,
    pub launched: Vec<MemberId>,
    pub terminated: Vec<MemberId>,
    /// The operation could not reach desired capacity.
    pub degraded: bool,
    pub started_at: u64,
    pub finished_at: u64,
}

impl ScalingActivity {
    /// Build the key for the activities table (zero-padded so keys sort
    /// in sequence order).
    pub fn table_key(&self) -> String {
        format!("{:020}", self.seq)
    }
}
