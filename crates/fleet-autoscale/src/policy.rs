//! Scaling policies: alarm kind → capacity delta, guarded by cooldown.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use fleet_state::{AlarmEvent, AlarmKind, CapacityDelta};

/// Adjustment applied when the bound alarm fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub adjustment: CapacityDelta,
    /// Minimum time between two applied adjustments.
    pub cooldown: Duration,
}

impl ScalingPolicy {
    pub fn step(adjustment: i32, cooldown: Duration) -> Self {
        Self {
            adjustment: CapacityDelta::step(adjustment),
            cooldown,
        }
    }
}

struct PolicySlot {
    policy: ScalingPolicy,
    last_applied_at: Option<Instant>,
}

/// Maps alarm events to capacity deltas.
///
/// Shared by reference; each policy's cooldown check-and-set runs under
/// that policy's own lock, so two events racing for the same policy
/// can never both apply.
pub struct ScalingPolicyEngine {
    slots: HashMap<AlarmKind, Mutex<PolicySlot>>,
}

impl ScalingPolicyEngine {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Bind a policy to an alarm kind, replacing any previous binding.
    pub fn with_policy(mut self, kind: AlarmKind, policy: ScalingPolicy) -> Self {
        self.slots.insert(
            kind,
            Mutex::new(PolicySlot {
                policy,
                last_applied_at: None,
            }),
        );
        self
    }

    pub fn policy(&self, kind: AlarmKind) -> Option<ScalingPolicy> {
        self.slots.get(&kind).map(|slot| {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .policy
        })
    }

    pub fn last_applied_at(&self, kind: AlarmKind) -> Option<Instant> {
        self.slots.get(&kind).and_then(|slot| {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last_applied_at
        })
    }

    /// Apply an event now, on the tokio clock.
    pub fn apply(&self, event: &AlarmEvent) -> Option<CapacityDelta> {
        self.apply_at(event, Instant::now())
    }

    /// Apply an event at `now`. Returns `None` when no policy is bound or
    /// the policy is cooling down; such events are dropped.
    pub fn apply_at(&self, event: &AlarmEvent, now: Instant) -> Option<CapacityDelta> {
        let Some(slot) = self.slots.get(&event.kind) else {
            debug!(alarm = %event.kind, "no policy bound to alarm");
            return None;
        };

        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let cooldown = slot.policy.cooldown;
        if let Some(last) = slot.last_applied_at
            && now.saturating_duration_since(last) < cooldown
        {
            debug!(
                alarm = %event.kind,
                since_last_ms = now.saturating_duration_since(last).as_millis() as u64,
                cooldown_ms = cooldown.as_millis() as u64,
                "policy cooling down, event dropped"
            );
            return None;
        }

        slot.last_applied_at = Some(now);
        info!(
            alarm = %event.kind,
            adjustment = ?slot.policy.adjustment,
            "scaling policy applied"
        );
        Some(slot.policy.adjustment)
    }
}

impl Default for ScalingPolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}
