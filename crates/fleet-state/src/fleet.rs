//! In-memory fleet aggregate and load balancer target group.
//!
//! Neither type does any locking itself; the controller and registrar
//! each keep theirs behind a single mutex and hand out snapshots.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{FleetMember, HealthState, MemberId, Target};

/// Desired capacity, size bounds, and the members currently tracked.
#[derive(Debug, Clone)]
pub struct FleetState {
    desired_capacity: u32,
    min_size: u32,
    max_size: u32,
    members: BTreeMap<MemberId, FleetMember>,
}

impl FleetState {
    /// Create an empty fleet. `desired` is clamped into `[min, max]`.
    pub fn new(min_size: u32, max_size: u32, desired: u32) -> Self {
        let mut state = Self {
            desired_capacity: 0,
            min_size,
            max_size,
            members: BTreeMap::new(),
        };
        state.desired_capacity = state.clamp(desired as i64);
        state
    }

    pub fn desired_capacity(&self) -> u32 {
        self.desired_capacity
    }

    pub fn min_size(&self) -> u32 {
        self.min_size
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Clamp a raw capacity into `[min_size, max_size]`.
    pub fn clamp(&self, capacity: i64) -> u32 {
        capacity.clamp(self.min_size as i64, self.max_size as i64) as u32
    }

    /// Apply a signed delta to the desired capacity, clamped to bounds.
    /// Returns `(previous, new)`.
    pub fn adjust_desired(&mut self, delta: i64) -> (u32, u32) {
        let previous = self.desired_capacity;
        let raw = previous as i64 + delta;
        let clamped = self.clamp(raw);
        if clamped as i64 != raw {
            debug!(
                requested = raw,
                clamped,
                min = self.min_size,
                max = self.max_size,
                "desired capacity clamped to bounds"
            );
        }
        self.desired_capacity = clamped;
        (previous, clamped)
    }

    pub fn get(&self, id: &str) -> Option<&FleetMember> {
        self.members.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut FleetMember> {
        self.members.get_mut(id)
    }

    pub fn insert(&mut self, member: FleetMember) {
        self.members.insert(member.id.clone(), member);
    }

    pub fn remove(&mut self, id: &str) -> Option<FleetMember> {
        self.members.remove(id)
    }

    /// All tracked members, including ones being terminated.
    pub fn members(&self) -> impl Iterator<Item = &FleetMember> {
        self.members.values()
    }

    /// Number of tracked members, including ones being terminated.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members that count toward capacity.
    pub fn in_service_count(&self) -> u32 {
        self.members.values().filter(|m| m.in_service()).count() as u32
    }

    /// Ids of members that may be routed to.
    pub fn membership(&self) -> BTreeSet<MemberId> {
        self.members
            .values()
            .filter(|m| m.in_service())
            .map(|m| m.id.clone())
            .collect()
    }

    /// Consistent copy for readers outside the lock.
    pub fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            desired_capacity: self.desired_capacity,
            min_size: self.min_size,
            max_size: self.max_size,
            members: self.members.values().cloned().collect(),
        }
    }
}

/// Point-in-time copy of a `FleetState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub desired_capacity: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub members: Vec<FleetMember>,
}

impl FleetSnapshot {
    pub fn in_service(&self) -> impl Iterator<Item = &FleetMember> {
        self.members.iter().filter(|m| m.in_service())
    }

    pub fn health_counts(&self) -> HealthCounts {
        let mut counts = HealthCounts::default();
        for m in self.in_service() {
            match m.health_state {
                HealthState::Unknown => counts.unknown += 1,
                HealthState::Healthy => counts.healthy += 1,
                HealthState::Unhealthy => counts.unhealthy += 1,
            }
        }
        counts
    }
}

/// In-service members broken down by health.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCounts {
    pub unknown: u32,
    pub healthy: u32,
    pub unhealthy: u32,
}

/// The set of targets the load balancer currently routes to, as last
/// confirmed by the load-balancing collaborator.
#[derive(Debug, Default, Clone)]
pub struct TargetGroup {
    registered: BTreeMap<MemberId, Target>,
}

impl TargetGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registered.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Target> {
        self.registered.get(id)
    }

    pub fn insert(&mut self, target: Target) {
        self.registered.insert(target.member_id.clone(), target);
    }

    pub fn remove(&mut self, id: &str) -> Option<Target> {
        self.registered.remove(id)
    }

    pub fn ids(&self) -> BTreeSet<MemberId> {
        self.registered.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, health: HealthState) -> FleetMember {
        FleetMember {
            id: id.to_string(),
            address: format!("{id}:8080"),
            launch_time: 1000,
            health_state: health,
            registered: false,
            terminating: false,
        }
    }

    #[test]
    fn new_clamps_desired_into_bounds() {
        assert_eq!(FleetState::new(2, 4, 10).desired_capacity(), 4);
        assert_eq!(FleetState::new(2, 4, 0).desired_capacity(), 2);
        assert_eq!(FleetState::new(2, 4, 3).desired_capacity(), 3);
    }

    #[test]
    fn adjust_desired_clamps_at_max() {
        let mut fleet = FleetState::new(2, 4, 4);
        assert_eq!(fleet.adjust_desired(1), (4, 4));
    }

    #[test]
    fn adjust_desired_clamps_at_min() {
        let mut fleet = FleetState::new(2, 4, 2);
        assert_eq!(fleet.adjust_desired(-1), (2, 2));
        assert_eq!(fleet.adjust_desired(-100), (2, 2));
    }

    #[test]
    fn adjust_desired_within_bounds() {
        let mut fleet = FleetState::new(1, 10, 3);
        assert_eq!(fleet.adjust_desired(2), (3, 5));
        assert_eq!(fleet.adjust_desired(-4), (5, 1));
    }

    #[test]
    fn terminating_members_leave_membership() {
        let mut fleet = FleetState::new(0, 5, 2);
        fleet.insert(member("a", HealthState::Healthy));
        let mut b = member("b", HealthState::Healthy);
        b.terminating = true;
        fleet.insert(b);

        assert_eq!(fleet.len(), 2);
        assert_eq!(fleet.in_service_count(), 1);
        let membership = fleet.membership();
        assert!(membership.contains("a"));
        assert!(!membership.contains("b"));
    }

    #[test]
    fn snapshot_counts_health_of_in_service_members() {
        let mut fleet = FleetState::new(0, 5, 3);
        fleet.insert(member("a", HealthState::Healthy));
        fleet.insert(member("b", HealthState::Unhealthy));
        fleet.insert(member("c", HealthState::Unknown));

        let counts = fleet.snapshot().health_counts();
        assert_eq!(counts.healthy, 1);
        assert_eq!(counts.unhealthy, 1);
        assert_eq!(counts.unknown, 1);
    }

    #[test]
    fn target_group_tracks_ids() {
        let mut group = TargetGroup::new();
        group.insert(member("a", HealthState::Healthy).target());
        assert!(group.contains("a"));
        assert_eq!(group.len(), 1);

        assert!(group.remove("a").is_some());
        assert!(group.is_empty());
    }
}
