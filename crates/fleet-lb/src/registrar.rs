//! Target registration against the load balancer.
//!
//! The registrar remembers the last registration state the collaborator
//! confirmed for each member and only issues a call when the desired
//! state differs from it. A failed call leaves the remembered state as it
//! was, so the next reconciliation retries.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fleet_state::{FleetMember, HealthState, MemberId, Target, TargetGroup};

use crate::balancer::{LbError, LbResult, LoadBalancer};

/// What a reconciliation did for one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    Deregistered,
    /// Desired state already matched; no call was made.
    Unchanged,
}

/// Summary of a full reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub registered: usize,
    pub deregistered: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl ReconcileStats {
    pub fn count(&mut self, outcome: &LbResult<Registration>) {
        match outcome {
            Ok(Registration::Registered) => self.registered += 1,
            Ok(Registration::Deregistered) => self.deregistered += 1,
            Ok(Registration::Unchanged) => self.unchanged += 1,
            Err(_) => self.failed += 1,
        }
    }

    /// Number of collaborator calls that changed something.
    pub fn changes(&self) -> usize {
        self.registered + self.deregistered
    }
}

pub struct LoadBalancerRegistrar {
    lb: Arc<dyn LoadBalancer>,
    group: Mutex<TargetGroup>,
}

impl LoadBalancerRegistrar {
    pub fn new(lb: Arc<dyn LoadBalancer>) -> Self {
        Self {
            lb,
            group: Mutex::new(TargetGroup::new()),
        }
    }

    /// Record a target as already registered without calling the
    /// collaborator. Used when re-adopting persisted members.
    pub async fn adopt(&self, target: Target) {
        debug!(member = %target.member_id, "adopting registered target");
        self.group.lock().await.insert(target);
    }

    /// Bring one target's registration in line with its health and the
    /// current membership. Registered iff Healthy and a member.
    pub async fn reconcile(
        &self,
        target: &Target,
        health: HealthState,
        membership: &BTreeSet<MemberId>,
    ) -> LbResult<Registration> {
        let desired = health == HealthState::Healthy && membership.contains(&target.member_id);
        let mut group = self.group.lock().await;
        let current = group.contains(&target.member_id);

        if desired == current {
            return Ok(Registration::Unchanged);
        }

        if desired {
            confirm(self.lb.register(target).await, target, "register")?;
            group.insert(target.clone());
            info!(member = %target.member_id, address = %target.address, "target registered");
            Ok(Registration::Registered)
        } else {
            let registered = group.get(&target.member_id).cloned().unwrap_or_else(|| target.clone());
            confirm(self.lb.deregister(&registered).await, &registered, "deregister")?;
            group.remove(&target.member_id);
            info!(member = %target.member_id, %health, "target deregistered");
            Ok(Registration::Deregistered)
        }
    }

    /// Deregister a member unconditionally (ahead of termination).
    /// `Unchanged` when it was not registered.
    pub async fn deregister(&self, member_id: &str) -> LbResult<Registration> {
        let mut group = self.group.lock().await;
        let Some(target) = group.get(member_id).cloned() else {
            return Ok(Registration::Unchanged);
        };

        confirm(self.lb.deregister(&target).await, &target, "deregister")?;
        group.remove(member_id);
        info!(member = %member_id, "target deregistered before termination");
        Ok(Registration::Deregistered)
    }

    /// Reconcile every member, then drop registrations for ids that are
    /// no longer members at all. Failures are counted, not returned.
    pub async fn reconcile_all(&self, members: &[FleetMember]) -> ReconcileStats {
        let membership: BTreeSet<MemberId> = members
            .iter()
            .filter(|m| m.in_service())
            .map(|m| m.id.clone())
            .collect();
        let known: BTreeSet<&str> = members.iter().map(|m| m.id.as_str()).collect();

        let mut stats = ReconcileStats::default();
        for member in members {
            let outcome = self
                .reconcile(&member.target(), member.health_state, &membership)
                .await;
            if let Err(e) = &outcome {
                warn!(member = %member.id, error = %e, "reconcile failed");
            }
            stats.count(&outcome);
        }

        let stale: Vec<MemberId> = self
            .registered()
            .await
            .into_iter()
            .filter(|id| !known.contains(id.as_str()))
            .collect();
        for id in stale {
            let outcome = self.deregister(&id).await;
            if let Err(e) = &outcome {
                warn!(member = %id, error = %e, "stale target deregistration failed");
            }
            stats.count(&outcome);
        }

        if stats.changes() > 0 || stats.failed > 0 {
            info!(
                registered = stats.registered,
                deregistered = stats.deregistered,
                failed = stats.failed,
                "target reconciliation complete"
            );
        }
        stats
    }

    /// Member ids the collaborator has confirmed as registered.
    pub async fn registered(&self) -> BTreeSet<MemberId> {
        self.group.lock().await.ids()
    }

    pub async fn is_registered(&self, member_id: &str) -> bool {
        self.group.lock().await.contains(member_id)
    }
}

/// A conflict means the target is already where we want it.
fn confirm(result: LbResult<()>, target: &Target, op: &str) -> LbResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(LbError::Conflict(reason)) => {
            debug!(member = %target.member_id, op, %reason, "conflict treated as success");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RoutingTable;

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

    fn membership(ids: &[&str]) -> BTreeSet<MemberId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn setup() -> (Arc<RoutingTable>, LoadBalancerRegistrar) {
        let table = Arc::new(RoutingTable::new());
        let registrar = LoadBalancerRegistrar::new(table.clone());
        (table, registrar)
    }

    #[tokio::test]
    async fn healthy_member_is_registered_once() {
        let (table, registrar) = setup();
        let m = member("a", HealthState::Healthy);
        let ids = membership(&["a"]);

        for _ in 0..5 {
            registrar
                .reconcile(&m.target(), HealthState::Healthy, &ids)
                .await
                .unwrap();
        }

        assert_eq!(table.register_calls(), 1);
        assert_eq!(table.deregister_calls(), 0);
        assert!(registrar.is_registered("a").await);
    }

    #[tokio::test]
    async fn unknown_and_unhealthy_are_not_registered() {
        let (table, registrar) = setup();
        let ids = membership(&["a", "b"]);

        let outcome = registrar
            .reconcile(&member("a", HealthState::Unknown).target(), HealthState::Unknown, &ids)
            .await
            .unwrap();
        assert_eq!(outcome, Registration::Unchanged);

        let outcome = registrar
            .reconcile(
                &member("b", HealthState::Unhealthy).target(),
                HealthState::Unhealthy,
                &ids,
            )
            .await
            .unwrap();
        assert_eq!(outcome, Registration::Unchanged);
        assert_eq!(table.total_calls(), 0);
    }

    #[tokio::test]
    async fn unhealthy_transition_deregisters() {
        let (table, registrar) = setup();
        let target = member("a", HealthState::Healthy).target();
        let ids = membership(&["a"]);

        registrar.reconcile(&target, HealthState::Healthy, &ids).await.unwrap();
        let outcome = registrar
            .reconcile(&target, HealthState::Unhealthy, &ids)
            .await
            .unwrap();

        assert_eq!(outcome, Registration::Deregistered);
        assert!(!table.contains("a"));
        assert!(!registrar.is_registered("a").await);
    }

    #[tokio::test]
    async fn non_member_is_deregistered_even_if_healthy() {
        let (_table, registrar) = setup();
        let target = member("a", HealthState::Healthy).target();

        registrar
            .reconcile(&target, HealthState::Healthy, &membership(&["a"]))
            .await
            .unwrap();
        let outcome = registrar
            .reconcile(&target, HealthState::Healthy, &membership(&[]))
            .await
            .unwrap();
        assert_eq!(outcome, Registration::Deregistered);
    }

    #[tokio::test]
    async fn conflict_counts_as_success() {
        let table = Arc::new(RoutingTable::strict());
        let target = member("a", HealthState::Healthy).target();
        // Registered out of band; the registrar does not know yet.
        table.register(&target).await.unwrap();

        let registrar = LoadBalancerRegistrar::new(table.clone());
        let outcome = registrar
            .reconcile(&target, HealthState::Healthy, &membership(&["a"]))
            .await
            .unwrap();
        assert_eq!(outcome, Registration::Registered);
        assert!(registrar.is_registered("a").await);
    }

    #[tokio::test]
    async fn unavailable_leaves_state_for_retry() {
        let (table, registrar) = setup();
        let target = member("a", HealthState::Healthy).target();
        let ids = membership(&["a"]);

        table.set_available(false);
        let err = registrar
            .reconcile(&target, HealthState::Healthy, &ids)
            .await
            .unwrap_err();
        assert!(matches!(err, LbError::Unavailable(_)));
        assert!(!registrar.is_registered("a").await);

        table.set_available(true);
        let outcome = registrar
            .reconcile(&target, HealthState::Healthy, &ids)
            .await
            .unwrap();
        assert_eq!(outcome, Registration::Registered);
    }

    #[tokio::test]
    async fn deregister_of_unknown_member_makes_no_call() {
        let (table, registrar) = setup();
        assert_eq!(registrar.deregister("ghost").await.unwrap(), Registration::Unchanged);
        assert_eq!(table.total_calls(), 0);
    }

    #[tokio::test]
    async fn adopted_target_can_be_deregistered() {
        let (table, registrar) = setup();
        let target = member("a", HealthState::Healthy).target();
        table.register(&target).await.unwrap();

        registrar.adopt(target).await;
        assert_eq!(registrar.deregister("a").await.unwrap(), Registration::Deregistered);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn reconcile_all_syncs_and_drops_stale_targets() {
        let (table, registrar) = setup();
        registrar
            .reconcile(
                &member("gone", HealthState::Healthy).target(),
                HealthState::Healthy,
                &membership(&["gone"]),
            )
            .await
            .unwrap();

        let mut draining = member("c", HealthState::Healthy);
        draining.terminating = true;
        let members = vec![
            member("a", HealthState::Healthy),
            member("b", HealthState::Unhealthy),
            draining,
        ];

        let stats = registrar.reconcile_all(&members).await;
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.deregistered, 1);
        assert_eq!(stats.unchanged, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(registrar.registered().await, membership(&["a"]));
        assert_eq!(table.targets().len(), 1);

        // A second pass with identical inputs changes nothing.
        let calls = table.total_calls();
        let stats = registrar.reconcile_all(&members).await;
        assert_eq!(stats.changes(), 0);
        assert_eq!(table.total_calls(), calls);
    }
}
