//! Fleet controller: owns membership and turns capacity changes into
//! launches and terminations.
//!
//! Scale operations are serialized by `scale_lock`; membership lives in a
//! single `FleetState` behind its own mutex so health events can update
//! members while a scale operation waits on the provisioning API.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use fleet_health::{HealthEvent, HealthMonitor};
use fleet_lb::{LoadBalancerRegistrar, ReconcileStats, Registration};
use fleet_state::{
    CapacityDelta, FleetMember, FleetSnapshot, FleetState, HealthState, InstanceHandle,
    LaunchTemplate, MemberId, ScalingActivity, StateStore, epoch_secs,
};

use crate::error::{ControllerError, ControllerResult};
use crate::provisioner::Provisioner;
use crate::retry::RetryPolicy;
use crate::selection::select_victims;

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub template: LaunchTemplate,
    pub retry: RetryPolicy,
    /// Terminate and relaunch Unhealthy members during `converge`.
    pub replace_unhealthy: bool,
    /// Scaling activities kept in the store.
    pub activity_history: usize,
}

impl ControllerSettings {
    pub fn new(template: LaunchTemplate) -> Self {
        Self {
            template,
            retry: RetryPolicy::default(),
            replace_unhealthy: false,
            activity_history: 100,
        }
    }
}

/// The fleet could not reach its desired capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedCapacity {
    pub desired: u32,
    pub in_service: u32,
    pub min_size: u32,
    pub reason: String,
}

impl DegradedCapacity {
    pub fn below_min(&self) -> bool {
        self.in_service < self.min_size
    }

    pub fn shortfall(&self) -> u32 {
        self.desired.saturating_sub(self.in_service)
    }
}

/// Result of one scale or converge operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScaleOutcome {
    pub previous_desired: u32,
    pub desired: u32,
    pub launched: Vec<MemberId>,
    pub terminated: Vec<MemberId>,
    pub degraded: Option<DegradedCapacity>,
}

impl ScaleOutcome {
    fn unchanged(desired: u32) -> Self {
        Self {
            previous_desired: desired,
            desired,
            ..Default::default()
        }
    }

    /// Nothing changed and nothing went wrong.
    pub fn is_noop(&self) -> bool {
        self.previous_desired == self.desired
            && self.launched.is_empty()
            && self.terminated.is_empty()
            && self.degraded.is_none()
    }
}

pub struct FleetController {
    fleet: Mutex<FleetState>,
    scale_lock: Mutex<()>,
    provisioner: Arc<dyn Provisioner>,
    registrar: Arc<LoadBalancerRegistrar>,
    monitor: Arc<HealthMonitor>,
    store: StateStore,
    settings: ControllerSettings,
    degraded_events: AtomicU64,
    shutting_down: AtomicBool,
}

impl FleetController {
    pub fn new(
        fleet: FleetState,
        provisioner: Arc<dyn Provisioner>,
        registrar: Arc<LoadBalancerRegistrar>,
        monitor: Arc<HealthMonitor>,
        store: StateStore,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            fleet: Mutex::new(fleet),
            scale_lock: Mutex::new(()),
            provisioner,
            registrar,
            monitor,
            store,
            settings,
            degraded_events: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn registrar(&self) -> &Arc<LoadBalancerRegistrar> {
        &self.registrar
    }

    /// Degraded-capacity conditions reported so far.
    pub fn degraded_events(&self) -> u64 {
        self.degraded_events.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> FleetSnapshot {
        self.fleet.lock().await.snapshot()
    }

    /// Re-adopt members persisted by a previous run: track them, resume
    /// health probing, and remember which ones were registered.
    pub async fn adopt_persisted(&self) -> ControllerResult<usize> {
        let persisted = self.store.list_members()?;
        let count = persisted.len();

        for member in persisted {
            let (id, address, in_service) =
                (member.id.clone(), member.address.clone(), member.in_service());
            if member.registered {
                self.registrar.adopt(member.target()).await;
            }
            info!(member = %id, health = %member.health_state, terminating = member.terminating, "member re-adopted");
            self.fleet.lock().await.insert(member);
            if in_service {
                self.monitor.start_monitor(&id, &address).await;
            }
        }

        if count > 0 {
            info!(count, "persisted members re-adopted");
        }
        Ok(count)
    }

    /// Change desired capacity by a signed instance count, then launch or
    /// terminate toward it.
    pub async fn scale(&self, delta: i64) -> ScaleOutcome {
        let _guard = self.scale_lock.lock().await;
        self.scale_locked(delta, "manual").await
    }

    /// Resolve a policy delta against the current desired capacity and
    /// scale by it.
    pub async fn apply(&self, delta: CapacityDelta, cause: &str) -> ScaleOutcome {
        let _guard = self.scale_lock.lock().await;
        let current = self.fleet.lock().await.desired_capacity();
        self.scale_locked(delta.resolve(current), cause).await
    }

    /// Bring the fleet back to desired capacity: finish interrupted
    /// terminations, optionally replace Unhealthy members, then launch or
    /// terminate the difference.
    pub async fn converge(&self) -> ScaleOutcome {
        let _guard = self.scale_lock.lock().await;
        let started_at = epoch_secs();

        let (desired, stuck, unhealthy) = {
            let fleet = self.fleet.lock().await;
            let stuck: Vec<MemberId> = fleet
                .members()
                .filter(|m| m.terminating)
                .map(|m| m.id.clone())
                .collect();
            let unhealthy: Vec<MemberId> = fleet
                .members()
                .filter(|m| {
                    self.settings.replace_unhealthy
                        && m.in_service()
                        && m.health_state == HealthState::Unhealthy
                })
                .map(|m| m.id.clone())
                .collect();
            (fleet.desired_capacity(), stuck, unhealthy)
        };

        let mut outcome = ScaleOutcome::unchanged(desired);
        if self.shutting_down.load(Ordering::Relaxed) {
            return outcome;
        }

        for id in stuck {
            debug!(member = %id, "retrying interrupted termination");
            self.terminate_into(&id, &mut outcome).await;
        }
        for id in unhealthy {
            info!(member = %id, "replacing unhealthy member");
            self.terminate_into(&id, &mut outcome).await;
        }

        self.converge_members(&mut outcome).await;
        if !outcome.is_noop() {
            self.record("converge", &outcome, started_at);
        }
        outcome
    }

    async fn scale_locked(&self, delta: i64, cause: &str) -> ScaleOutcome {
        if self.shutting_down.load(Ordering::Relaxed) {
            let desired = self.fleet.lock().await.desired_capacity();
            debug!(delta, %cause, "controller shutting down, scale skipped");
            return ScaleOutcome::unchanged(desired);
        }

        let started_at = epoch_secs();
        let (previous, desired) = self.fleet.lock().await.adjust_desired(delta);
        if previous != desired {
            info!(from = previous, to = desired, delta, %cause, "desired capacity changed");
        } else {
            debug!(desired, delta, %cause, "desired capacity unchanged");
        }

        let mut outcome = ScaleOutcome {
            previous_desired: previous,
            desired,
            ..Default::default()
        };
        self.converge_members(&mut outcome).await;
        if !outcome.is_noop() {
            self.record(cause, &outcome, started_at);
        }
        outcome
    }

    /// Launch or terminate until in-service members match desired.
    async fn converge_members(&self, outcome: &mut ScaleOutcome) {
        let (desired, in_service) = {
            let fleet = self.fleet.lock().await;
            (fleet.desired_capacity(), fleet.in_service_count())
        };

        if in_service < desired {
            self.launch_members(desired - in_service, outcome).await;
        } else if in_service > desired {
            let victims = {
                let fleet = self.fleet.lock().await;
                select_victims(&fleet.snapshot().members, (in_service - desired) as usize)
            };
            for id in victims {
                self.terminate_into(&id, outcome).await;
            }
        }
    }

    async fn launch_members(&self, count: u32, outcome: &mut ScaleOutcome) {
        for _ in 0..count {
            let result = self
                .settings
                .retry
                .run("launch", || self.provisioner.launch(&self.settings.template))
                .await;
            match result {
                Ok(handle) => outcome.launched.push(self.track_launched(&handle).await),
                Err(e) => {
                    self.report_degraded(e.to_string(), outcome).await;
                    break;
                }
            }
        }
    }

    async fn track_launched(&self, handle: &InstanceHandle) -> MemberId {
        let member = FleetMember::launched(handle, epoch_secs());
        self.persist(&member);
        self.fleet.lock().await.insert(member);
        self.monitor.start_monitor(&handle.id, &handle.address).await;
        info!(member = %handle.id, address = %handle.address, "member joined fleet");
        handle.id.clone()
    }

    async fn report_degraded(&self, reason: String, outcome: &mut ScaleOutcome) {
        let (desired, in_service, min_size) = {
            let fleet = self.fleet.lock().await;
            (fleet.desired_capacity(), fleet.in_service_count(), fleet.min_size())
        };
        let degraded = DegradedCapacity {
            desired,
            in_service,
            min_size,
            reason,
        };
        self.degraded_events.fetch_add(1, Ordering::Relaxed);

        if degraded.below_min() {
            error!(desired, in_service, min = min_size, reason = %degraded.reason, "fleet below minimum size");
        } else {
            warn!(desired, in_service, shortfall = degraded.shortfall(), reason = %degraded.reason, "degraded capacity");
        }
        outcome.degraded = Some(degraded);
    }

    async fn terminate_into(&self, id: &str, outcome: &mut ScaleOutcome) {
        match self.terminate_member(id).await {
            Ok(()) => outcome.terminated.push(id.to_string()),
            Err(e) => warn!(member = %id, error = %e, "termination failed, member stays tracked"),
        }
    }

    /// Drain and destroy one member: take it out of service, deregister
    /// it, then ask the provisioner to terminate it. The member is only
    /// forgotten once termination is confirmed.
    pub async fn terminate_member(&self, id: &str) -> ControllerResult<()> {
        let member = {
            let mut fleet = self.fleet.lock().await;
            let member = fleet
                .get_mut(id)
                .ok_or_else(|| ControllerError::UnknownMember(id.to_string()))?;
            member.terminating = true;
            member.clone()
        };
        self.persist(&member);
        self.monitor.stop_monitor(id).await;

        self.registrar.deregister(id).await?;
        self.set_registered(id, false).await;

        let handle = member.handle();
        self.settings
            .retry
            .run("terminate", || self.provisioner.terminate(&handle))
            .await?;

        self.fleet.lock().await.remove(id);
        if let Err(e) = self.store.delete_member(id) {
            error!(member = %id, error = %e, "failed to delete terminated member");
        }
        info!(member = %id, "member terminated");
        Ok(())
    }

    /// Apply a health transition and reconcile the member's registration.
    pub async fn on_health_change(&self, event: &HealthEvent) -> ControllerResult<Registration> {
        let mut fleet = self.fleet.lock().await;
        let Some(member) = fleet.get_mut(&event.member_id) else {
            debug!(member = %event.member_id, "health event for untracked member ignored");
            return Ok(Registration::Unchanged);
        };
        member.health_state = event.current;
        self.persist(member);
        if member.terminating {
            return Ok(Registration::Unchanged);
        }
        let target = member.target();
        info!(member = %event.member_id, from = %event.previous, to = %event.current, "member health changed");

        // Fleet lock stays held so a concurrent termination cannot slip in
        // between the membership check and the collaborator call.
        let membership = fleet.membership();
        let registration = self
            .registrar
            .reconcile(&target, event.current, &membership)
            .await?;

        let registered = match registration {
            Registration::Registered => true,
            Registration::Deregistered => false,
            Registration::Unchanged => return Ok(registration),
        };
        if let Some(member) = fleet.get_mut(&event.member_id) {
            member.registered = registered;
            self.persist(member);
        }
        Ok(registration)
    }

    /// Full pass over every member's registration, recording the result
    /// on the members.
    ///
    /// The collaborator calls run against a snapshot with the fleet lock
    /// released, so status reads and health events are not held up by a
    /// slow load balancer. `scale_lock` keeps terminations out of the pass.
    pub async fn reconcile_targets(&self) -> ReconcileStats {
        let _guard = self.scale_lock.lock().await;
        let members: Vec<FleetMember> = self.fleet.lock().await.members().cloned().collect();
        let mut stats = self.registrar.reconcile_all(&members).await;

        let mut fleet = self.fleet.lock().await;
        // Health transitions that landed during the pass win over the snapshot.
        let membership = fleet.membership();
        for before in &members {
            if let Some(member) = fleet.get(&before.id)
                && member.health_state != before.health_state
            {
                let outcome = self
                    .registrar
                    .reconcile(&member.target(), member.health_state, &membership)
                    .await;
                stats.count(&outcome);
            }
        }

        let registered = self.registrar.registered().await;
        for member in &members {
            let now = registered.contains(&member.id);
            if let Some(tracked) = fleet.get_mut(&member.id)
                && tracked.registered != now
            {
                tracked.registered = now;
                self.persist(tracked);
            }
        }
        stats
    }

    /// Wait for the in-flight scale operation, refuse further ones, and
    /// stop every health monitor.
    pub async fn shutdown(&self) {
        let _guard = self.scale_lock.lock().await;
        self.shutting_down.store(true, Ordering::Relaxed);
        self.monitor.stop_all().await;
        info!("fleet controller stopped");
    }

    /// Scaling activities, newest first.
    pub fn recent_activities(&self, limit: usize) -> ControllerResult<Vec<ScalingActivity>> {
        Ok(self.store.list_activities(limit)?)
    }

    async fn set_registered(&self, id: &str, registered: bool) {
        let mut fleet = self.fleet.lock().await;
        if let Some(member) = fleet.get_mut(id)
            && member.registered != registered
        {
            member.registered = registered;
            self.persist(member);
        }
    }

    fn persist(&self, member: &FleetMember) {
        if let Err(e) = self.store.put_member(member) {
            error!(member = %member.id, error = %e, "failed to persist member");
        }
    }

    fn record(&self, cause: &str, outcome: &ScaleOutcome, started_at: u64) {
        let activity = ScalingActivity {
            seq: 0,
            cause: cause.to_string(),
            from_desired: outcome.previous_desired,
            to_desired: outcome.desired,
            launched: outcome.launched.clone(),
            terminated: outcome.terminated.clone(),
            degraded: outcome.degraded.is_some(),
            started_at,
            finished_at: epoch_secs(),
        };
        if let Err(e) = self
            .store
            .record_activity(&activity, self.settings.activity_history)
        {
            error!(%cause, error = %e, "failed to record scaling activity");
        }
    }
}
