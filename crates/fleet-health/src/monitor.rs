//! Health monitor: one background probing task per fleet member.
//!
//! Members are identified by id only; the monitor never owns them. Each
//! state transition is reported on an mpsc channel so the controller can
//! update membership and load balancer registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use fleet_state::{HealthState, MemberId};

use crate::checker::{HealthProbe, HealthSettings, HealthTracker, ProbeResult};

/// A member changed health state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub member_id: MemberId,
    pub previous: HealthState,
    pub current: HealthState,
}

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages health probing for every tracked member.
pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    settings: HealthSettings,
    monitors: Arc<RwLock<HashMap<MemberId, MonitorSlot>>>,
    events: mpsc::UnboundedSender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        settings: HealthSettings,
        events: mpsc::UnboundedSender<HealthEvent>,
    ) -> Self {
        Self {
            probe,
            settings,
            monitors: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Start probing a member. Replaces any monitor already running for it.
    pub async fn start_monitor(&self, member_id: &str, address: &str) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_health_loop(
            member_id.to_string(),
            address.to_string(),
            self.probe.clone(),
            self.settings.clone(),
            self.events.clone(),
            shutdown_rx,
        ));

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            member_id.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(member = %member_id, %address, path = %self.settings.path, "health monitor started");
    }

    /// Stop probing a member.
    pub async fn stop_monitor(&self, member_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(member_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(member = %member_id, "health monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(member = %id, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    /// Member ids with an active monitor.
    pub async fn active_monitors(&self) -> Vec<MemberId> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, member_id: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(member_id)
    }
}

/// Run one probe, converting an overrun into `TimedOut`.
pub async fn probe_with_timeout(
    probe: &dyn HealthProbe,
    address: &str,
    timeout: Duration,
) -> ProbeResult {
    match tokio::time::timeout(timeout, probe.probe(address)).await {
        Ok(result) => result,
        Err(_) => ProbeResult::TimedOut,
    }
}

async fn run_health_loop(
    member_id: MemberId,
    address: String,
    probe: Arc<dyn HealthProbe>,
    settings: HealthSettings,
    events: mpsc::UnboundedSender<HealthEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = HealthTracker::new(&settings);
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(member = %member_id, "health loop starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = probe_with_timeout(probe.as_ref(), &address, settings.timeout).await;
                let previous = tracker.status();
                let current = tracker.record(result);
                debug!(member = %member_id, ?result, status = %current, "health probe");

                if current != previous {
                    let event = HealthEvent {
                        member_id: member_id.clone(),
                        previous,
                        current,
                    };
                    if events.send(event).is_err() {
                        debug!(member = %member_id, "health event receiver dropped");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!(member = %member_id, "health loop shutting down");
                break;
            }
        }
    }
}
