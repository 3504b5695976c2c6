//! Wires the control loop together and runs it until shutdown.
//!
//! ```text
//! MetricSampler ──broadcast──► run_alarm(high) ─┐
//!               └────────────► run_alarm(low)  ─┴─mpsc─► Autoscaler ─► FleetController
//! HealthMonitor ──HealthEvent────────────────────────────────────────► FleetController
//! maintenance tick ─► converge + reconcile_targets
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleet_autoscale::{AlarmEvaluator, Autoscaler, ScaleCallback, ScalingPolicyEngine, run_alarm};
use fleet_controller::{FleetController, Provisioner};
use fleet_health::{HealthEvent, HealthMonitor, HealthProbe};
use fleet_lb::{LoadBalancer, LoadBalancerRegistrar};
use fleet_metrics::{MetricSampler, MetricSource};
use fleet_state::{AlarmEvent, AlarmKind, BoxFuture, CapacityDelta, StateStore};

use crate::config::Settings;
use crate::server::{StatusState, build_router};

/// External collaborators the daemon talks to.
pub struct Backends {
    pub metric: Arc<dyn MetricSource>,
    pub provisioner: Arc<dyn Provisioner>,
    pub load_balancer: Arc<dyn LoadBalancer>,
    pub probe: Arc<dyn HealthProbe>,
}

pub struct Daemon {
    name: String,
    controller: Arc<FleetController>,
    sampler: Arc<MetricSampler>,
    autoscaler: Arc<Autoscaler>,
    alarms: Vec<AlarmEvaluator>,
    health_events: mpsc::UnboundedReceiver<HealthEvent>,
    reconcile_interval: Duration,
    listen: Option<SocketAddr>,
}

impl Daemon {
    pub fn build(settings: &Settings, store: StateStore, backends: Backends) -> Self {
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(HealthMonitor::new(
            backends.probe,
            settings.health.clone(),
            health_tx,
        ));
        let registrar = Arc::new(LoadBalancerRegistrar::new(backends.load_balancer));
        let controller = Arc::new(FleetController::new(
            settings.fleet_state(),
            backends.provisioner,
            registrar,
            monitor,
            store,
            settings.controller.clone(),
        ));

        let sampler = Arc::new(MetricSampler::new(
            backends.metric,
            settings.metric_interval,
            settings.metric_timeout,
        ));

        let engine = Arc::new(
            ScalingPolicyEngine::new()
                .with_policy(AlarmKind::HighUtilization, settings.scale_out)
                .with_policy(AlarmKind::LowUtilization, settings.scale_in),
        );
        let autoscaler =
            Arc::new(Autoscaler::new(engine).with_scale_fn(scale_callback(controller.clone())));

        Self {
            name: settings.name.clone(),
            controller,
            sampler,
            autoscaler,
            alarms: settings.alarms.iter().cloned().map(AlarmEvaluator::new).collect(),
            health_events: health_rx,
            reconcile_interval: settings.reconcile_interval,
            listen: settings.listen,
        }
    }

    pub fn controller(&self) -> &Arc<FleetController> {
        &self.controller
    }

    pub fn sampler(&self) -> &Arc<MetricSampler> {
        &self.sampler
    }

    pub fn autoscaler(&self) -> &Arc<Autoscaler> {
        &self.autoscaler
    }

    pub fn status(&self) -> StatusState {
        StatusState {
            fleet: self.name.clone(),
            controller: self.controller.clone(),
            sampler: self.sampler.clone(),
        }
    }

    /// Run every loop until `shutdown` flips, then drain in-flight work
    /// and stop health monitoring.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let status = self.status();
        let Daemon {
            name,
            controller,
            sampler,
            autoscaler,
            alarms,
            health_events,
            reconcile_interval,
            listen,
        } = self;

        let adopted = controller.adopt_persisted().await?;
        let initial = controller.converge().await;
        info!(
            fleet = %name,
            adopted,
            launched = initial.launched.len(),
            desired = initial.desired,
            "fleet daemon started"
        );

        // Bind before spawning so a bad listen address fails startup.
        let listener = match listen {
            Some(addr) => Some(tokio::net::TcpListener::bind(addr).await?),
            None => None,
        };

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // Alarms subscribe before the sampler's first tick.
        let (event_tx, event_rx) = mpsc::channel::<AlarmEvent>(16);
        for evaluator in alarms {
            handles.push(tokio::spawn(run_alarm(
                evaluator,
                sampler.subscribe(),
                event_tx.clone(),
                shutdown.clone(),
            )));
        }
        drop(event_tx);

        {
            let sampler = sampler.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { sampler.run(shutdown).await }));
        }

        {
            let autoscaler = autoscaler.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                autoscaler.run(event_rx, shutdown).await
            }));
        }

        handles.push(tokio::spawn(run_health_events(
            controller.clone(),
            health_events,
            shutdown.clone(),
        )));

        handles.push(tokio::spawn(run_maintenance(
            controller.clone(),
            reconcile_interval,
            shutdown.clone(),
        )));

        if let Some(listener) = listener {
            let router = build_router(status);
            let mut server_shutdown = shutdown.clone();
            info!(addr = ?listener.local_addr().ok(), "status server starting");
            handles.push(tokio::spawn(async move {
                let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                });
                if let Err(e) = server.await {
                    warn!(error = %e, "status server failed");
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        controller.shutdown().await;
        info!(fleet = %name, "fleet daemon stopped");
        Ok(())
    }
}

fn scale_callback(controller: Arc<FleetController>) -> ScaleCallback {
    Box::new(
        move |event: AlarmEvent, delta: CapacityDelta| -> BoxFuture<'static, anyhow::Result<()>> {
            let controller = controller.clone();
            Box::pin(async move {
                let outcome = controller
                    .apply(delta, &format!("alarm {}", event.kind))
                    .await;
                match outcome.degraded {
                    Some(degraded) => Err(anyhow::anyhow!(
                        "desired {} but {} in service: {}",
                        outcome.desired,
                        degraded.in_service,
                        degraded.reason
                    )),
                    None => Ok(()),
                }
            })
        },
    )
}

async fn run_health_events(
    controller: Arc<FleetController>,
    mut events: mpsc::UnboundedReceiver<HealthEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Some(event) => {
                    if let Err(e) = controller.on_health_change(&event).await {
                        warn!(
                            member = %event.member_id,
                            error = %e,
                            "target update failed; reconcile will retry"
                        );
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Periodic convergence and target reconciliation. Repairs launches that
/// exhausted their retries and registrations the load balancer rejected.
async fn run_maintenance(
    controller: Arc<FleetController>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; startup already converged.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outcome = controller.converge().await;
                if !outcome.is_noop() {
                    info!(
                        desired = outcome.desired,
                        launched = outcome.launched.len(),
                        terminated = outcome.terminated.len(),
                        "maintenance converged fleet"
                    );
                }
                let stats = controller.reconcile_targets().await;
                if stats.changes() > 0 || stats.failed > 0 {
                    debug!(?stats, "targets reconciled");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
