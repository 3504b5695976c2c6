//! Autoscaler: drains alarm events in arrival order and hands applied
//! deltas to the fleet controller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use fleet_state::{AlarmEvent, BoxFuture, CapacityDelta};

use crate::policy::ScalingPolicyEngine;

/// Outcome of handling one alarm event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// The policy applied; the delta was handed to the scale callback.
    Apply(CapacityDelta),
    /// Cooling down, or no policy bound. The event is dropped.
    Suppressed,
}

/// Callback type for performing scaling actions.
///
/// The autoscaler calls this with the triggering event and the delta the
/// policy produced.
pub type ScaleCallback =
    Box<dyn Fn(AlarmEvent, CapacityDelta) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct Autoscaler {
    engine: Arc<ScalingPolicyEngine>,
    scale_fn: Option<ScaleCallback>,
    applied: AtomicU64,
    suppressed: AtomicU64,
}

impl Autoscaler {
    pub fn new(engine: Arc<ScalingPolicyEngine>) -> Self {
        Self {
            engine,
            scale_fn: None,
            applied: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Set the callback used to perform scaling.
    pub fn with_scale_fn(mut self, f: ScaleCallback) -> Self {
        self.scale_fn = Some(f);
        self
    }

    pub fn engine(&self) -> &ScalingPolicyEngine {
        &self.engine
    }

    /// Events that produced a delta.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Events dropped by cooldown or missing policy.
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Handle a single event: consult the policy, then run the scale
    /// callback to completion. A failing callback is logged, not retried.
    pub async fn handle(&self, event: AlarmEvent) -> ScaleDecision {
        let Some(delta) = self.engine.apply(&event) else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return ScaleDecision::Suppressed;
        };
        self.applied.fetch_add(1, Ordering::Relaxed);

        if let Some(ref scale_fn) = self.scale_fn
            && let Err(e) = scale_fn(event, delta).await
        {
            warn!(
                alarm = %event.kind,
                ?delta,
                error = %e,
                "scaling action failed"
            );
        }

        ScaleDecision::Apply(delta)
    }

    /// Run the autoscaler loop. Shutdown is only observed between events,
    /// so a scale operation that has started always completes.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<AlarmEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("autoscaler started");

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Some(event) => {
                        let decision = self.handle(event).await;
                        debug!(alarm = %event.kind, ?decision, "alarm event handled");
                    }
                    None => {
                        debug!("alarm event channel closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}
