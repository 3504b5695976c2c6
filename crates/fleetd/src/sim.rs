//! In-process backends for `fleetd simulate`.

use std::sync::Arc;

use fleet_controller::LocalProvisioner;
use fleet_health::{HealthProbe, ProbeResult};
use fleet_lb::RoutingTable;
use fleet_metrics::ScriptedSource;
use fleet_state::BoxFuture;

use crate::config::SimulationConfig;
use crate::daemon::Backends;

/// Healthy while the local provisioner reports the instance as serving.
pub struct SimulatedProbe {
    provisioner: Arc<LocalProvisioner>,
}

impl SimulatedProbe {
    pub fn new(provisioner: Arc<LocalProvisioner>) -> Self {
        Self { provisioner }
    }
}

impl HealthProbe for SimulatedProbe {
    fn probe<'a>(&'a self, address: &'a str) -> BoxFuture<'a, ProbeResult> {
        let result = if self.provisioner.is_serving(address) {
            ProbeResult::Healthy
        } else {
            ProbeResult::Failed
        };
        Box::pin(async move { result })
    }
}

/// Simulation collaborators, kept typed so callers can steer them.
pub struct Simulation {
    pub source: Arc<ScriptedSource>,
    pub provisioner: Arc<LocalProvisioner>,
    pub routing: Arc<RoutingTable>,
}

impl Simulation {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            source: Arc::new(ScriptedSource::from_values(&config.utilization)),
            provisioner: Arc::new(LocalProvisioner::with_failure_rate(config.failure_rate)),
            routing: Arc::new(RoutingTable::new()),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            metric: self.source.clone(),
            provisioner: self.provisioner.clone(),
            load_balancer: self.routing.clone(),
            probe: Arc::new(SimulatedProbe::new(self.provisioner.clone())),
        }
    }
}
