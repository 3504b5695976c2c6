//! Provisioning collaborator interface and an in-process implementation.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use fleet_state::{BoxFuture, InstanceHandle, LaunchTemplate};

use crate::error::{ProvisionError, ProvisionResult};

/// Creates and destroys compute instances. The backing API is
/// eventually consistent: terminating an instance it no longer knows
/// about is not an error.
pub trait Provisioner: Send + Sync {
    fn launch<'a>(&'a self, template: &'a LaunchTemplate)
    -> BoxFuture<'a, ProvisionResult<InstanceHandle>>;

    fn terminate<'a>(&'a self, instance: &'a InstanceHandle) -> BoxFuture<'a, ProvisionResult<()>>;
}

#[derive(Default)]
struct LocalInner {
    instances: BTreeMap<String, InstanceHandle>,
    /// Instances that should fail their health checks.
    sick: BTreeSet<String>,
    launch_failures: VecDeque<ProvisionError>,
    terminate_failures: VecDeque<ProvisionError>,
    /// Accumulates `failure_rate` per launch; a launch fails when it
    /// crosses 1.0.
    failure_budget: f64,
}

/// In-process provisioner for simulation and tests.
///
/// Instances get sequential ids (`i-00000001`) and loopback-style
/// addresses. Failures can be scripted per call or injected at a steady
/// rate.
pub struct LocalProvisioner {
    prefix: String,
    failure_rate: f64,
    next_id: AtomicU64,
    launches: AtomicU64,
    terminations: AtomicU64,
    inner: Mutex<LocalInner>,
}

impl LocalProvisioner {
    pub fn new() -> Self {
        Self::with_failure_rate(0.0)
    }

    /// A provisioner whose launches fail transiently at `rate` (0.0..=1.0),
    /// spread evenly rather than randomly.
    pub fn with_failure_rate(rate: f64) -> Self {
        Self {
            prefix: "10.0".to_string(),
            failure_rate: rate.clamp(0.0, 1.0),
            next_id: AtomicU64::new(1),
            launches: AtomicU64::new(0),
            terminations: AtomicU64::new(0),
            inner: Mutex::new(LocalInner::default()),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, LocalInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue errors returned by the next launch calls, in order.
    pub fn fail_launches(&self, errors: impl IntoIterator<Item = ProvisionError>) {
        self.inner().launch_failures.extend(errors);
    }

    /// Queue errors returned by the next terminate calls, in order.
    pub fn fail_terminations(&self, errors: impl IntoIterator<Item = ProvisionError>) {
        self.inner().terminate_failures.extend(errors);
    }

    /// Make an instance start (or stop) failing its health checks.
    pub fn set_sick(&self, id: &str, sick: bool) {
        let mut inner = self.inner();
        if sick {
            inner.sick.insert(id.to_string());
        } else {
            inner.sick.remove(id);
        }
    }

    /// Whether the instance at `address` exists and is serving.
    pub fn is_serving(&self, address: &str) -> bool {
        let inner = self.inner();
        inner
            .instances
            .values()
            .any(|h| h.address == address && !inner.sick.contains(&h.id))
    }

    pub fn instances(&self) -> Vec<InstanceHandle> {
        self.inner().instances.values().cloned().collect()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.inner().instances.contains_key(id)
    }

    /// Launch calls received, successful or not.
    pub fn launch_calls(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    pub fn terminate_calls(&self) -> u64 {
        self.terminations.load(Ordering::Relaxed)
    }

    fn do_launch(&self, template: &LaunchTemplate) -> ProvisionResult<InstanceHandle> {
        self.launches.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner();

        if let Some(err) = inner.launch_failures.pop_front() {
            debug!(template = %template.name, error = %err, "scripted launch failure");
            return Err(err);
        }
        if template.image.is_empty() {
            return Err(ProvisionError::Permanent(format!(
                "launch template {} has no image",
                template.name
            )));
        }

        inner.failure_budget += self.failure_rate;
        if inner.failure_budget >= 1.0 {
            inner.failure_budget -= 1.0;
            return Err(ProvisionError::Transient("insufficient capacity".to_string()));
        }

        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = InstanceHandle {
            id: format!("i-{n:08x}"),
            address: format!("{}.{}.{}:8080", self.prefix, (n >> 8) & 0xff, n & 0xff),
        };
        inner.instances.insert(handle.id.clone(), handle.clone());
        info!(instance = %handle.id, address = %handle.address, template = %template.name, "instance launched");
        Ok(handle)
    }

    fn do_terminate(&self, instance: &InstanceHandle) -> ProvisionResult<()> {
        self.terminations.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner();

        if let Some(err) = inner.terminate_failures.pop_front() {
            debug!(instance = %instance.id, error = %err, "scripted terminate failure");
            return Err(err);
        }

        inner.sick.remove(&instance.id);
        if inner.instances.remove(&instance.id).is_some() {
            info!(instance = %instance.id, "instance terminated");
        } else {
            debug!(instance = %instance.id, "instance already gone");
        }
        Ok(())
    }
}

impl Default for LocalProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Provisioner for LocalProvisioner {
    fn launch<'a>(
        &'a self,
        template: &'a LaunchTemplate,
    ) -> BoxFuture<'a, ProvisionResult<InstanceHandle>> {
        let result = self.do_launch(template);
        Box::pin(async move { result })
    }

    fn terminate<'a>(&'a self, instance: &'a InstanceHandle) -> BoxFuture<'a, ProvisionResult<()>> {
        let result = self.do_terminate(instance);
        Box::pin(async move { result })
    }
}
