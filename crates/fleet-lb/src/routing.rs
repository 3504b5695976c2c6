//! In-process routing table.
//!
//! A `LoadBalancer` that keeps registered targets in memory. Used by the
//! simulator and tests; it also counts collaborator calls so callers can
//! verify they are not generating redundant traffic.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use fleet_state::{BoxFuture, Target};

use crate::balancer::{LbError, LbResult, LoadBalancer};

pub struct RoutingTable {
    targets: RwLock<Vec<Target>>,
    register_calls: AtomicUsize,
    deregister_calls: AtomicUsize,
    available: AtomicBool,
    /// Report `Conflict` for requests that change nothing.
    strict: bool,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            targets: RwLock::new(Vec::new()),
            register_calls: AtomicUsize::new(0),
            deregister_calls: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            strict: false,
        }
    }

    /// A table that answers no-op requests with `LbError::Conflict`.
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::new()
        }
    }

    /// Simulate an outage of the load-balancing API.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub fn targets(&self) -> Vec<Target> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, member_id: &str) -> bool {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|t| t.member_id == member_id)
    }

    pub fn len(&self) -> usize {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::Relaxed)
    }

    pub fn deregister_calls(&self) -> usize {
        self.deregister_calls.load(Ordering::Relaxed)
    }

    /// Total collaborator calls received.
    pub fn total_calls(&self) -> usize {
        self.register_calls() + self.deregister_calls()
    }

    fn check_available(&self) -> LbResult<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(LbError::Unavailable("routing table offline".to_string()))
        }
    }

    fn add(&self, target: &Target) -> LbResult<()> {
        self.register_calls.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        let mut targets = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        if targets.iter().any(|t| t.member_id == target.member_id) {
            if self.strict {
                return Err(LbError::Conflict(format!(
                    "{} already registered",
                    target.member_id
                )));
            }
            return Ok(());
        }
        targets.push(target.clone());
        debug!(member = %target.member_id, address = %target.address, count = targets.len(), "target added");
        Ok(())
    }

    fn remove(&self, target: &Target) -> LbResult<()> {
        self.deregister_calls.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        let mut targets = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        let before = targets.len();
        targets.retain(|t| t.member_id != target.member_id);
        if targets.len() == before && self.strict {
            return Err(LbError::Conflict(format!(
                "{} not registered",
                target.member_id
            )));
        }
        debug!(member = %target.member_id, count = targets.len(), "target removed");
        Ok(())
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoutingTable {
    fn register<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, LbResult<()>> {
        let result = self.add(target);
        Box::pin(async move { result })
    }

    fn deregister<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, LbResult<()>> {
        let result = self.remove(target);
        Box::pin(async move { result })
    }
}
