//! Load-balancing collaborator interface.

use thiserror::Error;

use fleet_state::{BoxFuture, Target};

pub type LbResult<T> = Result<T, LbError>;

/// Errors reported by the load-balancing collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LbError {
    /// The target is already in the requested state.
    #[error("registration conflict: {0}")]
    Conflict(String),

    #[error("load balancer unavailable: {0}")]
    Unavailable(String),
}

/// Accepts target (de)registration. Both calls are expected to be
/// idempotent on the collaborator side.
pub trait LoadBalancer: Send + Sync {
    fn register<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, LbResult<()>>;
    fn deregister<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, LbResult<()>>;
}
