//! Controller error types.

use thiserror::Error;

use fleet_lb::LbError;
use fleet_state::StateError;

/// Errors reported by the provisioning collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// Throttling, capacity shortage, network trouble. Worth retrying.
    #[error("transient provisioning error: {0}")]
    Transient(String),

    /// The request can never succeed as made (e.g. invalid template).
    #[error("provisioning rejected: {0}")]
    Permanent(String),
}

impl ProvisionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::Transient(_))
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors that can occur during controller operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("load balancer error: {0}")]
    Lb(#[from] LbError),

    #[error("unknown member: {0}")]
    UnknownMember(String),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
