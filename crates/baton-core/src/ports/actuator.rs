//! Actuator port - the external, exclusive effector (e.g. a shared input
//! device driving a remote UI).
//!
//! The core never looks inside. It only guarantees that `perform` is called
//! from a handler running under the dispatcher's Lock Token, one call at a
//! time. Implementations must be synchronous and safe to retry.

use thiserror::Error;

use crate::domain::Payload;

/// Why the actuator refused or failed. Mapped to a retryable handler error.
#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("actuator busy: {0}")]
    Busy(String),

    #[error("actuator unreachable: {0}")]
    Unreachable(String),

    #[error("actuator rejected the action: {0}")]
    Rejected(String),
}

/// The exclusive, externally driven control channel.
///
/// Calls are blocking and are made from a blocking thread while the caller
/// holds the Lock Token, so implementations never see two calls at once.
pub trait Actuator: Send + Sync {
    fn perform(&self, target: &str, payload: &Payload) -> Result<(), ActuatorError>;
}
