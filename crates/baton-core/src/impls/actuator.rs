//! Actuators that never touch a device.

use std::sync::{Mutex, PoisonError};

use tracing::info;

use crate::domain::Payload;
use crate::ports::{Actuator, ActuatorError};

/// Logs every action and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingActuator;

impl Actuator for LoggingActuator {
    fn perform(&self, target: &str, payload: &Payload) -> Result<(), ActuatorError> {
        let action = payload.get("action").and_then(|v| v.as_str()).unwrap_or("-");
        info!(actuator_target = target, action, "actuator action");
        Ok(())
    }
}

/// Remembers every call; optionally fails each one with `Busy`.
#[derive(Debug, Default)]
pub struct RecordingActuator {
    calls: Mutex<Vec<(String, Payload)>>,
    fail_with: Option<String>,
}

impl RecordingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            calls: Mutex::default(),
            fail_with: Some(reason.into()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Payload)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Actuator for RecordingActuator {
    fn perform(&self, target: &str, payload: &Payload) -> Result<(), ActuatorError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((target.to_string(), payload.clone()));
        match &self.fail_with {
            Some(reason) => Err(ActuatorError::Busy(reason.clone())),
            None => Ok(()),
        }
    }
}
