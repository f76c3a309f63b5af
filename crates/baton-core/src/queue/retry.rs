//! Retry policy for failed envelopes.
//!
//! There is no backoff: a failed envelope goes straight back to `pending`
//! behind the rest of its priority band.

use crate::domain::DEFAULT_MAX_RETRIES;

/// Bounded retry without backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Bound stamped on envelopes whose producer did not choose one.
    pub default_max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Requeue,
    GiveUp,
}

impl RetryPolicy {
    pub fn new(default_max_retries: u32) -> Self {
        Self { default_max_retries }
    }

    /// `retries` is the count after the failure being decided on.
    pub fn decide(&self, retries: u32, max_retries: u32) -> RetryDecision {
        if retries < max_retries {
            RetryDecision::Requeue
        } else {
            RetryDecision::GiveUp
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}
