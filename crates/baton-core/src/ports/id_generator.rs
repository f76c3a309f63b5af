//! IdGenerator port - id generation.
//!
//! # Implementation
//! - **UlidGenerator**: ULID based, timestamp from a `Clock`, monotonic per
//!   generator even when several ids land in the same millisecond.

use std::sync::{Mutex, PoisonError};

use ulid::Ulid;

use crate::domain::{EnvelopeId, HolderId, TaskId};
use crate::ports::Clock;

/// Generates the ids the core stamps on its own records.
pub trait IdGenerator: Send + Sync {
    fn envelope_id(&self) -> EnvelopeId;

    fn task_id(&self) -> TaskId;

    fn holder_id(&self) -> HolderId;
}

/// Monotonic ULID ids: strictly increasing even within one millisecond.
pub struct UlidGenerator<C> {
    clock: C,
    last: Mutex<Option<Ulid>>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            last: Mutex::new(None),
        }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let candidate = Ulid::from_parts(timestamp_ms, rand::random());

        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let ulid = match *last {
            Some(prev) if candidate <= prev => prev.increment().unwrap_or(candidate),
            _ => candidate,
        };
        *last = Some(ulid);
        ulid
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn envelope_id(&self) -> EnvelopeId {
        EnvelopeId::from_ulid(self.next())
    }

    fn task_id(&self) -> TaskId {
        TaskId::from_ulid(self.next())
    }

    fn holder_id(&self) -> HolderId {
        HolderId::from_ulid(self.next())
    }
}
