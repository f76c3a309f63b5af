use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ids::IdError;
use crate::domain::TaskId;
use crate::ports::ActuatorError;
use crate::queue::Bucket;

/// Operational classification shared by every error enum in the crate.
///
/// - `Validation`: malformed input, rejected at the boundary, never retried.
/// - `Transient`: worth retrying (handler failure, timeout, actuator busy).
/// - `Permanent`: retrying cannot help.
/// - `Infrastructure`: storage or serialization trouble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Transient,
    Permanent,
    Infrastructure,
}

/// Durable store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    InvalidId(#[from] IdError),

    #[error("envelope {0} already exists in the store")]
    DuplicateId(String),

    #[error("{id} not found in {bucket}")]
    NotFound { id: String, bucket: Bucket },

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode {}: {source}", path.display())]
    Codec {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidId(_) | StoreError::DuplicateId(_) => ErrorKind::Validation,
            StoreError::NotFound { .. } => ErrorKind::Permanent,
            StoreError::Io { .. } | StoreError::Codec { .. } => ErrorKind::Infrastructure,
        }
    }
}

/// Lock Token failures. Fatal to the dispatcher when raised while reclaiming.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to re-queue orphaned envelopes: {0}")]
    Recover(#[from] StoreError),
}

impl LockError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Infrastructure
    }
}

/// Errors a command handler may raise instead of returning a result.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error(transparent)]
    Actuator(#[from] ActuatorError),
}

impl HandlerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::InvalidPayload(_) => ErrorKind::Validation,
            HandlerError::Failed(_) | HandlerError::RateLimited(_) | HandlerError::Actuator(_) => {
                ErrorKind::Transient
            }
        }
    }
}

/// Registration and routing failures.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("duplicate handler for command={0}")]
    DuplicateHandler(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::UnknownCommand(_) | RouterError::DuplicateHandler(_) => {
                ErrorKind::Validation
            }
            RouterError::Handler(e) => e.kind(),
        }
    }
}

/// Task engine failures. Vetoed transitions are not errors.
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FsmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsmError::UnknownTask(_) => ErrorKind::Validation,
            FsmError::Store(e) => e.kind(),
        }
    }
}

/// Errors that end a dispatcher tick.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("lock acquisition failed: {0}")]
    Lock(#[source] LockError),

    #[error("stale lock reclamation failed: {0}")]
    Reclaim(#[source] LockError),
}

impl DispatchError {
    /// Only a failed reclamation stops the dispatcher; everything else is
    /// retried on the next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Reclaim(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Store(e) => e.kind(),
            DispatchError::Lock(e) | DispatchError::Reclaim(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_reclaim_failures_are_fatal() {
        let io = || std::io::Error::other("disk gone");
        assert!(DispatchError::Reclaim(LockError::io("/s/lock", io())).is_fatal());
        assert!(!DispatchError::Lock(LockError::io("/s/lock", io())).is_fatal());
        assert!(!DispatchError::Store(StoreError::io("/s/pending", io())).is_fatal());
    }

    #[test]
    fn validation_errors_are_classified() {
        assert_eq!(
            RouterError::UnknownCommand("nope".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            StoreError::DuplicateId("t1".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            HandlerError::RateLimited("slow down".into()).kind(),
            ErrorKind::Transient
        );
    }
}
