//! Durable file-system queue: buckets, Lock Token, audit log.

pub mod audit;
pub mod bucket;
pub(crate) mod fsio;
pub mod lock;
pub mod retry;
pub mod store;

pub use self::audit::{AuditEntry, AuditKind, AuditLog};
pub use self::bucket::Bucket;
pub use self::lock::{Acquire, FileLock, LockGuard, LockToken, Reclaim};
pub use self::retry::{RetryDecision, RetryPolicy};
pub use self::store::{DurableStore, FailOutcome, StoreCounts};
