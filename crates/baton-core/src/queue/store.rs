//! DurableStore: the file-system queue.
//!
//! One directory per [`Bucket`], one pretty-printed JSON file per envelope,
//! file name = envelope id. Moving between buckets is a single `rename`, so
//! an envelope is always in exactly one bucket. Records are rewritten in
//! place (atomically) before they move.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::audit::{AuditEntry, AuditKind, AuditLog};
use super::bucket::Bucket;
use super::fsio;
use super::lock::{FileLock, LockGuard};
use super::retry::{RetryDecision, RetryPolicy};
use crate::domain::{Envelope, EnvelopeId, EnvelopeStatus};
use crate::error::StoreError;
use crate::ports::Clock;

const TASKS_DIR: &str = "tasks";
const QUARANTINE_DIR: &str = "quarantine";
const AUDIT_FILE: &str = "queue.log";
const DEFAULT_STALE_AFTER_SECS: i64 = 60;

/// What `fail` did with the envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Back in `pending`, behind the rest of its priority band.
    Requeued(Envelope),
    /// Retries exhausted; parked in `failed`.
    Failed(Envelope),
}

impl FailOutcome {
    /// The envelope as written, in whichever bucket it landed.
    pub fn envelope(&self) -> &Envelope {
        match self {
            FailOutcome::Requeued(env) | FailOutcome::Failed(env) => env,
        }
    }

    /// True once the envelope will not be dispatched again.
    pub fn is_final(&self) -> bool {
        matches!(self, FailOutcome::Failed(_))
    }
}

/// Number of envelope files per bucket, as listed at one instant.
///
/// Buckets are listed one after another, so an envelope moving during the
/// count may be seen twice or not at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Directory-backed envelope queue with its Lock Token and audit log.
///
/// Layout under `root`:
///
/// ```text
/// pending/ processing/ completed/ failed/   one file per envelope
/// tasks/                                    task records (FileTaskStore)
/// quarantine/<recipient>/                   rejected inbox files
/// lock, lock.reclaim                        Lock Token and reclaim marker
/// queue.log                                 JSON-lines audit trail
/// ```
///
/// Producers may call [`enqueue`](Self::enqueue) concurrently from any
/// process. Every other mutation expects the caller to hold the Lock Token.
pub struct DurableStore {
    root: PathBuf,
    lock: FileLock,
    audit: AuditLog,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl DurableStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let root = root.into();
        let dirs = Bucket::ALL
            .iter()
            .map(|b| root.join(b.dir_name()))
            .chain([root.join(TASKS_DIR), root.join(QUARANTINE_DIR)]);
        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(Self {
            lock: FileLock::new(&root, Duration::seconds(DEFAULT_STALE_AFTER_SECS)),
            audit: AuditLog::new(root.join(AUDIT_FILE)),
            retry: RetryPolicy::default(),
            clock,
            root,
        })
    }

    /// Replace the default retry bound (3).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Age after which a Lock Token may be reclaimed (default 60s).
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock = FileLock::new(&self.root, stale_after);
        self
    }

    /// Directory the store was opened on.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The Lock Token file at `<root>/lock`.
    pub fn lock(&self) -> &FileLock {
        &self.lock
    }

    /// The `queue.log` audit trail.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Retry policy applied by [`fail`](Self::fail).
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Clock stamping every timestamp the store writes.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Shorthand for `clock().now()`.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// `<root>/<bucket>`.
    pub fn bucket_dir(&self, bucket: Bucket) -> PathBuf {
        self.root.join(bucket.dir_name())
    }

    /// `<root>/tasks`, the default home of task records.
    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join(TASKS_DIR)
    }

    /// `<root>/quarantine`, unless the watcher config points elsewhere.
    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join(QUARANTINE_DIR)
    }

    fn path_of(&self, bucket: Bucket, id: &str) -> PathBuf {
        self.bucket_dir(bucket).join(id)
    }

    /// Durably append `envelope` to `pending`.
    pub fn enqueue(&self, mut envelope: Envelope) -> Result<EnvelopeId, StoreError> {
        let id = envelope.id.clone();
        if Bucket::ALL
            .iter()
            .any(|b| self.path_of(*b, id.as_str()).exists())
        {
            return Err(StoreError::DuplicateId(id.to_string()));
        }

        envelope.status = EnvelopeStatus::Pending;
        let target = self.path_of(Bucket::Pending, id.as_str());
        let bytes = encode(&target, &envelope)?;
        if !fsio::create_exclusive(&target, &bytes).map_err(|e| StoreError::io(&target, e))? {
            return Err(StoreError::DuplicateId(id.to_string()));
        }

        self.record(
            AuditEntry::new(self.now(), AuditKind::Enqueue, id.as_str())
                .with_detail(envelope.command_name()),
        );
        info!(
            id = %id,
            command = envelope.command_name(),
            priority = ?envelope.priority,
            from = %envelope.from,
            to = %envelope.to,
            "enqueued"
        );
        Ok(id)
    }

    /// Move the next envelope in dispatch order into `processing`.
    ///
    /// Requires the Lock Token. Records that cannot be decoded are moved to
    /// `failed` as they are and audited as rejected.
    pub fn claim_next(&self, guard: &LockGuard) -> Result<Option<Envelope>, StoreError> {
        let pending_dir = self.bucket_dir(Bucket::Pending);
        let files = fsio::visible_files(&pending_dir).map_err(|e| StoreError::io(&pending_dir, e))?;

        let mut candidates = Vec::with_capacity(files.len());
        for path in files {
            match read_envelope(&path) {
                Ok(Some(env)) if file_name(&path) == env.id.as_str() => candidates.push(env),
                Ok(Some(env)) => {
                    let reason = format!("record id {} does not match its file name", env.id);
                    self.park_unreadable(Bucket::Pending, &path, &reason)?;
                }
                Ok(None) => {}
                Err(e @ StoreError::Codec { .. }) => {
                    self.park_unreadable(Bucket::Pending, &path, &e.to_string())?;
                }
                Err(e) => return Err(e),
            }
        }
        candidates.sort_by(|a, b| a.dispatch_key().cmp(&b.dispatch_key()));

        let now = self.now();
        for mut env in candidates {
            let from = self.path_of(Bucket::Pending, env.id.as_str());
            let to = self.path_of(Bucket::Processing, env.id.as_str());
            match fs::rename(&from, &to) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(id = %env.id, "claim lost a race, trying next");
                    continue;
                }
                Err(e) => return Err(StoreError::io(&from, e)),
            }
            env.start_processing(now);
            write_record(&to, &env)?;

            self.record(
                AuditEntry::new(now, AuditKind::Claim, env.id.as_str())
                    .with_detail(env.command_name())
                    .with_holder(guard.holder()),
            );
            info!(id = %env.id, command = env.command_name(), holder = %guard.holder(), "claimed");
            return Ok(Some(env));
        }
        Ok(None)
    }

    /// `processing` to `completed`.
    pub fn complete(&self, id: &EnvelopeId) -> Result<Envelope, StoreError> {
        let now = self.now();
        let env = self.transition(id, Bucket::Processing, |env| {
            env.mark_completed(now);
            Bucket::Completed
        })?;
        self.record(AuditEntry::new(now, AuditKind::Complete, id.as_str()));
        info!(id = %id, "completed");
        Ok(env)
    }

    /// Count a failure; re-queue while retries remain, else park in `failed`.
    pub fn fail(&self, id: &EnvelopeId, error: &str) -> Result<FailOutcome, StoreError> {
        let now = self.now();
        let retry = self.retry;
        let env = self.transition(id, Bucket::Processing, |env| {
            env.record_failure(error);
            match retry.decide(env.retries, env.max_retries) {
                RetryDecision::Requeue => {
                    env.requeue(now);
                    Bucket::Pending
                }
                RetryDecision::GiveUp => {
                    env.mark_failed(error);
                    Bucket::Failed
                }
            }
        })?;

        let outcome = if env.status == EnvelopeStatus::Pending {
            self.record(
                AuditEntry::new(now, AuditKind::Retry, id.as_str())
                    .with_detail(format!("attempt {}/{}: {error}", env.retries, env.max_retries)),
            );
            warn!(id = %id, retries = env.retries, max_retries = env.max_retries, error, "re-queued");
            FailOutcome::Requeued(env)
        } else {
            self.record(AuditEntry::new(now, AuditKind::Fail, id.as_str()).with_detail(error));
            warn!(id = %id, retries = env.retries, error, "retries exhausted, moved to failed");
            FailOutcome::Failed(env)
        };
        Ok(outcome)
    }

    /// Validation failure: straight from `processing` to `failed`, no retry.
    pub fn reject(&self, id: &EnvelopeId, error: &str) -> Result<Envelope, StoreError> {
        let now = self.now();
        let env = self.transition(id, Bucket::Processing, |env| {
            env.mark_failed(error);
            Bucket::Failed
        })?;
        self.record(AuditEntry::new(now, AuditKind::Reject, id.as_str()).with_detail(error));
        warn!(id = %id, error, "rejected");
        Ok(env)
    }

    /// Recipient confirmation of a completed envelope.
    pub fn acknowledge(&self, id: &EnvelopeId) -> Result<Envelope, StoreError> {
        let path = self.path_of(Bucket::Completed, id.as_str());
        let mut env = read_envelope(&path)?.ok_or_else(|| StoreError::NotFound {
            id: id.to_string(),
            bucket: Bucket::Completed,
        })?;
        env.mark_acknowledged();
        write_record(&path, &env)?;
        self.record(AuditEntry::new(self.now(), AuditKind::Acknowledge, id.as_str()));
        Ok(env)
    }

    /// Fail every envelope left in `processing` by a crashed holder.
    ///
    /// Only safe while the crashed holder's Lock Token still blocks claims.
    pub fn recover_orphans(&self, reason: &str) -> Result<Vec<FailOutcome>, StoreError> {
        let dir = self.bucket_dir(Bucket::Processing);
        let mut outcomes = Vec::new();
        for path in fsio::visible_files(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let env = match read_envelope(&path) {
                Ok(Some(env)) if file_name(&path) == env.id.as_str() => env,
                Ok(Some(_)) | Err(StoreError::Codec { .. }) => {
                    self.park_unreadable(Bucket::Processing, &path, "unreadable orphan")?;
                    continue;
                }
                Ok(None) => continue,
                Err(e) => return Err(e),
            };
            self.record(
                AuditEntry::new(self.now(), AuditKind::Reclaim, env.id.as_str()).with_detail(reason),
            );
            outcomes.push(self.fail(&env.id, reason)?);
        }
        Ok(outcomes)
    }

    /// Read-only view of a bucket: dispatch order for `pending`, id order
    /// elsewhere. Undecodable records are skipped.
    pub fn list(&self, bucket: Bucket) -> Result<Vec<Envelope>, StoreError> {
        let dir = self.bucket_dir(bucket);
        let mut envelopes = Vec::new();
        for path in fsio::visible_files(&dir).map_err(|e| StoreError::io(&dir, e))? {
            match read_envelope(&path) {
                Ok(Some(env)) => envelopes.push(env),
                Ok(None) => {}
                Err(e @ StoreError::Codec { .. }) => {
                    warn!(bucket = %bucket, error = %e, "skipping unreadable record");
                }
                Err(e) => return Err(e),
            }
        }
        if bucket == Bucket::Pending {
            envelopes.sort_by(|a, b| a.dispatch_key().cmp(&b.dispatch_key()));
        } else {
            envelopes.sort_by(|a, b| a.id.cmp(&b.id));
        }
        Ok(envelopes)
    }

    /// Locate an envelope by id in any bucket.
    pub fn get(&self, id: &EnvelopeId) -> Result<Option<(Bucket, Envelope)>, StoreError> {
        for bucket in Bucket::ALL {
            if let Some(env) = read_envelope(&self.path_of(bucket, id.as_str()))? {
                return Ok(Some((bucket, env)));
            }
        }
        Ok(None)
    }

    /// Count envelope files per bucket.
    pub fn counts(&self) -> Result<StoreCounts, StoreError> {
        let count = |bucket: Bucket| {
            let dir = self.bucket_dir(bucket);
            fsio::visible_files(&dir)
                .map(|files| files.len())
                .map_err(|e| StoreError::io(&dir, e))
        };
        Ok(StoreCounts {
            pending: count(Bucket::Pending)?,
            processing: count(Bucket::Processing)?,
            completed: count(Bucket::Completed)?,
            failed: count(Bucket::Failed)?,
        })
    }

    /// Append an audit entry. A failed append is logged, never raised: the
    /// bucket move it describes has already happened.
    pub(crate) fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.append(&entry) {
            error!(id = %entry.id, event = ?entry.event, error = %e, "audit append failed");
        }
    }

    fn transition<F>(&self, id: &EnvelopeId, from: Bucket, mutate: F) -> Result<Envelope, StoreError>
    where
        F: FnOnce(&mut Envelope) -> Bucket,
    {
        let not_found = || StoreError::NotFound {
            id: id.to_string(),
            bucket: from,
        };
        let src = self.path_of(from, id.as_str());
        let mut env = read_envelope(&src)?.ok_or_else(not_found)?;
        let to = mutate(&mut env);
        write_record(&src, &env)?;

        let dst = self.path_of(to, id.as_str());
        match fs::rename(&src, &dst) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(StoreError::io(&src, e)),
        }
        fsio::sync_dir(&self.bucket_dir(to));
        Ok(env)
    }

    fn park_unreadable(&self, from: Bucket, path: &Path, reason: &str) -> Result<(), StoreError> {
        let name = file_name(path);
        let dst = self.path_of(Bucket::Failed, &name);
        match fs::rename(path, &dst) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(path, e)),
        }
        self.record(
            AuditEntry::new(self.now(), AuditKind::Reject, name.as_str())
                .with_detail(format!("unreadable record in {from}: {reason}")),
        );
        warn!(file = %name, bucket = %from, reason, "moved unreadable record to failed");
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn encode(path: &Path, envelope: &Envelope) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(envelope).map_err(|source| StoreError::Codec {
        path: path.to_path_buf(),
        source,
    })
}

fn write_record(path: &Path, envelope: &Envelope) -> Result<(), StoreError> {
    let bytes = encode(path, envelope)?;
    fsio::write_atomic(path, &bytes).map_err(|e| StoreError::io(path, e))
}

/// `Ok(None)` when the file does not exist (moved by someone else).
fn read_envelope(path: &Path) -> Result<Option<Envelope>, StoreError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| StoreError::Codec {
            path: path.to_path_buf(),
            source,
        })
}
