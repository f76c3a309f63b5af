//! Append-only audit log (`queue.log`, one JSON object per line).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::HolderId;
use crate::error::StoreError;

/// Event names written to `queue.log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Enqueue,
    Claim,
    Complete,
    Retry,
    Fail,
    Reject,
    Acknowledge,
    Reclaim,
    Quarantine,
}

/// One `queue.log` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub event: AuditKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<HolderId>,
}

impl AuditEntry {
    pub fn new(at: DateTime<Utc>, event: AuditKind, id: impl Into<String>) -> Self {
        Self {
            at,
            event,
            id: id.into(),
            detail: None,
            holder: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_holder(mut self, holder: &HolderId) -> Self {
        self.holder = Some(holder.clone());
        self
    }
}

/// Append-only JSON-lines file. Each entry is a single `write` on an
/// `O_APPEND` handle, so concurrent writers never interleave within a line.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One `write_all` on an `O_APPEND` handle per entry, so concurrent
    /// writers never interleave inside a line.
    pub fn append(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry).map_err(|source| StoreError::Codec {
            path: self.path.clone(),
            source,
        })?;
        line.push(b'\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&line))
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Every parseable entry in file order. Torn or foreign lines are skipped.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("queue.log"));
        assert!(log.read_all().unwrap().is_empty());

        let now = Utc::now();
        log.append(&AuditEntry::new(now, AuditKind::Enqueue, "t1")).unwrap();
        log.append(&AuditEntry::new(now, AuditKind::Fail, "t1").with_detail("boom"))
            .unwrap();

        let raw = fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first["event"], "enqueue");
        assert!(first.get("holder").is_none());

        let entries = log.read_all().unwrap();
        assert_eq!(entries[1].event, AuditKind::Fail);
        assert_eq!(entries[1].detail.as_deref(), Some("boom"));
    }
}
