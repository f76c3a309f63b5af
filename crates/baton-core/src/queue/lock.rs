//! Lock Token: the single file that says "the actuator is owned".
//!
//! The token is created with create-if-absent semantics, so exactly one
//! caller wins. A [`LockGuard`] represents ownership; dropping it releases
//! the token. A token older than the staleness window belongs to a crashed
//! holder and may be reclaimed, see [`FileLock::reclaim`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::fsio;
use crate::domain::HolderId;
use crate::error::{LockError, StoreError};

const LOCK_FILE: &str = "lock";
const RECLAIM_FILE: &str = "lock.reclaim";

/// Content of the `lock` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub holder: HolderId,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockToken {
    pub fn new(holder: HolderId, acquired_at: DateTime<Utc>) -> Self {
        Self {
            holder,
            pid: process::id(),
            acquired_at,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.acquired_at > window
    }
}

/// Result of [`FileLock::try_acquire`].
#[derive(Debug)]
pub enum Acquire {
    Acquired(LockGuard),
    /// Somebody else holds the token.
    Held(LockToken),
}

/// Result of [`FileLock::reclaim`].
#[derive(Debug, PartialEq, Eq)]
pub enum Reclaim<T> {
    /// The stale token was removed after `recover` ran.
    Reclaimed(T),
    /// Another reclaimer is at work, or the token changed under us.
    Contended,
    /// The observed token is not stale.
    Fresh,
}

/// The Lock Token: a file created with create-if-absent semantics.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    reclaim_path: PathBuf,
    stale_after: Duration,
}

impl FileLock {
    pub fn new(root: &Path, stale_after: Duration) -> Self {
        Self {
            path: root.join(LOCK_FILE),
            reclaim_path: root.join(RECLAIM_FILE),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Create the token for `holder`, or report who holds it. Never waits.
    pub fn try_acquire(&self, holder: &HolderId, now: DateTime<Utc>) -> Result<Acquire, LockError> {
        let token = LockToken::new(holder.clone(), now);
        let bytes = encode(&self.path, &token)?;

        // The holder may release between our failed create and our read.
        for _ in 0..3 {
            if fsio::create_exclusive(&self.path, &bytes)
                .map_err(|e| LockError::io(&self.path, e))?
            {
                return Ok(Acquire::Acquired(LockGuard {
                    path: self.path.clone(),
                    token,
                    released: false,
                }));
            }
            if let Some(current) = self.current()? {
                return Ok(Acquire::Held(current));
            }
        }
        Err(LockError::io(
            &self.path,
            io::Error::other("lock token appeared and vanished repeatedly"),
        ))
    }

    /// The token on disk, if any.
    ///
    /// A token that cannot be decoded is reported with an `unreadable` holder
    /// and the file's modification time, so it still ages out.
    pub fn current(&self) -> Result<Option<LockToken>, LockError> {
        read_token(&self.path)
    }

    pub fn is_stale(&self, token: &LockToken, now: DateTime<Utc>) -> bool {
        token.is_stale(now, self.stale_after)
    }

    /// Remove a stale token left by a crashed holder.
    ///
    /// Reclaimers serialize on a `lock.reclaim` marker. The winner re-reads
    /// the token and gives up unless it is still `observed`. `recover` runs
    /// while the stale token still blocks every claim, and the token is
    /// removed only after it succeeds.
    pub fn reclaim<T, F>(
        &self,
        observed: &LockToken,
        now: DateTime<Utc>,
        recover: F,
    ) -> Result<Reclaim<T>, LockError>
    where
        F: FnOnce() -> Result<T, StoreError>,
    {
        if !self.is_stale(observed, now) {
            return Ok(Reclaim::Fresh);
        }

        let marker = LockToken {
            holder: observed.holder.clone(),
            pid: process::id(),
            acquired_at: now,
        };
        let bytes = encode(&self.reclaim_path, &marker)?;
        if !fsio::create_exclusive(&self.reclaim_path, &bytes)
            .map_err(|e| LockError::io(&self.reclaim_path, e))?
        {
            self.clear_abandoned_marker(now)?;
            return Ok(Reclaim::Contended);
        }
        let _marker = MarkerGuard {
            path: &self.reclaim_path,
        };

        match self.current()? {
            Some(current) if current == *observed => {}
            Some(current) if !self.is_stale(&current, now) => return Ok(Reclaim::Fresh),
            _ => return Ok(Reclaim::Contended),
        }

        let recovered = recover()?;
        remove_if_present(&self.path)?;
        Ok(Reclaim::Reclaimed(recovered))
    }

    /// A reclaimer that crashed mid-way leaves its marker behind; once the
    /// marker itself is stale it is removed so the next attempt can proceed.
    fn clear_abandoned_marker(&self, now: DateTime<Utc>) -> Result<(), LockError> {
        if let Some(marker) = read_token(&self.reclaim_path)?
            && marker.is_stale(now, self.stale_after)
        {
            warn!(
                path = %self.reclaim_path.display(),
                since = %marker.acquired_at,
                "removing abandoned reclaim marker"
            );
            remove_if_present(&self.reclaim_path)?;
        }
        Ok(())
    }
}

/// Ownership of the Lock Token. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: LockToken,
    released: bool,
}

impl LockGuard {
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn holder(&self) -> &HolderId {
        &self.token.holder
    }

    /// Release explicitly and observe the outcome.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        release_token(&self.path, &self.token)
    }

    /// Walk away without removing the token. It blocks every claim until it
    /// goes stale, and whoever reclaims it recovers `processing` first.
    pub fn abandon(mut self) {
        self.released = true;
        warn!(holder = %self.token.holder, "lock token abandoned until it goes stale");
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release_token(&self.path, &self.token) {
            warn!(holder = %self.token.holder, error = %e, "failed to release lock token");
        }
    }
}

/// Removes the reclaim marker on every exit path.
struct MarkerGuard<'a> {
    path: &'a Path,
}

impl Drop for MarkerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = remove_if_present(self.path) {
            warn!(error = %e, "failed to remove reclaim marker");
        }
    }
}

/// The token is only removed while it is still ours; after a reclamation it
/// may belong to someone else.
fn release_token(path: &Path, token: &LockToken) -> Result<(), LockError> {
    match read_token(path)? {
        Some(current) if current.holder == token.holder => remove_if_present(path),
        Some(current) => {
            warn!(
                holder = %token.holder,
                current = %current.holder,
                "lock token was taken over, leaving it in place"
            );
            Ok(())
        }
        None => Ok(()),
    }
}

fn read_token(path: &Path) -> Result<Option<LockToken>, LockError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LockError::io(path, e)),
    };
    if let Ok(token) = serde_json::from_slice::<LockToken>(&raw) {
        return Ok(Some(token));
    }
    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LockError::io(path, e)),
    };
    Ok(Some(LockToken {
        holder: HolderId::from_static("unreadable"),
        pid: 0,
        acquired_at: DateTime::<Utc>::from(modified),
    }))
}

fn remove_if_present(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LockError::io(path, e)),
    }
}

fn encode(path: &Path, token: &LockToken) -> Result<Vec<u8>, LockError> {
    serde_json::to_vec_pretty(token).map_err(|e| LockError::io(path, io::Error::other(e)))
}
