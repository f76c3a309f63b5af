//! Inbox Watcher: turns files dropped into `inbox/<recipient>/` into
//! pending envelopes.
//!
//! Bad input never reaches the caller. A file that does not parse, or that
//! carries an unusable id, is moved into quarantine and audited. A file that
//! could not be read is left where it is for the next poll.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::domain::{Envelope, EnvelopeId, Priority, TaskId};
use crate::error::{ErrorKind, StoreError};
use crate::ports::IdGenerator;
use crate::queue::fsio;
use crate::queue::{AuditEntry, AuditKind, DurableStore};

/// Shape of an inbox file. Only `from` and `tag` are required.
///
/// A serialized [`Envelope`] is accepted as is: the fields the store owns
/// (`status`, `retries`, the timestamps, `error`) are ignored and start
/// fresh on enqueue.
#[derive(Debug, Clone, Deserialize)]
pub struct InboxDocument {
    /// Without an id every ingest generates a new one. A file seen again
    /// after a crash between enqueue and removal is then delivered twice;
    /// with an id the second copy is quarantined as a duplicate.
    #[serde(default)]
    pub id: Option<String>,
    pub from: String,
    /// Defaults to the inbox's recipient.
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub body: serde_json::Value,
    pub tag: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Fate of one inbox file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    Enqueued(EnvelopeId),
    Quarantined(PathBuf),
    /// Left in the inbox; retried on the next poll.
    Deferred,
}

/// What one [`InboxWatcher::poll_once`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchReport {
    pub enqueued: Vec<EnvelopeId>,
    pub quarantined: Vec<PathBuf>,
    pub deferred: usize,
}

impl WatchReport {
    pub fn is_empty(&self) -> bool {
        self.enqueued.is_empty() && self.quarantined.is_empty() && self.deferred == 0
    }

    fn push(&mut self, ingest: Ingest) {
        match ingest {
            Ingest::Enqueued(id) => self.enqueued.push(id),
            Ingest::Quarantined(path) => self.quarantined.push(path),
            Ingest::Deferred => self.deferred += 1,
        }
    }
}

/// Polls `inbox_root/<recipient>/` and feeds the store.
pub struct InboxWatcher {
    store: Arc<DurableStore>,
    ids: Arc<dyn IdGenerator>,
    config: WatcherConfig,
    quarantine_root: PathBuf,
}

impl InboxWatcher {
    pub fn new(
        store: Arc<DurableStore>,
        ids: Arc<dyn IdGenerator>,
        config: WatcherConfig,
    ) -> Self {
        let quarantine_root = config
            .quarantine_dir
            .clone()
            .unwrap_or_else(|| store.quarantine_dir());
        Self {
            store,
            ids,
            config,
            quarantine_root,
        }
    }

    pub fn inbox_root(&self) -> &Path {
        &self.config.inbox_root
    }

    pub fn inbox_dir(&self, recipient: &str) -> PathBuf {
        self.config.inbox_root.join(recipient)
    }

    /// Configured recipients, or every subdirectory of the inbox root.
    pub fn recipients(&self) -> Result<Vec<String>, StoreError> {
        if !self.config.recipients.is_empty() {
            return Ok(self.config.recipients.clone());
        }
        let root = &self.config.inbox_root;
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(root, e)),
        };
        let mut recipients = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().map_err(|e| StoreError::io(entry.path(), e))?.is_dir() {
                recipients.push(name);
            }
        }
        recipients.sort();
        Ok(recipients)
    }

    /// One pass over every inbox.
    pub fn poll_once(&self) -> Result<WatchReport, StoreError> {
        let mut report = WatchReport::default();
        for recipient in self.recipients()? {
            let dir = self.inbox_dir(&recipient);
            let files = match fsio::visible_files(&dir) {
                Ok(files) => files,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(&dir, e)),
            };
            for path in files {
                report.push(self.ingest(&recipient, &path));
            }
        }
        if !report.is_empty() {
            info!(
                enqueued = report.enqueued.len(),
                quarantined = report.quarantined.len(),
                deferred = report.deferred,
                "inbox poll"
            );
        }
        Ok(report)
    }

    /// Poll every `poll_interval` until `shutdown` flips or its sender drops.
    /// Poll errors are logged and the loop carries on.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(root = %self.config.inbox_root.display(), "inbox watcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.poll_once() {
                error!(error = %e, "inbox poll failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("inbox watcher stopped");
    }

    /// Ingest a single inbox file.
    pub fn ingest(&self, recipient: &str, path: &Path) -> Ingest {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ingest::Deferred,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "cannot read inbox file");
                return Ingest::Deferred;
            }
        };

        let envelope = match serde_json::from_slice::<InboxDocument>(&raw)
            .map_err(|e| format!("unparseable envelope: {e}"))
            .and_then(|doc| self.to_envelope(recipient, doc))
        {
            Ok(envelope) => envelope,
            Err(reason) => return self.quarantine(recipient, path, &reason),
        };

        match self.store.enqueue(envelope) {
            Ok(id) => {
                self.dispose(recipient, path);
                debug!(id = %id, recipient, "ingested inbox file");
                Ingest::Enqueued(id)
            }
            Err(e) if e.kind() == ErrorKind::Validation => {
                self.quarantine(recipient, path, &e.to_string())
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "enqueue failed, will retry");
                Ingest::Deferred
            }
        }
    }

    fn to_envelope(&self, recipient: &str, doc: InboxDocument) -> Result<Envelope, String> {
        let id = match doc.id {
            Some(raw) => EnvelopeId::parse(raw).map_err(|e| e.to_string())?,
            None => self.ids.envelope_id(),
        };
        let task_id = doc
            .task_id
            .map(TaskId::parse)
            .transpose()
            .map_err(|e| e.to_string())?;

        let mut envelope = Envelope::new(
            id,
            doc.from,
            doc.to.unwrap_or_else(|| recipient.to_string()),
            doc.tag,
            doc.body,
            self.store.now(),
        )
        .with_priority(doc.priority.unwrap_or_default())
        .with_max_retries(
            doc.max_retries
                .unwrap_or(self.store.retry_policy().default_max_retries),
        );
        envelope.command = doc.command;
        envelope.task_id = task_id;
        Ok(envelope)
    }

    /// Remove an ingested file, or move it to the archive when configured.
    fn dispose(&self, recipient: &str, path: &Path) {
        let result = match &self.config.archive_dir {
            Some(archive) => move_aside(path, &archive.join(recipient)).map(|_| ()),
            None => fs::remove_file(path),
        };
        if let Err(e) = result {
            error!(file = %path.display(), error = %e, "ingested file could not be removed");
        }
    }

    fn quarantine(&self, recipient: &str, path: &Path, reason: &str) -> Ingest {
        let dir = self.quarantine_root.join(recipient);
        let moved = match move_aside(path, &dir) {
            Ok(moved) => moved,
            Err(e) => {
                error!(file = %path.display(), error = %e, "quarantine failed");
                return Ingest::Deferred;
            }
        };
        let name = moved
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.store.record(
            AuditEntry::new(self.store.now(), AuditKind::Quarantine, name)
                .with_detail(format!("{recipient}: {reason}")),
        );
        warn!(file = %path.display(), to = %moved.display(), reason, "quarantined inbox file");
        Ingest::Quarantined(moved)
    }
}

/// Move `path` into `dir`, suffixing the name on collision.
fn move_aside(path: &Path, dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let mut target = dir.join(&name);
    let mut n = 1;
    while target.exists() {
        target = dir.join(format!("{name}.{n}"));
        n += 1;
    }
    fs::rename(path, &target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EnvelopeStatus;
    use crate::ports::{SystemClock, UlidGenerator};
    use crate::queue::Bucket;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Arc<DurableStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::open(dir.path().join("store"), Arc::new(SystemClock)).unwrap());
        Fixture { dir, store }
    }

    impl Fixture {
        fn watcher(&self, tweak: impl FnOnce(&mut WatcherConfig)) -> InboxWatcher {
            let mut config = WatcherConfig {
                inbox_root: self.dir.path().join("inbox"),
                ..WatcherConfig::default()
            };
            tweak(&mut config);
            InboxWatcher::new(
                self.store.clone(),
                Arc::new(UlidGenerator::new(SystemClock)),
                config,
            )
        }

        fn drop_file(&self, recipient: &str, name: &str, content: &str) -> PathBuf {
            let dir = self.dir.path().join("inbox").join(recipient);
            fs::create_dir_all(&dir).unwrap();
            let path = dir.join(name);
            fs::write(&path, content).unwrap();
            path
        }
    }

    #[test]
    fn valid_file_is_enqueued_and_removed() {
        let f = fixture();
        let path = f.drop_file(
            "agent-2",
            "m1.json",
            r#"{"id": "t1", "from": "agent-1", "tag": "ping", "body": "hello", "priority": "high"}"#,
        );
        let report = f.watcher(|_| {}).poll_once().unwrap();
        assert_eq!(report.enqueued, vec![EnvelopeId::parse("t1").unwrap()]);
        assert!(!path.exists());

        let env = &f.store.list(Bucket::Pending).unwrap()[0];
        assert_eq!(env.to, "agent-2");
        assert_eq!(env.priority, Priority::High);
        assert_eq!(env.status, EnvelopeStatus::Pending);
        assert_eq!(env.max_retries, 3);
    }

    #[test]
    fn generated_id_when_absent() {
        let f = fixture();
        f.drop_file("agent-2", "m1.json", r#"{"from": "agent-1", "tag": "sync"}"#);
        let report = f.watcher(|_| {}).poll_once().unwrap();
        assert!(report.enqueued[0].as_str().starts_with("msg-"));
    }

    #[test]
    fn serialized_envelope_is_accepted() {
        let f = fixture();
        let mut env = Envelope::new(
            EnvelopeId::parse("e1").unwrap(),
            "agent-1",
            "agent-2",
            "ping",
            serde_json::json!({"k": 1}),
            chrono::Utc::now(),
        )
        .with_priority(Priority::High);
        env.status = EnvelopeStatus::Completed;
        env.retries = 2;
        env.error = Some("old failure".into());
        f.drop_file("agent-2", "e1.json", &serde_json::to_string_pretty(&env).unwrap());

        let report = f.watcher(|_| {}).poll_once().unwrap();
        assert_eq!(report.enqueued, vec![EnvelopeId::parse("e1").unwrap()]);
        assert!(report.quarantined.is_empty());

        let queued = &f.store.list(Bucket::Pending).unwrap()[0];
        assert_eq!(queued.status, EnvelopeStatus::Pending);
        assert_eq!(queued.retries, 0);
        assert_eq!(queued.error, None);
        assert_eq!(queued.priority, Priority::High);
        assert_eq!(queued.body, serde_json::json!({"k": 1}));
    }

    #[test]
    fn file_seen_twice_without_id_is_delivered_twice() {
        let f = fixture();
        let watcher = f.watcher(|_| {});
        let doc = r#"{"from": "agent-1", "tag": "sync"}"#;

        let path = f.drop_file("agent-2", "m1.json", doc);
        let first = watcher.ingest("agent-2", &path);
        let path = f.drop_file("agent-2", "m1.json", doc);
        let second = watcher.ingest("agent-2", &path);

        assert!(matches!((&first, &second), (Ingest::Enqueued(a), Ingest::Enqueued(b)) if a != b));
        assert_eq!(f.store.counts().unwrap().pending, 2);

        let with_id = r#"{"id": "once", "from": "agent-1", "tag": "sync"}"#;
        let path = f.drop_file("agent-2", "m2.json", with_id);
        assert!(matches!(watcher.ingest("agent-2", &path), Ingest::Enqueued(_)));
        let path = f.drop_file("agent-2", "m2.json", with_id);
        assert!(matches!(watcher.ingest("agent-2", &path), Ingest::Quarantined(_)));
    }

    #[test]
    fn garbage_is_quarantined_and_audited() {
        let f = fixture();
        let path = f.drop_file("agent-2", "bad.json", "{ not json");
        let report = f.watcher(|_| {}).poll_once().unwrap();

        assert!(report.enqueued.is_empty());
        assert!(!path.exists());
        let expected = f.store.quarantine_dir().join("agent-2").join("bad.json");
        assert_eq!(report.quarantined, vec![expected.clone()]);
        assert!(expected.exists());

        let entries = f.store.audit().read_all().unwrap();
        assert_eq!(entries.last().unwrap().event, AuditKind::Quarantine);
    }

    #[test]
    fn bad_and_duplicate_ids_are_quarantined() {
        let f = fixture();
        f.drop_file("agent-2", "a.json", r#"{"id": ".hidden", "from": "x", "tag": "ping"}"#);
        f.drop_file("agent-2", "b.json", r#"{"id": "t1", "from": "x", "tag": "ping"}"#);
        f.drop_file("agent-2", "c.json", r#"{"id": "t1", "from": "x", "tag": "ping"}"#);

        let report = f.watcher(|_| {}).poll_once().unwrap();
        assert_eq!(report.enqueued.len(), 1);
        assert_eq!(report.quarantined.len(), 2);
        assert_eq!(f.store.counts().unwrap().pending, 1);
    }

    #[test]
    fn quarantine_names_do_not_collide() {
        let f = fixture();
        let watcher = f.watcher(|_| {});
        f.drop_file("agent-2", "bad.json", "nope");
        watcher.poll_once().unwrap();
        f.drop_file("agent-2", "bad.json", "nope again");
        let report = watcher.poll_once().unwrap();
        assert_eq!(
            report.quarantined,
            vec![f.store.quarantine_dir().join("agent-2").join("bad.json.1")]
        );
    }

    #[test]
    fn archive_keeps_ingested_files() {
        let f = fixture();
        let archive = f.dir.path().join("archive");
        f.drop_file("agent-2", "m1.json", r#"{"from": "agent-1", "tag": "ping"}"#);
        f.watcher(|c| c.archive_dir = Some(archive.clone())).poll_once().unwrap();
        assert!(archive.join("agent-2").join("m1.json").exists());
    }

    #[test]
    fn only_configured_recipients_are_watched() {
        let f = fixture();
        f.drop_file("agent-1", "m.json", r#"{"from": "x", "tag": "ping"}"#);
        f.drop_file("agent-2", "m.json", r#"{"from": "x", "tag": "ping"}"#);
        let watcher = f.watcher(|c| c.recipients = vec!["agent-2".into(), "ghost".into()]);
        assert_eq!(watcher.poll_once().unwrap().enqueued.len(), 1);
    }

    #[test]
    fn missing_inbox_root_is_quiet() {
        let f = fixture();
        assert!(f.watcher(|_| {}).poll_once().unwrap().is_empty());
    }
}
