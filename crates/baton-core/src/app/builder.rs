//! AppBuilder - wiring and fail-fast validation.
//!
//! # Example
//! ```ignore
//! let app = AppBuilder::new(config)
//!     .with_actuator(Arc::new(MyActuator::connect()?))
//!     .register_typed::<Click, _>(ClickHandler)?
//!     .expect_commands(&["click", "actuate"])
//!     .build()?;
//! let services = app.spawn();
//! ```
//!
//! `build()` checks the config, that every expected command has a handler
//! and that an actuator was supplied, then opens the store.

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;

use super::dispatcher::Dispatcher;
use super::notify::EnvelopeNotifier;
use super::service::ServiceGroup;
use super::status::{StatusError, StatusReport};
use super::watcher::InboxWatcher;
use crate::config::{BatonConfig, ConfigError};
use crate::domain::Envelope;
use crate::error::{RouterError, StoreError};
use crate::fsm::TaskEngine;
use crate::impls::FileTaskStore;
use crate::ports::{Actuator, Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::queue::{DurableStore, RetryPolicy};
use crate::router::{Command, CommandHandler, CommandRouter, TypedHandler};

/// Why [`AppBuilder::build`] refused to wire the app.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing commands: {0:?}. These commands were expected but not registered.")]
    MissingCommands(Vec<String>),

    #[error("no actuator configured")]
    MissingActuator,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Collects handlers, the actuator and optional overrides; [`build`](Self::build)
/// validates everything before touching the disk.
pub struct AppBuilder {
    config: BatonConfig,
    router: CommandRouter,
    actuator: Option<Arc<dyn Actuator>>,
    clock: Arc<dyn Clock>,
    task_store: Option<Arc<dyn TaskStore>>,
    expected_commands: Option<Vec<String>>,
}

impl AppBuilder {
    /// Starts with the built-in commands registered.
    pub fn new(config: BatonConfig) -> Self {
        Self {
            config,
            router: CommandRouter::with_builtins(),
            actuator: None,
            clock: Arc::new(SystemClock),
            task_store: None,
            expected_commands: None,
        }
    }

    pub fn register<H>(mut self, name: &str, handler: H) -> Result<Self, RouterError>
    where
        H: CommandHandler + 'static,
    {
        self.router.register(name, handler)?;
        Ok(self)
    }

    pub fn register_typed<C, H>(mut self, handler: H) -> Result<Self, RouterError>
    where
        C: Command,
        H: TypedHandler<C> + 'static,
    {
        self.router.register_typed::<C, H>(handler)?;
        Ok(self)
    }

    /// Override a command, built-ins included.
    pub fn replace<H>(mut self, name: &str, handler: H) -> Self
    where
        H: CommandHandler + 'static,
    {
        self.router.replace(name, handler);
        self
    }

    pub fn with_actuator(mut self, actuator: Arc<dyn Actuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to a `FileTaskStore` under `<store.root>/tasks`.
    pub fn with_task_store(mut self, task_store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(task_store);
        self
    }

    pub fn expect_commands(mut self, commands: &[&str]) -> Self {
        self.expected_commands = Some(commands.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Validate and wire. Nothing is created on disk unless every check passes.
    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_commands {
            let missing: Vec<String> = expected
                .iter()
                .filter(|c| !self.router.contains(c))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingCommands(missing));
            }
        }
        let actuator = self.actuator.ok_or(BuildError::MissingActuator)?;

        let store_config = &self.config.store;
        let store = Arc::new(
            DurableStore::open(&store_config.root, self.clock.clone())?
                .with_retry_policy(RetryPolicy::new(store_config.default_max_retries))
                .with_stale_after(Duration::seconds(
                    i64::try_from(store_config.stale_lock_secs).unwrap_or(i64::MAX),
                )),
        );
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(self.clock.clone()));

        let task_store: Arc<dyn TaskStore> = match self.task_store {
            Some(task_store) => task_store,
            None => Arc::new(FileTaskStore::open(store.tasks_dir())?),
        };
        let mut engine = TaskEngine::new(
            task_store,
            self.clock.clone(),
            store_config.default_max_retries,
        );
        if let Some(observer) = &self.config.dispatcher.observer {
            engine = engine.with_observer(Arc::new(EnvelopeNotifier::new(
                store.clone(),
                ids.clone(),
                self.config.dispatcher.sender.clone(),
                observer.clone(),
            )));
        }
        let engine = Arc::new(engine);
        let router = Arc::new(self.router);

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            router.clone(),
            engine.clone(),
            actuator,
            ids.holder_id(),
            self.config.dispatcher.clone(),
        ));
        let watcher = self.config.watcher.enabled.then(|| {
            Arc::new(InboxWatcher::new(
                store.clone(),
                ids.clone(),
                self.config.watcher.clone(),
            ))
        });

        Ok(App {
            config: self.config,
            store,
            router,
            engine,
            dispatcher,
            watcher,
            ids,
        })
    }
}

/// A wired application. Fields are public so embedders can reach each part;
/// [`spawn`](Self::spawn) starts the background loops.
pub struct App {
    pub config: BatonConfig,
    pub store: Arc<DurableStore>,
    pub router: Arc<CommandRouter>,
    pub engine: Arc<TaskEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub watcher: Option<Arc<InboxWatcher>>,
    pub ids: Arc<dyn IdGenerator>,
}

impl App {
    /// A fresh envelope with a generated id and the configured retry bound.
    pub fn envelope(&self, from: &str, to: &str, tag: &str, body: Value) -> Envelope {
        Envelope::new(self.ids.envelope_id(), from, to, tag, body, self.store.now())
            .with_max_retries(self.config.store.default_max_retries)
    }

    /// Snapshot of queue counts, lock holder and task states.
    pub fn status(&self) -> Result<StatusReport, StatusError> {
        StatusReport::collect(&self.store, &self.engine)
    }

    /// Start the dispatcher and, when enabled, the inbox watcher.
    pub fn spawn(&self) -> ServiceGroup {
        ServiceGroup::spawn(self.dispatcher.clone(), self.watcher.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::RecordingActuator;
    use crate::router::builtin::Ping;

    fn config(dir: &std::path::Path) -> BatonConfig {
        let mut config = BatonConfig::default();
        config.store.root = dir.join("store");
        config.watcher.inbox_root = dir.join("inbox");
        config
    }

    #[test]
    fn build_success() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppBuilder::new(config(dir.path()))
            .with_actuator(Arc::new(RecordingActuator::new()))
            .expect_commands(&["ping", "actuate"])
            .build()
            .unwrap();
        assert!(app.watcher.is_some());
        assert!(dir.path().join("store/pending").is_dir());
        assert_eq!(app.status().unwrap().counts.pending, 0);
    }

    #[test]
    fn build_missing_commands() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppBuilder::new(config(dir.path()))
            .with_actuator(Arc::new(RecordingActuator::new()))
            .expect_commands(&["ping", "screenshot"])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingCommands(missing)) if missing == vec!["screenshot".to_string()]
        ));
    }

    #[test]
    fn build_requires_an_actuator() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppBuilder::new(config(dir.path())).build();
        assert!(matches!(app, Err(BuildError::MissingActuator)));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let builder = AppBuilder::new(config(dir.path()));
        assert!(matches!(
            builder.register("ping", Ping),
            Err(RouterError::DuplicateHandler(_))
        ));
    }

    #[test]
    fn invalid_config_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.store.stale_lock_secs = 0;
        let app = AppBuilder::new(config)
            .with_actuator(Arc::new(RecordingActuator::new()))
            .build();
        assert!(matches!(app, Err(BuildError::Config(_))));
        assert!(!dir.path().join("store").exists());
    }
}
