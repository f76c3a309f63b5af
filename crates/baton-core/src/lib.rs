//! baton-core
//!
//! Coordination core that lets several workers share one exclusive actuator.
//!
//! # Modules
//! - **domain**: envelopes, tasks, ids, FSM events, handler results
//! - **ports**: seams to the outside (Clock, IdGenerator, Actuator, TaskStore)
//! - **queue**: the durable directory-backed store, Lock Token and audit log
//! - **router**: command name → handler registry, typed commands, built-ins
//! - **fsm**: task state machine (pure transitions + persisting engine)
//! - **app**: dispatcher loop, inbox watcher, observer notifier, wiring
//! - **impls**: in-tree port implementations (task stores, actuators)
//! - **config**: YAML configuration

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod fsm;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod router;

pub use app::{App, AppBuilder, Dispatcher, InboxWatcher, ServiceGroup};
pub use config::BatonConfig;
pub use domain::{CommandResult, Envelope, EnvelopeId, Priority, Task, TaskEvent, TaskId, TaskState};
pub use error::{ErrorKind, StoreError};
pub use fsm::TaskEngine;
pub use queue::{Bucket, DurableStore};
pub use router::CommandRouter;
