//! App - the running pieces built on top of the store, router and FSM.
//!
//! - **Dispatcher**: lock, claim, route, record
//! - **InboxWatcher**: inbox files into `pending`
//! - **EnvelopeNotifier**: task transitions into observer envelopes
//! - **AppBuilder**: wiring with fail-fast validation

pub mod builder;
pub mod dispatcher;
pub mod notify;
pub mod service;
pub mod status;
pub mod watcher;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::dispatcher::{DispatchReport, Dispatcher, Disposition, Tick};
pub use self::notify::EnvelopeNotifier;
pub use self::service::ServiceGroup;
pub use self::status::{StatusError, StatusReport};
pub use self::watcher::{InboxDocument, InboxWatcher, Ingest, WatchReport};
