//! Domain model (ids, envelopes, tasks, events, handler results).

pub mod envelope;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod task;

pub use envelope::{DEFAULT_MAX_RETRIES, Envelope, EnvelopeStatus, Payload, Priority};
pub use events::TaskEvent;
pub use ids::{EnvelopeId, HolderId, IdError, TaskId};
pub use outcome::CommandResult;
pub use task::{Task, TaskSpec, TaskState, TransitionRecord};
