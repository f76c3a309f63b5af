//! Impls - port implementations.
//!
//! - **FileTaskStore**: task records next to the envelope buckets
//! - **InMemoryTaskStore**: tests and embedding
//! - **LoggingActuator** / **RecordingActuator**: stand-ins for a real
//!   UI-automation actuator

pub mod actuator;
pub mod fs_task_store;
pub mod inmem_task_store;

pub use self::actuator::{LoggingActuator, RecordingActuator};
pub use self::fs_task_store::FileTaskStore;
pub use self::inmem_task_store::InMemoryTaskStore;
