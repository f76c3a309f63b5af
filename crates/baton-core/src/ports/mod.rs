//! Ports - seams to everything the core does not own.

pub mod actuator;
pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::actuator::{Actuator, ActuatorError};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::TaskStore;
