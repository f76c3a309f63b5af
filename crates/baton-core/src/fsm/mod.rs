//! Task FSM: guarded lifecycle of every task envelopes advance.

pub mod engine;
pub mod guards;
pub mod machine;

pub use self::engine::{TaskEngine, TransitionObserver, TransitionOutcome};
pub use self::guards::Guard;
pub use self::machine::{Effect, Rejection};
