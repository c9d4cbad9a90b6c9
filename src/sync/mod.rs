//! Cooperative synchronization primitives.
//!
//! These are the only places a pump, pipe or stream adapter suspends other
//! than its own I/O. Every waiter is registered at the moment `wait` is
//! called, not when the returned future is first polled, so a caller can
//! check shared state and register under the same lock without losing a
//! wake-up.

mod condition;
mod gate;
mod mutex;

pub use condition::{Condition, Waiter};
pub use gate::Gate;
pub use mutex::Mutex;
