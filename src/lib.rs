//! Tool launcher core.
//!
//! Discovers tool directories under a tools root, provisions their
//! runtime environments, and runs them as supervised subprocesses,
//! reporting progress through a sequenced broadcast event bus.
//!
//! The entry point is [`runtime::CoreService`]: a cloneable handle
//! whose methods enqueue work onto background workers and return
//! immediately. Subscribe to the bus before issuing commands to observe
//! the resulting events.

pub mod bus;
pub mod envprep;
pub mod manifest;
pub mod runtime;
pub mod scanner;
pub mod template;

mod runner;

#[cfg(test)]
mod testing;
