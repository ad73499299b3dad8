//! Event system connecting the launcher core to its consumers.
//!
//! The bus is the only channel between the core and the presentation
//! layer: every worker event is republished here by the orchestrator,
//! and subscribers never talk to the workers directly.

mod event_bus;

pub use event_bus::{CoreEvent, EventBus, EventEnvelope};
