//! Scenario automation
//!
//! Commands go in through an [`EngineHandle`], a single dispatcher validates
//! them, and each accepted run executes on its own task. Progress leaves as
//! [`udsim_core::AutomationEvent`]s on a broadcast channel.

mod assertion;
mod engine;
mod executor;
mod run;

pub use assertion::evaluate_all;
pub use engine::{AutomationEngine, CommandReply, EngineHandle};
