//! Scenario authoring

mod builder;

pub use builder::ScenarioBuilder;
