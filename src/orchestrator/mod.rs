pub mod artifacts;
pub mod executor;

pub use artifacts::AttemptArtifacts;
pub use executor::{Agents, Executor, ExecutorSettings, RunOutcome};
