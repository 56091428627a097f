pub mod events;
pub mod execution;
pub mod orchestrator;
pub mod types;

#[cfg(test)]
mod tests;

pub use events::*;
pub use orchestrator::TaskOrchestrator;
pub use types::*;
