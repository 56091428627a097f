pub mod backend;
pub mod simulated;
pub mod types;


pub use backend::{
    AutomationBackend, AutomationSession, DEFAULT_RELEASE_TIMEOUT, LeasedSubContext, SubContext,
};
pub use simulated::{ItemScript, SimulatedBackend, SimulationScript};
pub use types::*;
