pub mod pool;
pub mod reaper;
pub mod types;

#[cfg(test)]
mod tests;

pub use pool::{SessionLease, SessionPool};
pub use reaper::SessionReaper;
pub use types::*;
