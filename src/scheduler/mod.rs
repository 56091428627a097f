pub mod adaptive;
pub mod clock;
pub mod supervisor;
pub mod window;

#[cfg(test)]
mod tests;

pub use adaptive::{AdaptiveScheduler, ScheduleOutcome, SchedulerConfig, WindowStatus};
pub use clock::{AnchoredClock, Clock, SystemClock};
pub use supervisor::{JobHandle, JobId, JobInfo, JobSupervisor};
pub use window::{ScheduleWindow, WindowParseError, default_windows, parse_windows};
