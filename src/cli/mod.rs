//! CLI-specific functionality for slotrunner
//!
//! This module contains argument parsing, batch file loading and
//! configuration discovery.

pub mod args;
pub mod config;
pub mod tasks;

pub use args::{Args, CliMode, RunConfig, ScheduleConfig};
pub use config::ConfigDiscovery;
pub use tasks::{BatchFile, BatchLoader, FileError};
