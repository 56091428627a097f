//! Environment constants and path utilities for slotrunner.
//!
//! Centralizes file names, directory names and environment variable names
//! used by configuration discovery and the binary.

use std::path::{Path, PathBuf};

/// Application directory name (hidden directory like .git)
pub const APP_DIR_NAME: &str = ".slotrunner";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Stand-alone configuration file name in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "slotrunner.toml";

/// System-wide configuration directory (Unix-like systems)
pub const SYSTEM_CONFIG_DIR: &str = "/etc/slotrunner";

/// Log filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "slotrunner=info";

/// Environment variables that override file configuration
pub mod vars {
    /// Comma-separated `HH:MM-HH:MM` windows
    pub const SCHEDULE_WINDOWS: &str = "SLOTRUNNER_SCHEDULE_WINDOWS";
    pub const SHORT_CADENCE_MINUTES: &str = "SLOTRUNNER_SHORT_CADENCE_MINUTES";
    pub const LONG_CADENCE_MINUTES: &str = "SLOTRUNNER_LONG_CADENCE_MINUTES";
    pub const MAX_TOTAL_ATTEMPTS: &str = "SLOTRUNNER_MAX_TOTAL_ATTEMPTS";
    /// `true`/`false`; disables scheduler retries when false
    pub const AUTO_RETRY: &str = "SLOTRUNNER_AUTO_RETRY";

    pub const ALL: [&str; 5] = [
        SCHEDULE_WINDOWS,
        SHORT_CADENCE_MINUTES,
        LONG_CADENCE_MINUTES,
        MAX_TOTAL_ATTEMPTS,
        AUTO_RETRY,
    ];
}

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(APP_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build the stand-alone config file path in a directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(LOCAL_CONFIG_FILE_NAME)
}

/// Build the hidden-directory config file path in a directory
pub fn local_app_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME)
}

pub fn system_config_file_path() -> PathBuf {
    Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME)
}
