//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./slotrunner.toml or ./.slotrunner/config.toml
//! 2. User config: ~/.slotrunner/config.toml
//! 3. System config: /etc/slotrunner/config.toml
//! 4. Built-in defaults
//!
//! `SLOTRUNNER_*` environment variables are applied on top of whichever
//! source wins.

use crate::{EngineConfig, env};
use anyhow::{Context, Result, anyhow};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load the explicit file when given, otherwise walk the hierarchy.
    pub fn load(config_override: Option<&Path>) -> Result<EngineConfig> {
        let mut config = match config_override {
            Some(path) => {
                info!("Loading configuration override from: {:?}", path);
                EngineConfig::from_toml_file(path)
                    .with_context(|| format!("failed to load configuration from {:?}", path))?
            }
            None => Self::discover_config()?,
        };

        config
            .apply_env_overrides()
            .context("invalid environment override")?;
        config.validate().context("configuration rejected")?;
        Ok(config)
    }

    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> Result<EngineConfig> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return EngineConfig::from_toml_file(&config_path)
                .with_context(|| format!("failed to load configuration from {:?}", config_path));
        }

        info!("No configuration file found, using defaults");
        Ok(EngineConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        Self::get_config_candidates().into_iter().find(|candidate| {
            debug!("Checking for config file: {:?}", candidate);
            candidate.is_file()
        })
    }

    /// Configuration file candidates in priority order
    pub fn get_config_candidates() -> Vec<PathBuf> {
        let current_dir = std_env::current_dir().ok();
        Self::candidates_for(current_dir.as_deref(), Self::get_home_dir().as_deref())
    }

    fn candidates_for(current_dir: Option<&Path>, home_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Some(current_dir) = current_dir {
            candidates.push(env::local_config_file_path(current_dir));
            candidates.push(env::local_app_config_file_path(current_dir));
        }
        if let Some(home_dir) = home_dir {
            candidates.push(env::user_config_file_path(home_dir));
        }
        #[cfg(unix)]
        candidates.push(env::system_config_file_path());

        candidates
    }

    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Create a default config file in the user's home directory
    pub fn create_default_user_config() -> Result<PathBuf> {
        let home_dir =
            Self::get_home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;

        let config_dir = env::user_config_dir_path(&home_dir);
        let config_path = env::user_config_file_path(&home_dir);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("failed to create {:?}", config_dir))?;
            info!("Created configuration directory: {:?}", config_dir);
        }

        if !config_path.exists() {
            EngineConfig::default().to_toml_file(&config_path)?;
            info!("Created default configuration file: {:?}", config_path);
        } else {
            warn!("Configuration file already exists: {:?}", config_path);
        }

        Ok(config_path)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::get_config_candidates().iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };
            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }

        let overrides: Vec<&str> = env::vars::ALL
            .iter()
            .copied()
            .filter(|name| std_env::var(name).is_ok())
            .collect();
        if !overrides.is_empty() {
            println!("Environment overrides: {}", overrides.join(", "));
        }
    }
}
