//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: Execute a batch file against the simulated backend
//! - `schedule`: Retry one work item under the adaptive scheduler
//! - `windows`: Show the current cadence and the next schedule window
//! - `show-config`: Show configuration discovery information
//! - `init-config`: Write the default configuration to the user config file

use crate::automation::PrincipalId;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum CliMode {
    Run(RunConfig),
    Schedule(ScheduleConfig),
    Windows,
    ShowConfig,
    InitConfig,
}

#[derive(Debug)]
pub struct RunConfig {
    pub batch_file: PathBuf,
    pub config_override: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug)]
pub struct ScheduleConfig {
    pub item: String,
    pub principal: PrincipalId,
    pub transient_failures: u32,
    pub config_override: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug, Parser)]
#[command(name = "slotrunner")]
#[command(author = "Slotrunner Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resilient orchestration of time-slot bookings over long-lived automation sessions")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute a batch file and print every progress event
    Run {
        /// Path to the batch TOML file
        file: PathBuf,
    },
    /// Retry one item until it succeeds, the attempt budget runs out or Ctrl-C
    Schedule {
        /// Label of the work item
        item: String,
        /// Principal owning the session
        #[arg(short = 'p', long = "principal", default_value_t = 1)]
        principal: PrincipalId,
        /// Simulated transient failures before the item succeeds
        #[arg(long = "transient-failures", default_value_t = 0)]
        transient_failures: u32,
    },
    /// Show the current cadence and minutes until the next window
    Windows,
    /// Show configuration discovery information and the effective config
    ShowConfig,
    /// Write the default configuration to ~/.slotrunner/config.toml
    InitConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<CliMode, String> {
        match &self.command {
            Some(Commands::Run { file }) => Ok(CliMode::Run(RunConfig {
                batch_file: file.clone(),
                config_override: self.config.clone(),
                verbose: self.verbose,
            })),
            Some(Commands::Schedule {
                item,
                principal,
                transient_failures,
            }) => {
                if item.trim().is_empty() {
                    return Err("Item label must not be empty".to_string());
                }
                Ok(CliMode::Schedule(ScheduleConfig {
                    item: item.clone(),
                    principal: *principal,
                    transient_failures: *transient_failures,
                    config_override: self.config.clone(),
                    verbose: self.verbose,
                }))
            }
            Some(Commands::Windows) => Ok(CliMode::Windows),
            Some(Commands::ShowConfig) => Ok(CliMode::ShowConfig),
            Some(Commands::InitConfig) => Ok(CliMode::InitConfig),
            None => Err(
                "No command specified. Use 'slotrunner --help' to see available commands."
                    .to_string(),
            ),
        }
    }
}
