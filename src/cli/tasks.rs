//! Batch file loading
//!
//! A batch file is a TOML document naming the principal, the work items and
//! optional per-batch parameters:
//!
//! ```toml
//! principal = 42
//! steps = ["navigate", "book", "confirm"]
//! execution_mode = "sequential"
//!
//! [params]
//! date = "2025-10-13"
//!
//! [[items]]
//! label = "A"
//!
//! [[items]]
//! label = "B"
//! payload = { slot = "09:00" }
//!
//! # Behaviour of the simulated backend used by `slotrunner run`
//! [simulation]
//! step_latency_ms = 200
//!
//! [simulation.items.B]
//! transient_failures = 2
//! ```

use crate::automation::{PrincipalId, SimulationScript};
use crate::task::{BatchParams, ExecutionMode, WorkItem};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("File '{path}' not found")]
    NotFound { path: PathBuf },

    #[error("IO error reading '{path}': {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Batch parsing error in '{path}': {reason}")]
    ParseError { path: PathBuf, reason: String },
}

/// Parsed contents of a batch file.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchFile {
    pub principal: PrincipalId,
    pub items: Vec<WorkItem>,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default)]
    pub simulation: SimulationScript,
}

impl BatchFile {
    pub fn batch_params(&self) -> BatchParams {
        BatchParams {
            params: self.params.clone(),
            steps: self.steps.clone(),
            execution_mode: self.execution_mode,
        }
    }
}

pub struct BatchLoader;

impl BatchLoader {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<BatchFile, FileError> {
        let path = path.as_ref().to_path_buf();
        debug!("Loading batch file: {:?}", path);

        let content = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FileError::NotFound { path: path.clone() },
            _ => FileError::IoError {
                path: path.clone(),
                source: e,
            },
        })?;
        Self::parse(&content, &path)
    }

    pub fn parse(content: &str, source_path: &Path) -> Result<BatchFile, FileError> {
        let parse_error = |reason: String| FileError::ParseError {
            path: source_path.to_path_buf(),
            reason,
        };

        let batch: BatchFile = toml::from_str(content).map_err(|e| parse_error(e.to_string()))?;

        if batch.items.is_empty() {
            return Err(parse_error("no items defined".to_string()));
        }
        let mut labels = HashSet::new();
        for item in &batch.items {
            if item.label.trim().is_empty() {
                return Err(parse_error("item with an empty label".to_string()));
            }
            if !labels.insert(item.label.as_str()) {
                return Err(parse_error(format!("duplicate item label '{}'", item.label)));
            }
        }

        debug!(
            "Parsed batch for principal {} with {} items from {:?}",
            batch.principal,
            batch.items.len(),
            source_path
        );
        Ok(batch)
    }
}
