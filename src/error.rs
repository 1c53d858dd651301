//! Custom error types for the orchestration engine.
//!
//! This module defines the primary error type, `HimError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur while preparing and running a Hi-M experiment.
//!
//! ## Error Hierarchy
//!
//! `HimError` is an enum that consolidates various error sources:
//!
//! - **`Config`**: Wraps errors from `figment`, typically a missing key or a value of the
//!   wrong type in the run configuration file.
//! - **`Configuration`**: Semantic errors in the configuration that pass parsing but are
//!   logically incorrect (e.g. a crop size larger than the correlation grid).
//! - **`Protocol`**: Errors in the injection sequence document (unknown product, duplicate
//!   valve assignment, injection without volume, ...).
//! - **`Io`**, **`Yaml`**, **`Json`**: Wrapped I/O and (de)serialization failures.
//! - **`Persistence`**: Failures writing or reading run state (status record, event log,
//!   reference bank, score table).
//! - **`Precondition`**: A check performed at `start()` failed (needle origin not defined,
//!   autofocus not calibrated).
//! - **`Hardware`**: A collaborator reported an error. Collaborators speak `anyhow`; the
//!   orchestration converts at the call site.
//! - **`Processing`**: Image processing failed (dimension mismatch, untextured reference).
//! - **`CleanupFailed`**: One or more cleanup actions failed. Only ever logged.
//!
//! By using `#[from]`, `HimError` can be created from the underlying error types,
//! so the `?` operator works across the persistence and loading code.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, HimError>;

/// Errors of a Hi-M run and its inputs.
#[derive(Error, Debug)]
pub enum HimError {
    /// Configuration could not be read or extracted
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration values rejected by `validate`
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Injection document rejected
    #[error("Injection protocol error in {path}: {message}")]
    Protocol {
        /// Document being loaded
        path: PathBuf,
        /// What was wrong, with the phase and step number
        message: String,
    },

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed YAML document or status record
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Malformed ROI list
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV or bincode record could not be written or read
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The rig or the task is not in a state to run
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A collaborator call failed
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Focus image could not be processed
    #[error("Image processing error: {0}")]
    Processing(String),

    /// Every cleanup action that failed
    #[error("Cleanup failed with {} error(s)", .0.len())]
    CleanupFailed(Vec<HimError>),
}

impl From<figment::Error> for HimError {
    fn from(err: figment::Error) -> Self {
        HimError::Config(Box::new(err))
    }
}

impl From<csv::Error> for HimError {
    fn from(err: csv::Error) -> Self {
        HimError::Persistence(err.to_string())
    }
}

impl From<bincode::Error> for HimError {
    fn from(err: bincode::Error) -> Self {
        HimError::Persistence(err.to_string())
    }
}

impl HimError {
    /// Wrap a collaborator failure with the action that was attempted.
    pub fn hardware(action: &str, err: anyhow::Error) -> Self {
        HimError::Hardware(format!("{action}: {err:#}"))
    }
}
