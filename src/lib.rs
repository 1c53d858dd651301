//! Core library for the him_daq application.
//!
//! This library contains the orchestration engine for multi-cycle Hi-M fluorescence
//! imaging experiments: the task lifecycle, the probe cycle scheduler, fluidics and
//! imaging controllers, the autofocus safety check and the background upload of acquired
//! data. Hardware is reached only through the capability traits in [`hardware`].

pub mod abort;
pub mod alert;
pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod upload;

pub use abort::AbortFlag;
pub use config::RunConfig;
pub use error::{AppResult, HimError};
