//! Live run status, persisted on every change and published to observers.

use crate::error::AppResult;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// Phase of the probe cycle currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Process {
    /// Between phases, or no run
    #[default]
    None,
    /// Probe injection and incubation
    Hybridization,
    /// ROI loop
    Imaging,
    /// Photobleaching and the needle rinse
    Photobleaching,
}

impl Process {
    /// Numeric code written to the event log.
    pub fn code(self) -> u8 {
        match self {
            Process::None => 0,
            Process::Hybridization => 1,
            Process::Imaging => 2,
            Process::Photobleaching => 3,
        }
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Process::None => write!(f, "None"),
            Process::Hybridization => write!(f, "Hybridization"),
            Process::Imaging => write!(f, "Imaging"),
            Process::Photobleaching => write!(f, "Photobleaching"),
        }
    }
}

/// Status record of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    /// 1-based cycle number, 0 before the first cycle
    pub cycle_number: u32,
    /// Phase now executing
    pub process: Process,
    /// Start of the run
    pub start_time: Option<DateTime<Local>>,
    /// Start of the current cycle
    pub cycle_start_time: Option<DateTime<Local>>,
}

/// YAML file holding the latest [`RunStatus`].
#[derive(Debug, Clone)]
pub struct StatusRecorder {
    path: PathBuf,
}

impl StatusRecorder {
    /// Recorder writing `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the YAML record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file contents atomically.
    pub fn write(&self, status: &RunStatus) -> AppResult<()> {
        let text = serde_yaml::to_string(status)?;
        let tmp = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Read back the last record written.
    pub fn read(&self) -> AppResult<RunStatus> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

/// Owner of the run status. Every mutation is persisted and broadcast.
#[derive(Debug)]
pub struct StatusBoard {
    tx: watch::Sender<RunStatus>,
    recorder: Mutex<Option<StatusRecorder>>,
}

impl StatusBoard {
    /// Board starting from the empty record, persisted through `recorder` if any.
    pub fn new(recorder: Option<StatusRecorder>) -> Self {
        let (tx, _rx) = watch::channel(RunStatus::default());
        Self {
            tx,
            recorder: Mutex::new(recorder),
        }
    }

    /// Attach the file recorder once the run directory exists.
    pub fn attach(&self, recorder: StatusRecorder) {
        *self
            .recorder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(recorder);
        self.persist();
    }

    /// Receiver notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.tx.subscribe()
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> RunStatus {
        self.tx.borrow().clone()
    }

    /// Mark the run as started.
    pub fn begin_run(&self) {
        self.update(|status| {
            status.start_time = Some(Local::now());
        });
    }

    /// Enter cycle `cycle_number` (1-based).
    pub fn begin_cycle(&self, cycle_number: u32) {
        self.update(|status| {
            status.cycle_number = cycle_number;
            status.cycle_start_time = Some(Local::now());
            status.process = Process::None;
        });
    }

    /// Record the phase now executing.
    pub fn set_process(&self, process: Process) {
        self.update(|status| status.process = process);
    }

    /// Reset to the empty record.
    pub fn clear(&self) {
        self.update(|status| *status = RunStatus::default());
    }

    fn update(&self, apply: impl FnOnce(&mut RunStatus)) {
        self.tx.send_modify(apply);
        self.persist();
    }

    fn persist(&self) {
        let recorder = self.recorder.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(recorder) = recorder.as_ref() {
            if let Err(e) = recorder.write(&self.tx.borrow()) {
                tracing::warn!(
                    path = %recorder.path().display(),
                    error = %e,
                    "could not write status record"
                );
            }
        }
    }
}
