//! Files written alongside the acquired data.
//!
//! - run directory `save_path/YYYY_MM_DD/NNN_HiM_<sample>` with a `metadata/` folder
//! - `events.csv`, the append-only event log
//! - `movie_name.txt`, the acquisition-ordered list of stack names
//! - `parameters.yml`, the parameter dump written at start

use crate::config::RunConfig;
use crate::error::{AppResult, HimError};
use crate::experiment::protocol::InjectionProtocol;
use crate::experiment::roi::RoiSet;
use crate::experiment::status::Process;
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Metadata folder inside the run directory.
pub const METADATA_DIR: &str = "metadata";
/// Live `RunStatus` record.
pub const STATUS_FILE: &str = "status.yaml";
/// Timestamped event log.
pub const EVENTS_FILE: &str = "events.csv";
/// Dump of the configuration, protocol and ROIs.
pub const PARAMETERS_FILE: &str = "parameters.yml";
/// Persisted reference images.
pub const REFERENCE_BANK_FILE: &str = "autofocus_reference.bin";
/// Probe by ROI correlation scores.
pub const CORRELATION_FILE: &str = "correlation.csv";
/// Stack names in acquisition order, read by the vendor renamer.
pub const MOVIE_NAMES_FILE: &str = "movie_name.txt";

/// Directories of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectory {
    /// `save_path/<date>/NNN_HiM_<sample>`
    pub root: PathBuf,
    /// Parameters, event log, status record and autofocus data
    pub metadata: PathBuf,
    /// `NNN`: rank of the run among the runs of its date
    pub number: u32,
}

impl RunDirectory {
    /// Create `save_path/<date>/NNN_HiM_<sample>` and its metadata folder.
    ///
    /// `NNN` is one more than the number of runs already stored under that date.
    pub fn create(save_path: &Path, sample: &str, date: NaiveDate) -> AppResult<Self> {
        let dated = save_path.join(date.format("%Y_%m_%d").to_string());
        std::fs::create_dir_all(&dated)?;
        let existing = std::fs::read_dir(&dated)?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .count();
        let number = u32::try_from(existing + 1).unwrap_or(u32::MAX);
        let root = dated.join(format!("{number:03}_HiM_{sample}"));
        let metadata = root.join(METADATA_DIR);
        std::fs::create_dir_all(&metadata)?;
        Ok(Self {
            root,
            metadata,
            number,
        })
    }

    /// Zero-padded run number, the default prefix of stack names.
    pub fn number_label(&self) -> String {
        format!("{:03}", self.number)
    }

    /// Name of the run folder, mirrored on the network store.
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Path of `name` inside the metadata folder.
    pub fn metadata_file(&self, name: &str) -> PathBuf {
        self.metadata.join(name)
    }
}

/// Severity recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    /// Normal progress
    Info,
    /// Recoverable problem or abort
    Warning,
    /// Failure
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventLevel::Info => write!(f, "info"),
            EventLevel::Warning => write!(f, "warning"),
            EventLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Serialize)]
struct EventRow<'a> {
    timestamp: String,
    cycle_no: u32,
    process: u8,
    event: &'a str,
    level: String,
}

/// Append-only CSV event log: `timestamp,cycle_no,process,event,level`.
///
/// A write failure is logged and the run goes on.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventLog {
    /// Create the file with its header.
    pub fn create(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["timestamp", "cycle_no", "process", "event", "level"])?;
        writer.flush()?;
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Location of the CSV file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row. Write failures are logged, never raised.
    pub fn record(&self, cycle: u32, process: Process, event: &str, level: EventLevel) {
        if let Err(e) = self.append(cycle, process, event, level) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "could not append to event log"
            );
        }
    }

    fn append(
        &self,
        cycle: u32,
        process: Process,
        event: &str,
        level: EventLevel,
    ) -> AppResult<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| HimError::Persistence("event log lock poisoned".to_string()))?;
        let file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.serialize(EventRow {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            cycle_no: cycle,
            process: process.code(),
            event,
            level: level.to_string(),
        })?;
        writer.flush()?;
        Ok(())
    }
}

/// `movie_name.txt`: one stack name per line, in acquisition order.
#[derive(Debug, Clone)]
pub struct AcquisitionLog {
    path: PathBuf,
}

impl AcquisitionLog {
    /// Log stored at `path`; nothing is written yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the name list.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one stack name.
    pub fn append(&self, name: &str) -> AppResult<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{name}")?;
        Ok(())
    }

    /// Names logged so far. A missing file is an empty log.
    pub fn names(&self) -> AppResult<Vec<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ParameterDump<'a> {
    run_id: Uuid,
    host: String,
    software_version: &'static str,
    started: String,
    configuration: &'a RunConfig,
    protocol: &'a InjectionProtocol,
    rois: BTreeMap<&'a str, String>,
}

/// Write the parameters of the run to `path` as YAML. Returns the run id.
pub fn save_parameters(
    path: &Path,
    config: &RunConfig,
    protocol: &InjectionProtocol,
    rois: &RoiSet,
) -> AppResult<Uuid> {
    let run_id = Uuid::new_v4();
    let dump = ParameterDump {
        run_id,
        host: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string()),
        software_version: env!("CARGO_PKG_VERSION"),
        started: Local::now().to_rfc3339(),
        configuration: config,
        protocol,
        rois: rois
            .iter()
            .map(|roi| {
                let [x, y, z] = roi.position;
                (roi.name.as_str(), format!("X={x} - Y={y} - Z={z}"))
            })
            .collect(),
    };
    std::fs::write(path, serde_yaml::to_string(&dump)?)?;
    Ok(run_id)
}
