//! Interruptable task lifecycle hosting the probe cycle scheduler.
//!
//! ```text
//! Idle -> Starting -> Running <-> {Pausing, Resuming} -> CleaningUp -> Terminated
//!            |           |            |
//!            +-----------+------------+--> Aborted -> CleaningUp
//! ```
//!
//! The caller owns the loop: `start()`, then `step()` until it returns `false`, then
//! `cleanup()` on every path. `step()` and `cleanup()` never return errors; failures end up
//! in the log and, where the run cannot go on, in the abort flag.

use crate::abort::AbortFlag;
use crate::alert::{LogAlert, OperatorAlert, SendmailAlert};
use crate::config::{RunConfig, TransferConfig};
use crate::error::{AppResult, HimError};
use crate::experiment::autofocus::AutofocusSafetyMonitor;
use crate::experiment::imaging::{ImagingContext, ImagingCycleController};
use crate::experiment::injection::InjectionExecutor;
use crate::experiment::protocol::InjectionProtocol;
use crate::experiment::records::{
    save_parameters, AcquisitionLog, EventLevel, EventLog, RunDirectory, CORRELATION_FILE,
    EVENTS_FILE, MOVIE_NAMES_FILE, PARAMETERS_FILE, REFERENCE_BANK_FILE, STATUS_FILE,
};
use crate::experiment::reference::{CorrelationScoreMatrix, ReferenceImageBank};
use crate::experiment::roi::RoiSet;
use crate::experiment::scheduler::{ProbeCycleScheduler, SchedulerContext};
use crate::experiment::status::{Process, RunStatus, StatusBoard, StatusRecorder};
use crate::hardware::Instruments;
use crate::upload::{
    CopyTransfer, FileTransfer, NetworkProbe, PingProbe, UploadWorkerPool, VendorRenamer,
};
use async_trait::async_trait;
use chrono::Local;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::instrument;
use uuid::Uuid;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not started
    Idle,
    /// One-time setup in progress
    Starting,
    /// Executing probe cycles
    Running,
    /// Pause requested; honoured at the next step boundary
    Pausing,
    /// Resume requested; the next step runs a cycle again
    Resuming,
    /// Releasing the rig
    CleaningUp,
    /// Cleanup finished
    Terminated,
    /// Stopped by a precondition failure, an abort request or the focus policy
    Aborted,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Idle => write!(f, "idle"),
            TaskState::Starting => write!(f, "starting"),
            TaskState::Running => write!(f, "running"),
            TaskState::Pausing => write!(f, "pausing"),
            TaskState::Resuming => write!(f, "resuming"),
            TaskState::CleaningUp => write!(f, "cleaning up"),
            TaskState::Terminated => write!(f, "terminated"),
            TaskState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Lifecycle driven by an external polling loop.
#[async_trait]
pub trait InterruptableTask: Send {
    /// One-time setup. An error leaves the task `Aborted`; it never enters `Running`.
    async fn start(&mut self) -> AppResult<()>;
    /// Run one unit of work. Returns whether the caller should call `step` again.
    async fn step(&mut self) -> bool;
    /// Request a pause at the next step boundary.
    async fn pause(&mut self);
    /// Let a paused task run cycles again.
    async fn resume(&mut self);
    /// Release everything. Safe to call more than once.
    async fn cleanup(&mut self);
    /// Current lifecycle state.
    fn state(&self) -> TaskState;
}

/// Run `task` to completion: start, step until done, clean up.
pub async fn run_task<T: InterruptableTask + ?Sized>(task: &mut T) -> TaskState {
    match task.start().await {
        Ok(()) => while task.step().await {},
        Err(e) => tracing::error!(error = %e, "task did not start"),
    }
    task.cleanup().await;
    task.state()
}

/// Services a run uses besides the instruments.
#[derive(Clone)]
pub struct TaskServices {
    /// Reached when focus is lost twice
    pub alert: Arc<dyn OperatorAlert>,
    /// Checked before each upload
    pub network: Arc<dyn NetworkProbe>,
    /// Copies files to the network store
    pub transfer: Arc<dyn FileTransfer>,
}

impl TaskServices {
    /// Mail alerts when an address is configured, ping probe, plain file copy.
    pub fn from_config(transfer: &TransferConfig) -> Self {
        let alert: Arc<dyn OperatorAlert> = match &transfer.alert_email {
            Some(address) => Arc::new(SendmailAlert::new(address.clone())),
            None => Arc::new(LogAlert),
        };
        Self {
            alert,
            network: Arc::new(PingProbe::new(transfer.probe_host.clone())),
            transfer: Arc::new(CopyTransfer),
        }
    }
}

/// State owned by a started run.
struct RunSession {
    directory: RunDirectory,
    events: Arc<EventLog>,
    scheduler: ProbeCycleScheduler,
    uploads: Option<Arc<UploadWorkerPool>>,
    run_id: Uuid,
    started: Instant,
}

/// The Hi-M experiment: one probe cycle per `step`.
pub struct HiMTask {
    config: RunConfig,
    instruments: Instruments,
    services: TaskServices,
    abort: AbortFlag,
    state: TaskState,
    status: Arc<StatusBoard>,
    session: Option<RunSession>,
    next_probe: usize,
    aborted: bool,
    controls_disabled: bool,
    cleaned: bool,
}

impl HiMTask {
    /// Idle task; nothing touches the rig until `start`.
    pub fn new(config: RunConfig, instruments: Instruments, services: TaskServices) -> Self {
        Self {
            config,
            instruments,
            services,
            abort: AbortFlag::new(),
            state: TaskState::Idle,
            status: Arc::new(StatusBoard::new(None)),
            session: None,
            next_probe: 0,
            aborted: false,
            controls_disabled: false,
            cleaned: false,
        }
    }

    /// Flag an external cancel request sets.
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Live view of the run status.
    pub fn status_receiver(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    /// The run stopped before its last probe.
    pub fn was_aborted(&self) -> bool {
        self.aborted
    }

    /// Identifier of the run, once started.
    pub fn run_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.run_id)
    }

    /// Directories of the run, once started.
    pub fn run_directory(&self) -> Option<&RunDirectory> {
        self.session.as_ref().map(|s| &s.directory)
    }

    /// Probe cycles executed so far.
    pub fn cycles_run(&self) -> usize {
        self.next_probe
    }

    fn mark_aborted(&mut self) {
        self.aborted = true;
        self.state = TaskState::Aborted;
    }

    async fn enable_controls(&mut self) {
        if !self.controls_disabled {
            return;
        }
        self.controls_disabled = false;
        match self.instruments.controls.enable_all().await {
            Ok(()) => tracing::info!("external controls enabled"),
            Err(e) => tracing::error!(error = %e, "could not re-enable external controls"),
        }
    }

    async fn check_preconditions(&self) -> AppResult<()> {
        let needle = self
            .instruments
            .needle
            .origin_defined()
            .await
            .map_err(|e| HimError::hardware("needle origin", e))?;
        if !needle {
            return Err(HimError::Precondition(
                "the needle reference position is not defined".to_string(),
            ));
        }
        let calibrated = self
            .instruments
            .focus
            .is_calibrated()
            .await
            .map_err(|e| HimError::hardware("autofocus calibration", e))?;
        if !calibrated {
            return Err(HimError::Precondition(
                "the autofocus is not calibrated".to_string(),
            ));
        }
        Ok(())
    }

    /// Load inputs, create the run directory and wire the scheduler.
    async fn open_session(&self) -> AppResult<RunSession> {
        let experiment = &self.config.experiment;
        let protocol = InjectionProtocol::load(&experiment.injections_path)?;
        let rois = RoiSet::load(&experiment.roi_list_path)?;
        tracing::info!(
            probes = protocol.probes.len(),
            rois = rois.len(),
            expected_fluidics = ?protocol.expected_cycle_duration(),
            "inputs loaded"
        );

        let directory = RunDirectory::create(
            &experiment.save_path,
            &experiment.sample_name,
            Local::now().date_naive(),
        )?;
        self.status
            .attach(StatusRecorder::new(directory.metadata_file(STATUS_FILE)));
        self.status.begin_run();
        let events = Arc::new(EventLog::create(directory.metadata_file(EVENTS_FILE))?);
        events.record(0, Process::None, "Task started", EventLevel::Info);

        let bank_path = directory.metadata_file(REFERENCE_BANK_FILE);
        let bank = match &self.config.autofocus.reference_bank {
            Some(source) => ReferenceImageBank::load(source, rois.len(), bank_path)?,
            None => ReferenceImageBank::new(rois.len(), bank_path),
        };
        let scores = CorrelationScoreMatrix::new(
            protocol.probes.iter().map(|p| p.name.clone()).collect(),
            rois.iter().map(|r| r.name.clone()).collect(),
        );

        let acquisitions = AcquisitionLog::new(directory.metadata_file(MOVIE_NAMES_FILE));
        let uploads = self.open_uploads(&directory, &events, &acquisitions).await?;
        let run_id = save_parameters(
            &directory.metadata_file(PARAMETERS_FILE),
            &self.config,
            &protocol,
            &rois,
        )?;

        let monitor = AutofocusSafetyMonitor::new(
            self.instruments.focus.clone(),
            self.instruments.camera.clone(),
            self.abort.clone(),
            self.config.autofocus.clone(),
            bank,
            scores,
        );
        let imaging = ImagingCycleController::new(
            ImagingContext {
                stage: self.instruments.stage.clone(),
                focus: self.instruments.focus.clone(),
                camera: self.instruments.camera.clone(),
                triggers: self.instruments.triggers.clone(),
                alert: self.services.alert.clone(),
                events: events.clone(),
                acquisitions,
                uploads: uploads.clone(),
                run_root: directory.root.clone(),
                file_prefix: experiment
                    .file_prefix
                    .clone()
                    .unwrap_or_else(|| directory.number_label()),
                motion_poll: self.config.fluidics.motion_poll,
            },
            monitor,
            rois,
            self.config.imaging.clone(),
            self.abort.clone(),
        );
        let fluidics = InjectionExecutor::new(
            self.instruments.flow.clone(),
            self.instruments.valves.clone(),
            self.abort.clone(),
            uploads.clone(),
            self.config.fluidics.clone(),
        );
        let scheduler = ProbeCycleScheduler::new(
            SchedulerContext {
                needle: self.instruments.needle.clone(),
                status: self.status.clone(),
                events: events.clone(),
                abort: self.abort.clone(),
                motion_poll: self.config.fluidics.motion_poll,
                needle_valve: self.config.fluidics.needle_valve_position,
            },
            fluidics,
            imaging,
            protocol,
        );

        Ok(RunSession {
            directory,
            events,
            scheduler,
            uploads,
            run_id,
            started: Instant::now(),
        })
    }

    /// Upload pool mirroring the run directory, or `None` when transfer is off or the
    /// network is down at start.
    async fn open_uploads(
        &self,
        directory: &RunDirectory,
        events: &EventLog,
        acquisitions: &AcquisitionLog,
    ) -> AppResult<Option<Arc<UploadWorkerPool>>> {
        let transfer = &self.config.transfer;
        if !transfer.enabled {
            return Ok(None);
        }
        let Some(network_path) = &transfer.network_path else {
            return Err(HimError::Configuration(
                "transfer.network_path is required when transfer is enabled".to_string(),
            ));
        };
        if !self.services.network.is_reachable().await {
            tracing::warn!("network store unreachable, data transfer disabled for this run");
            events.record(
                0,
                Process::None,
                "Network unreachable, transfer disabled",
                EventLevel::Warning,
            );
            return Ok(None);
        }
        let renamer = transfer
            .vendor
            .as_ref()
            .map(|vendor| {
                VendorRenamer::new(&vendor.directory, &vendor.pattern, acquisitions.clone())
            })
            .transpose()?;
        let network_root = network_path.join(directory.name());
        tracing::info!(to = %network_root.display(), "data transfer enabled");
        Ok(Some(Arc::new(UploadWorkerPool::new(
            directory.root.clone(),
            network_root,
            self.services.network.clone(),
            self.services.transfer.clone(),
            transfer,
            renamer,
        ))))
    }

    async fn release_session(&self, errors: &mut Vec<HimError>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let monitor = session.scheduler.imaging().monitor();
        if let Err(e) = monitor.save_scores(&session.directory.metadata_file(CORRELATION_FILE)) {
            errors.push(e);
        }
        if let Err(e) = monitor.bank().persist() {
            errors.push(e);
        }

        session.scheduler.fluidics().safe_state().await;
        let level = if self.aborted {
            EventLevel::Warning
        } else {
            EventLevel::Info
        };
        let message = if self.aborted {
            "Task was aborted".to_string()
        } else {
            format!("Task finished, total time {:?}", session.started.elapsed())
        };
        session
            .events
            .record(self.next_probe as u32, Process::None, &message, level);
    }

    /// Mirror the final local records, or drop the queue after an abort.
    async fn finish_uploads(&self) {
        let Some(pool) = self.session.as_ref().and_then(|s| s.uploads.as_ref()) else {
            return;
        };
        if self.aborted {
            pool.abandon();
        } else {
            pool.drain(&self.abort).await;
        }
    }
}

#[async_trait]
impl InterruptableTask for HiMTask {
    #[instrument(skip(self), fields(sample = %self.config.experiment.sample_name))]
    async fn start(&mut self) -> AppResult<()> {
        if self.state != TaskState::Idle {
            return Err(HimError::Precondition(format!("cannot start: task is {}", self.state)));
        }
        self.state = TaskState::Starting;
        match self.instruments.controls.disable_all().await {
            Ok(()) => self.controls_disabled = true,
            Err(e) => tracing::warn!(error = %e, "could not disable external controls"),
        }

        let prepared = match self.check_preconditions().await {
            Ok(()) => self.open_session().await,
            Err(e) => Err(e),
        };
        match prepared {
            Ok(session) => {
                tracing::info!(
                    run = %session.directory.root.display(),
                    run_id = %session.run_id,
                    "task started"
                );
                self.session = Some(session);
                self.state = TaskState::Running;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "task aborted during start");
                self.mark_aborted();
                self.enable_controls().await;
                Err(e)
            }
        }
    }

    async fn step(&mut self) -> bool {
        if self.abort.is_set() {
            if matches!(
                self.state,
                TaskState::Running | TaskState::Pausing | TaskState::Resuming
            ) {
                self.mark_aborted();
            }
            return false;
        }
        match self.state {
            TaskState::Pausing => {
                sleep(self.config.fluidics.poll_interval).await;
                return true;
            }
            TaskState::Resuming => {
                tracing::info!("resumed");
                self.state = TaskState::Running;
            }
            TaskState::Running => {}
            _ => return false,
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        let index = self.next_probe;
        if index >= session.scheduler.probe_count() {
            tracing::debug!(index, "every probe already processed");
            return false;
        }
        let more = session.scheduler.run_probe_cycle(index).await;
        self.next_probe += 1;
        if self.abort.is_set() {
            self.mark_aborted();
            return false;
        }
        more
    }

    async fn pause(&mut self) {
        if self.state == TaskState::Running {
            tracing::info!("pause requested, taking effect after the current cycle");
            self.state = TaskState::Pausing;
        } else {
            tracing::warn!(state = %self.state, "cannot pause");
        }
    }

    async fn resume(&mut self) {
        if self.state == TaskState::Pausing {
            self.state = TaskState::Resuming;
        } else {
            tracing::warn!(state = %self.state, "cannot resume");
        }
    }

    #[instrument(skip(self))]
    async fn cleanup(&mut self) {
        if self.cleaned {
            tracing::debug!("cleanup already done");
            return;
        }
        self.cleaned = true;
        if self.abort.is_set() || self.state == TaskState::Aborted {
            self.aborted = true;
        }
        self.state = TaskState::CleaningUp;

        let mut errors = Vec::new();
        self.release_session(&mut errors).await;
        self.status.clear();
        self.finish_uploads().await;

        if let Err(e) = self.instruments.camera.stop_acquisition().await {
            errors.push(HimError::hardware("stop acquisition", e));
        }
        if let Err(e) = self.instruments.controls.release_sessions().await {
            errors.push(HimError::hardware("release sessions", e));
        }
        self.enable_controls().await;

        if !errors.is_empty() {
            for e in &errors {
                tracing::error!(error = %e, "cleanup action failed");
            }
            tracing::error!(error = %HimError::CleanupFailed(errors), "cleanup incomplete");
        }
        if self.aborted {
            tracing::warn!(cycles = self.next_probe, "Hi-M experiment was aborted");
        } else {
            tracing::info!(cycles = self.next_probe, "Hi-M experiment finished");
        }
        self.state = TaskState::Terminated;
    }

    fn state(&self) -> TaskState {
        self.state
    }
}
