//! Imaging of every ROI for one probe: move, correct z, autofocus, z-stack, save.

use crate::abort::{poll_until, AbortFlag, Deadline, WaitOutcome};
use crate::alert::OperatorAlert;
use crate::config::{ImagingConfig, SyncMode};
use crate::experiment::autofocus::{AutofocusSafetyMonitor, FocusOutcome};
use crate::experiment::protocol::Probe;
use crate::experiment::records::{AcquisitionLog, EventLevel, EventLog};
use crate::experiment::roi::{Roi, RoiSet};
use crate::experiment::status::Process;
use crate::hardware::{CameraController, FocusController, StagePositioner, TriggerIO};
use crate::upload::{stack_name, UploadWorkerPool};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::instrument;

/// Width of the FPGA start pulse.
const START_PULSE: Duration = Duration::from_millis(5);

/// Subject of the operator alert sent when focus is lost twice.
pub const FOCUS_ALERT_SUBJECT: &str = "Focus lost - experiment aborted";

/// Z position of the first plane of a stack.
///
/// Centered stacks put the focal plane in the middle, or first of the upper half for an
/// even plane count.
pub fn stack_start_position(current: f64, planes: u32, step: f64, centered: bool) -> f64 {
    if !centered {
        return current;
    }
    let below = if planes % 2 == 0 { planes / 2 } else { (planes - 1) / 2 };
    current - f64::from(below) * step
}

/// What happened during one imaging pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImagingSummary {
    /// Stacks saved, in acquisition order
    pub stacks: Vec<String>,
    /// ROIs whose stack was abandoned after a handshake timeout
    pub incomplete: Vec<String>,
    /// The run was stopped by the focus policy
    pub focus_abort: bool,
}

/// Hardware and bookkeeping an imaging pass needs.
pub struct ImagingContext {
    /// XY stage
    pub stage: Arc<dyn StagePositioner>,
    /// Focus lock and piezo
    pub focus: Arc<dyn FocusController>,
    /// Acquires the stacks and the focus images
    pub camera: Arc<dyn CameraController>,
    /// Digital lines used for the acquisition handshake
    pub triggers: Arc<dyn TriggerIO>,
    /// Told when the run aborts on focus loss
    pub alert: Arc<dyn OperatorAlert>,
    /// Run event log
    pub events: Arc<EventLog>,
    /// Names of saved stacks, in acquisition order
    pub acquisitions: AcquisitionLog,
    /// Serviced between ROIs when transfer is enabled
    pub uploads: Option<Arc<UploadWorkerPool>>,
    /// Stacks are saved under `<run_root>/<ROI>/`
    pub run_root: PathBuf,
    /// Prefix of the stack names, resolved for this run
    pub file_prefix: String,
    /// Poll interval while the stage moves
    pub motion_poll: Duration,
}

/// Images every ROI of the run for one probe.
pub struct ImagingCycleController {
    ctx: ImagingContext,
    monitor: AutofocusSafetyMonitor,
    rois: RoiSet,
    corrections: Vec<f64>,
    imaging: ImagingConfig,
    abort: AbortFlag,
    first_roi_imaged: bool,
}

impl ImagingCycleController {
    /// Controller imaging `rois` with the given collaborators.
    pub fn new(
        ctx: ImagingContext,
        monitor: AutofocusSafetyMonitor,
        rois: RoiSet,
        imaging: ImagingConfig,
        abort: AbortFlag,
    ) -> Self {
        let corrections = rois.axial_corrections();
        Self {
            ctx,
            monitor,
            rois,
            corrections,
            imaging,
            abort,
            first_roi_imaged: false,
        }
    }

    /// Focus policy and correlation records.
    pub fn monitor(&self) -> &AutofocusSafetyMonitor {
        &self.monitor
    }

    /// Image every ROI in order for `probe`. Stops early on abort.
    #[instrument(skip(self, probe), fields(probe = %probe.name))]
    pub async fn run_all_rois(
        &mut self,
        cycle: u32,
        probe_index: usize,
        probe: &Probe,
    ) -> ImagingSummary {
        let mut summary = ImagingSummary::default();
        if let Some(pool) = &self.ctx.uploads {
            pool.wait_until_idle(&self.abort).await;
        }

        let rois = self.rois.rois.clone();
        for (index, roi) in rois.iter().enumerate() {
            if self.abort.is_set() {
                break;
            }
            if !self.move_to(roi).await {
                break;
            }
            self.correct_axial_position(index).await;

            let verdict = self.monitor.check_roi(probe_index, index).await;
            if verdict.abort {
                summary.focus_abort = true;
                self.stop_on_focus_loss(cycle, probe, roi).await;
                break;
            }
            match verdict.outcome {
                FocusOutcome::Interrupted => break,
                FocusOutcome::Lost | FocusOutcome::Timeout => {
                    self.ctx.events.record(
                        cycle,
                        Process::Imaging,
                        &format!("Autofocus {} at {}", verdict.outcome, roi.name),
                        EventLevel::Warning,
                    );
                }
                FocusOutcome::Found => {}
            }
            if verdict.reference_replaced && verdict.score.is_some() {
                self.ctx.events.record(
                    cycle,
                    Process::Imaging,
                    &format!("Reference image of {} replaced", roi.name),
                    EventLevel::Warning,
                );
            }

            let name = stack_name(&self.ctx.file_prefix, &probe.name, roi);
            match self.acquire_stack(roi, &name).await {
                Ok(true) => {
                    if let Err(e) = self.ctx.acquisitions.append(&name) {
                        tracing::warn!(error = %e, "could not log acquisition name");
                    }
                    summary.stacks.push(name);
                }
                Ok(false) => {
                    self.ctx.events.record(
                        cycle,
                        Process::Imaging,
                        &format!("Stack of {} incomplete", roi.name),
                        EventLevel::Warning,
                    );
                    summary.incomplete.push(roi.name.clone());
                }
                Err(e) => {
                    tracing::error!(
                        roi = %roi.name,
                        error = %format!("{e:#}"),
                        "acquisition failed"
                    );
                    self.abort.request();
                    break;
                }
            }
            self.service_uploads().await;
        }

        if !summary.focus_abort {
            if let Some(first) = rois.first() {
                self.move_to(first).await;
            }
        }
        summary
    }

    async fn service_uploads(&self) {
        if let Some(pool) = &self.ctx.uploads {
            if let Err(e) = pool.check_acquired_data() {
                tracing::warn!(error = %e, "could not list acquired data");
            }
            pool.launch_next().await;
        }
    }

    async fn move_to(&self, roi: &Roi) -> bool {
        let stage = self.ctx.stage.clone();
        let result = async {
            stage.move_to_roi(roi).await?;
            poll_until(&self.abort, self.ctx.motion_poll, Deadline::None, move || {
                let stage = stage.clone();
                async move { Ok(!stage.is_moving().await?) }
            })
            .await
        }
        .await;
        match result {
            Ok(outcome) => outcome.is_ready(),
            Err(e) => {
                tracing::error!(roi = %roi.name, error = %format!("{e:#}"), "stage move failed");
                self.abort.request();
                false
            }
        }
    }

    /// The very first ROI of the run starts in focus and is not corrected.
    async fn correct_axial_position(&mut self, index: usize) {
        if !self.first_roi_imaged {
            self.first_roi_imaged = true;
            return;
        }
        let dz = self.corrections.get(index).copied().unwrap_or(0.0);
        match self.ctx.focus.move_relative(dz).await {
            Ok(()) => tracing::info!(dz, "axial position corrected"),
            Err(e) => tracing::error!(dz, error = %e, "axial correction failed"),
        }
    }

    async fn stop_on_focus_loss(&self, cycle: u32, probe: &Probe, roi: &Roi) {
        self.abort.request();
        self.ctx.events.record(
            cycle,
            Process::Imaging,
            "Focus lost twice, experiment aborted",
            EventLevel::Error,
        );
        let body = format!(
            "Focus lost twice - experiment was aborted during cycle {cycle} ({}) at {}.",
            probe.name, roi.name
        );
        if let Err(e) = self.ctx.alert.send(FOCUS_ALERT_SUBJECT, &body).await {
            tracing::error!(error = %format!("{e:#}"), "could not alert the operator");
        }
    }

    /// Acquire the z-stack of `roi` and save it as `name`. `Ok(false)` when a handshake
    /// timed out and the stack was abandoned.
    ///
    /// Once the camera is armed, the focus returns to its reference position and the camera
    /// is stopped whatever happens to the planes.
    async fn acquire_stack(&self, roi: &Roi, name: &str) -> anyhow::Result<bool> {
        let focus = &self.ctx.focus;
        let camera = &self.ctx.camera;

        if self.imaging.sync.mode == SyncMode::Fpga {
            self.ctx.triggers.write_digital(self.imaging.sync.start_line, false).await?;
        }
        let reference = focus.position().await?;
        camera.start_acquisition(self.imaging.frames_per_stack()).await?;

        let planes = self.acquire_planes(roi, reference).await;
        let restored = focus.go_to_position(reference).await;
        let stopped = camera.stop_acquisition().await;
        let complete = planes?;
        restored?;
        stopped?;
        if !complete {
            return Ok(false);
        }

        let stem = self.ctx.run_root.join(&roi.name).join(name);
        let written = camera.save_as(&stem, self.imaging.file_format).await?;
        tracing::info!(stack = name, files = written.len(), "stack saved");
        Ok(true)
    }

    /// Step through the planes of a stack around `reference`. `Ok(false)` on timeout or abort.
    async fn acquire_planes(&self, roi: &Roi, reference: f64) -> anyhow::Result<bool> {
        let planes = self.imaging.num_z_planes;
        let step = self.imaging.z_step_um;
        let centered = self.imaging.centered_focal_plane;
        let start = stack_start_position(reference, planes, step, centered);
        tracing::info!(roi = %roi.name, planes, start, "acquiring z-stack");

        for plane in 0..planes {
            self.ctx
                .focus
                .go_to_position(start + f64::from(plane) * step)
                .await?;
            let outcome = match self.imaging.sync.mode {
                SyncMode::Fpga => self.fpga_plane().await?,
                SyncMode::CameraExposure => self.exposure_plane().await?,
            };
            match outcome {
                WaitOutcome::Ready => {}
                WaitOutcome::TimedOut => {
                    tracing::warn!(
                        roi = %roi.name,
                        plane,
                        "timeout during acquisition, stack abandoned"
                    );
                    return Ok(false);
                }
                WaitOutcome::Aborted => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Pulse the start line and wait for the ready line.
    async fn fpga_plane(&self) -> anyhow::Result<WaitOutcome> {
        let sync = &self.imaging.sync;
        let triggers = self.ctx.triggers.clone();
        triggers.write_digital(sync.start_line, true).await?;
        sleep(START_PULSE).await;
        triggers.write_digital(sync.start_line, false).await?;

        let ready_line = sync.ready_line;
        poll_until(
            &self.abort,
            sync.trigger_poll,
            Deadline::After(sync.acquisition_ready_timeout),
            move || {
                let triggers = triggers.clone();
                async move { triggers.read_digital(ready_line).await }
            },
        )
        .await
    }

    /// Follow the camera exposure output and switch each line's TTL for one frame.
    async fn exposure_plane(&self) -> anyhow::Result<WaitOutcome> {
        let sync = &self.imaging.sync;
        for line in &self.imaging.sequence {
            let Some(ttl) = line.ttl_line else {
                continue;
            };
            let high = self.wait_exposure(true).await?;
            if high != WaitOutcome::Ready {
                return Ok(high);
            }
            self.ctx.triggers.write_digital(ttl, true).await?;
            let low = self.wait_exposure(false).await?;
            self.ctx.triggers.write_digital(ttl, false).await?;
            if low != WaitOutcome::Ready {
                return Ok(low);
            }
            tracing::trace!(
                wavelength = line.wavelength,
                exposure_line = sync.exposure_line,
                "frame exposed"
            );
        }
        Ok(WaitOutcome::Ready)
    }

    async fn wait_exposure(&self, level: bool) -> anyhow::Result<WaitOutcome> {
        let sync = &self.imaging.sync;
        let triggers = self.ctx.triggers.clone();
        let line = sync.exposure_line;
        poll_until(
            &self.abort,
            sync.trigger_poll,
            Deadline::Attempts(sync.trigger_retry_limit),
            move || {
                let triggers = triggers.clone();
                async move { Ok(triggers.read_digital(line).await? == level) }
            },
        )
        .await
    }
}
