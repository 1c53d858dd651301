//! Capability traits consumed by the orchestration.
//!
//! Drivers live outside this crate; each implements the narrow capability it provides.
//! Every method is async and returns `anyhow::Result` so driver errors keep their context
//! until the orchestration converts them at the call site.
//!
//! Methods named `start_*` return as soon as the device accepted the command. Completion is
//! observed through the matching query (`is_moving`, `search_running`,
//! `target_volume_reached`) polled by the caller.

use crate::config::FileFormat;
use crate::experiment::roi::Roi;
use anyhow::Result;
use async_trait::async_trait;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pressure-regulated flow controller with a flowmeter.
#[async_trait]
pub trait FlowController: Send + Sync {
    /// Set the output pressure in mbar.
    async fn set_pressure(&self, mbar: f64) -> Result<()>;
    /// Regulate the pressure to hold `flowrate` (µl/min).
    async fn start_regulation(&self, flowrate: f64) -> Result<()>;
    /// Stop the regulation loop and the volume measurement.
    async fn stop_regulation(&self) -> Result<()>;
    /// Start integrating the flow toward `target` µl.
    async fn start_volume_measurement(&self, target: f64) -> Result<()>;
    /// The measured volume reached the target.
    async fn target_volume_reached(&self) -> Result<bool>;
    /// Push rinse buffer through the needle for `duration`.
    async fn start_rinsing(&self, duration: Duration) -> Result<()>;
}

/// Valve banks of the fluidic system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValveBank {
    /// 8-way buffer selection valve
    Buffer,
    /// Needle valve, selecting between needle delivery (1) and rinse (2)
    Needle,
    /// Stop valve in front of the sample chamber
    Flow,
}

/// Multi-position valve controller.
#[async_trait]
pub trait ValveController: Send + Sync {
    /// Command `bank` to `position`. Returns before the valve moved.
    async fn set_position(&self, bank: ValveBank, position: u32) -> Result<()>;
    /// Resolve once every valve reached its commanded position.
    async fn wait_for_idle(&self) -> Result<()>;
}

/// Injection needle moved between probe tubes.
#[async_trait]
pub trait NeedlePositioner: Send + Sync {
    /// Start moving above `tube`.
    async fn start_move_to(&self, tube: u32) -> Result<()>;
    /// A move is in progress.
    async fn is_moving(&self) -> Result<bool>;
    /// Whether the tube origin was taught before the run.
    async fn origin_defined(&self) -> Result<bool>;
}

/// XY stage carrying the sample.
#[async_trait]
pub trait StagePositioner: Send + Sync {
    /// Start moving to the XY position of `roi`.
    async fn move_to_roi(&self, roi: &Roi) -> Result<()>;
    /// A move is in progress.
    async fn is_moving(&self) -> Result<bool>;
}

/// Focus drive with a hardware autofocus search.
#[async_trait]
pub trait FocusController: Send + Sync {
    /// The autofocus offset was calibrated before the run.
    async fn is_calibrated(&self) -> Result<bool>;
    /// Start a focus search.
    async fn start_autofocus(&self) -> Result<()>;
    /// A focus search is still running.
    async fn search_running(&self) -> Result<bool>;
    /// Whether the last search locked the focus.
    async fn is_stable(&self) -> Result<bool>;
    /// Focus position in µm.
    async fn position(&self) -> Result<f64>;
    /// Move to an absolute position in µm.
    async fn go_to_position(&self, z_um: f64) -> Result<()>;
    /// Move by `dz_um` µm.
    async fn move_relative(&self, dz_um: f64) -> Result<()>;
}

/// Camera acquiring triggered stacks.
#[async_trait]
pub trait CameraController: Send + Sync {
    /// Arm the camera for `frames` externally triggered frames.
    async fn start_acquisition(&self, frames: u32) -> Result<()>;
    /// Disarm the camera.
    async fn stop_acquisition(&self) -> Result<()>;
    /// Single frame used by the focus safety check.
    async fn snap(&self) -> Result<Array2<u16>>;
    /// Write the acquired stack as `stem` plus extension. Returns every file written.
    async fn save_as(&self, stem: &Path, format: FileFormat) -> Result<Vec<PathBuf>>;
}

/// Digital lines shared with the FPGA and the laser TTLs.
#[async_trait]
pub trait TriggerIO: Send + Sync {
    /// Level of input `channel`.
    async fn read_digital(&self, channel: u32) -> Result<bool>;
    /// Drive output `channel`.
    async fn write_digital(&self, channel: u32, value: bool) -> Result<()>;
}

/// User-facing controls that must be locked while a run owns the hardware.
#[async_trait]
pub trait ExternalControls: Send + Sync {
    /// Lock every manual control.
    async fn disable_all(&self) -> Result<()>;
    /// Unlock every manual control.
    async fn enable_all(&self) -> Result<()>;
    /// Release hardware sessions held for the run.
    async fn release_sessions(&self) -> Result<()>;
}
