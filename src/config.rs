//! Run configuration using Figment
//!
//! A run is described by a single TOML or YAML file (chosen by extension) that names the
//! sample, the input documents (ROI list, injection sequence), the imaging sequence and the
//! tuning of the fluidics, autofocus and transfer subsystems.
//!
//! # Environment Variable Overrides
//!
//! Environment variables with the `HIM_` prefix override file values. A double underscore
//! separates nesting levels:
//!
//! ```text
//! HIM_APPLICATION__LOG_LEVEL=debug
//! HIM_TRANSFER__ENABLED=false
//! HIM_AUTOFOCUS__CORRELATION_THRESHOLD=0.5
//! ```
//!
//! # Example
//!
//! ```no_run
//! use him_daq::config::RunConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::load_from("config/run.toml")?;
//!     println!("Sample: {}", config.experiment.sample_name);
//!     println!("Planes: {}", config.imaging.num_z_planes);
//!     Ok(())
//! }
//! ```

use crate::error::{AppResult, HimError};
use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Sample identity and input documents
    pub experiment: ExperimentConfig,
    /// Imaging sequence and z-stack geometry
    pub imaging: ImagingConfig,
    /// Autofocus and correlation safety check
    #[serde(default)]
    pub autofocus: AutofocusConfig,
    /// Fluidics timing
    #[serde(default)]
    pub fluidics: FluidicsConfig,
    /// Background transfer to the network store
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

/// Sample identity and input documents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Sample name, used in the run directory name
    pub sample_name: String,
    /// Root directory for acquired data
    pub save_path: PathBuf,
    /// ROI list (JSON)
    pub roi_list_path: PathBuf,
    /// Injection sequence document (YAML)
    pub injections_path: PathBuf,
    /// Prefix of the stack file names; the run number (`001`, `002`...) when unset
    #[serde(default)]
    pub file_prefix: Option<String>,
}

/// One line of the per-plane imaging sequence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImagingLine {
    /// Laser line in nm
    pub wavelength: u32,
    /// Intensity in percent
    pub intensity: f64,
    /// Digital output driving this line in camera-exposure sync mode
    #[serde(default)]
    pub ttl_line: Option<u32>,
}

/// Format the camera collaborator writes stacks in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Tagged image file
    #[default]
    Tif,
    /// FITS
    Fits,
    /// NumPy array
    Npy,
    /// HDF5 container
    Hdf5,
}

impl FileFormat {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Tif => "tif",
            FileFormat::Fits => "fits",
            FileFormat::Npy => "npy",
            FileFormat::Hdf5 => "h5",
        }
    }
}

/// Per-plane hardware synchronisation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Pulse the FPGA start line and wait for its ready line.
    #[default]
    Fpga,
    /// Follow the camera exposure output and switch laser TTLs line by line.
    CameraExposure,
}

/// Digital lines and timeouts of the per-plane handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Synchronisation mode
    #[serde(default)]
    pub mode: SyncMode,
    /// Output pulsed to start a plane
    #[serde(default)]
    pub start_line: u32,
    /// Input raised when the plane is acquired
    #[serde(default = "default_ready_line")]
    pub ready_line: u32,
    /// Camera exposure output
    #[serde(default = "default_exposure_line")]
    pub exposure_line: u32,
    /// Polls allowed while waiting for a camera exposure edge
    #[serde(default = "default_trigger_retry_limit")]
    pub trigger_retry_limit: u32,
    /// Interval between trigger polls
    #[serde(with = "humantime_serde", default = "default_trigger_poll")]
    pub trigger_poll: Duration,
    /// Timeout of the FPGA ready wait, per plane
    #[serde(with = "humantime_serde", default = "default_acquisition_ready_timeout")]
    pub acquisition_ready_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            start_line: 0,
            ready_line: default_ready_line(),
            exposure_line: default_exposure_line(),
            trigger_retry_limit: default_trigger_retry_limit(),
            trigger_poll: default_trigger_poll(),
            acquisition_ready_timeout: default_acquisition_ready_timeout(),
        }
    }
}

/// Imaging sequence and z-stack geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagingConfig {
    /// Planes per stack
    pub num_z_planes: u32,
    /// Distance between planes in µm
    pub z_step_um: f64,
    /// Center the stack on the focus position instead of starting at it
    #[serde(default)]
    pub centered_focal_plane: bool,
    /// Laser lines acquired at each plane
    pub sequence: Vec<ImagingLine>,
    /// Stack file format
    #[serde(default)]
    pub file_format: FileFormat,
    /// Per-plane synchronisation
    #[serde(default)]
    pub sync: SyncConfig,
}

impl ImagingConfig {
    /// Frames acquired per stack.
    pub fn frames_per_stack(&self) -> u32 {
        self.num_z_planes * self.sequence.len() as u32
    }
}

/// Autofocus and correlation safety check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutofocusConfig {
    /// Compare each focused image against the stored reference
    #[serde(default = "default_true")]
    pub verify_with_reference: bool,
    /// Below this score the reference is replaced
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: f64,
    /// Side of the coarse grid both images are binned to
    #[serde(default = "default_grid_size")]
    pub grid_size: usize,
    /// Side of the central crop correlated against both images
    #[serde(default = "default_crop_size")]
    pub crop_size: usize,
    /// Half width of the background blur kernel, in grid pixels
    #[serde(default = "default_background_radius")]
    pub background_radius: usize,
    /// Time allowed for the search to report that it is running
    #[serde(with = "humantime_serde", default = "default_autofocus_start_timeout")]
    pub start_timeout: Duration,
    /// Time allowed for the search to finish
    #[serde(with = "humantime_serde", default = "default_autofocus_search_timeout")]
    pub search_timeout: Duration,
    /// Interval between search state polls
    #[serde(with = "humantime_serde", default = "default_autofocus_poll")]
    pub poll_interval: Duration,
    /// Reference bank of a prior run of the same sample
    #[serde(default)]
    pub reference_bank: Option<PathBuf>,
}

impl Default for AutofocusConfig {
    fn default() -> Self {
        Self {
            verify_with_reference: true,
            correlation_threshold: default_correlation_threshold(),
            grid_size: default_grid_size(),
            crop_size: default_crop_size(),
            background_radius: default_background_radius(),
            start_timeout: default_autofocus_start_timeout(),
            search_timeout: default_autofocus_search_timeout(),
            poll_interval: default_autofocus_poll(),
            reference_bank: None,
        }
    }
}

/// Positions of the stop valve used during incubation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowValveConfig {
    /// Position closing the flow
    #[serde(default = "default_flow_closed")]
    pub closed: u32,
    /// Position opening the flow
    #[serde(default = "default_flow_open")]
    pub open: u32,
}

/// Fluidics timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluidicsConfig {
    /// Buffer valve position delivering through the injection needle
    #[serde(default = "default_needle_valve_position")]
    pub needle_valve_position: u32,
    /// Minimum duration of the needle rinse
    #[serde(with = "humantime_serde", default = "default_needle_rinse")]
    pub needle_rinse: Duration,
    /// Extra wait added to the rinse
    #[serde(with = "humantime_serde", default = "default_rinse_margin")]
    pub rinse_margin: Duration,
    /// Injection volume poll cadence
    #[serde(with = "humantime_serde", default = "default_fluidics_poll")]
    pub poll_interval: Duration,
    /// Wait between stopping regulation and releasing the pressure
    #[serde(with = "humantime_serde", default = "default_settle_time")]
    pub settle_time: Duration,
    /// Incubation slice, bounding the abort latency
    #[serde(with = "humantime_serde", default = "default_incubation_slice")]
    pub incubation_slice: Duration,
    /// Needle and stage motion poll cadence
    #[serde(with = "humantime_serde", default = "default_motion_poll")]
    pub motion_poll: Duration,
    /// Optional stop valve closed during incubation
    #[serde(default)]
    pub flow_valve: Option<FlowValveConfig>,
}

impl Default for FluidicsConfig {
    fn default() -> Self {
        Self {
            needle_valve_position: default_needle_valve_position(),
            needle_rinse: default_needle_rinse(),
            rinse_margin: default_rinse_margin(),
            poll_interval: default_fluidics_poll(),
            settle_time: default_settle_time(),
            incubation_slice: default_incubation_slice(),
            motion_poll: default_motion_poll(),
            flow_valve: None,
        }
    }
}

/// Vendor files renamed on upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    /// Directory the vendor software writes into
    pub directory: PathBuf,
    /// File name pattern (regex) selecting vendor files
    #[serde(default = "default_vendor_pattern")]
    pub pattern: String,
}

/// Background transfer to the network store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Whether files are uploaded during the run
    #[serde(default)]
    pub enabled: bool,
    /// Network root mirrored by the upload worker
    #[serde(default)]
    pub network_path: Option<PathBuf>,
    /// Host pinged before every upload
    #[serde(default = "default_probe_host")]
    pub probe_host: String,
    /// Longest wait for an in-flight upload before transfer is disabled
    #[serde(with = "humantime_serde", default = "default_busy_timeout")]
    pub busy_timeout: Duration,
    /// Poll cadence while waiting for the upload slot
    #[serde(with = "humantime_serde", default = "default_drain_interval")]
    pub drain_interval: Duration,
    /// Vendor files requiring rename on upload
    #[serde(default)]
    pub vendor: Option<VendorConfig>,
    /// Operator address alerted when the run aborts on focus loss
    #[serde(default)]
    pub alert_email: Option<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            network_path: None,
            probe_host: default_probe_host(),
            busy_timeout: default_busy_timeout(),
            drain_interval: default_drain_interval(),
            vendor: None,
            alert_email: None,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "him_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}


fn default_true() -> bool {
    true
}

fn default_ready_line() -> u32 {
    1
}

fn default_exposure_line() -> u32 {
    2
}

fn default_trigger_retry_limit() -> u32 {
    10_000
}

fn default_trigger_poll() -> Duration {
    Duration::from_millis(1)
}

fn default_acquisition_ready_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_correlation_threshold() -> f64 {
    0.6
}

fn default_grid_size() -> usize {
    512
}

fn default_crop_size() -> usize {
    256
}

fn default_background_radius() -> usize {
    32
}

fn default_autofocus_start_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_autofocus_search_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_autofocus_poll() -> Duration {
    Duration::from_millis(500)
}

fn default_flow_closed() -> u32 {
    1
}

fn default_flow_open() -> u32 {
    2
}

fn default_needle_valve_position() -> u32 {
    7
}

fn default_needle_rinse() -> Duration {
    Duration::from_secs(30)
}

fn default_rinse_margin() -> Duration {
    Duration::from_secs(5)
}

fn default_fluidics_poll() -> Duration {
    Duration::from_secs(1)
}

fn default_settle_time() -> Duration {
    Duration::from_secs(1)
}

fn default_incubation_slice() -> Duration {
    Duration::from_secs(30)
}

fn default_motion_poll() -> Duration {
    Duration::from_millis(100)
}

fn default_vendor_pattern() -> String {
    r"\.czi$".to_string()
}

fn default_probe_host() -> String {
    "8.8.8.8".to_string()
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_drain_interval() -> Duration {
    Duration::from_secs(1)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl RunConfig {
    /// Load configuration from a TOML or YAML file and `HIM_` environment variables.
    ///
    /// Environment variables take precedence over the file. The result is validated.
    ///
    /// # Errors
    ///
    /// Returns `HimError::Config` if the file cannot be read or a required key is missing,
    /// and `HimError::Configuration` if a value is out of range.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
            _ => Figment::new().merge(Toml::file(path)),
        };
        Self::from_figment(figment.merge(Env::prefixed("HIM_").split("__")))
    }

    /// Extract and validate a configuration from an already assembled figment.
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns `HimError::Configuration` naming the offending key.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(HimError::Configuration(format!(
                "Invalid application.log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.experiment.sample_name.trim().is_empty() {
            return Err(HimError::Configuration(
                "experiment.sample_name cannot be empty".to_string(),
            ));
        }

        if self.imaging.num_z_planes == 0 {
            return Err(HimError::Configuration(
                "imaging.num_z_planes must be at least 1".to_string(),
            ));
        }
        if !(self.imaging.z_step_um > 0.0) {
            return Err(HimError::Configuration(format!(
                "Invalid imaging.z_step_um {}. Must be positive",
                self.imaging.z_step_um
            )));
        }
        if self.imaging.sequence.is_empty() {
            return Err(HimError::Configuration(
                "imaging.sequence must contain at least one line".to_string(),
            ));
        }
        for line in &self.imaging.sequence {
            if !(0.0..=100.0).contains(&line.intensity) {
                return Err(HimError::Configuration(format!(
                    "Invalid imaging.sequence intensity {} for {} nm. Must be 0-100",
                    line.intensity, line.wavelength
                )));
            }
            if self.imaging.sync.mode == SyncMode::CameraExposure && line.ttl_line.is_none() {
                return Err(HimError::Configuration(format!(
                    "imaging.sequence line {} nm needs ttl_line in camera_exposure sync mode",
                    line.wavelength
                )));
            }
        }
        if self.imaging.sync.trigger_retry_limit == 0 {
            return Err(HimError::Configuration(
                "imaging.sync.trigger_retry_limit must be at least 1".to_string(),
            ));
        }

        let af = &self.autofocus;
        if !(0.0..=1.0).contains(&af.correlation_threshold) {
            return Err(HimError::Configuration(format!(
                "Invalid autofocus.correlation_threshold {}. Must be 0-1",
                af.correlation_threshold
            )));
        }
        if af.crop_size == 0 || af.crop_size >= af.grid_size {
            return Err(HimError::Configuration(format!(
                "autofocus.crop_size {} must be positive and smaller than autofocus.grid_size {}",
                af.crop_size, af.grid_size
            )));
        }
        if af.poll_interval.is_zero() {
            return Err(HimError::Configuration(
                "autofocus.poll_interval must be positive".to_string(),
            ));
        }

        let fl = &self.fluidics;
        if fl.incubation_slice.is_zero() || fl.poll_interval.is_zero() || fl.motion_poll.is_zero()
        {
            return Err(HimError::Configuration(
                "fluidics.incubation_slice, fluidics.poll_interval and fluidics.motion_poll \
                 must be positive"
                    .to_string(),
            ));
        }

        if self.transfer.enabled && self.transfer.network_path.is_none() {
            return Err(HimError::Configuration(
                "transfer.network_path is required when transfer.enabled is true".to_string(),
            ));
        }
        if let Some(vendor) = &self.transfer.vendor {
            regex::Regex::new(&vendor.pattern).map_err(|e| {
                HimError::Configuration(format!(
                    "Invalid transfer.vendor.pattern '{}': {}",
                    vendor.pattern, e
                ))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[experiment]
sample_name = "embryo_01"
save_path = "/data"
roi_list_path = "/data/rois.json"
injections_path = "/data/injections.yml"

[imaging]
num_z_planes = 60
z_step_um = 0.25
sequence = [{ wavelength = 561, intensity = 20.0 }]
"#;

    fn minimal() -> RunConfig {
        RunConfig::from_figment(Figment::new().merge(Toml::string(MINIMAL))).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = minimal();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.fluidics.needle_valve_position, 7);
        assert_eq!(config.fluidics.needle_rinse, Duration::from_secs(30));
        assert_eq!(config.fluidics.incubation_slice, Duration::from_secs(30));
        assert_eq!(config.autofocus.grid_size, 512);
        assert_eq!(config.autofocus.crop_size, 256);
        assert_eq!(config.transfer.busy_timeout, Duration::from_secs(300));
        assert_eq!(config.imaging.sync.trigger_retry_limit, 10_000);
        assert_eq!(config.imaging.file_format, FileFormat::Tif);
        assert!(!config.transfer.enabled);
        assert_eq!(config.experiment.file_prefix, None);
        assert_eq!(config.imaging.frames_per_stack(), 60);
    }

    #[test]
    fn test_humantime_durations() {
        let source = format!(
            "{MINIMAL}\n[fluidics]\nneedle_rinse = \"1m\"\nincubation_slice = \"10s\"\n"
        );
        let config = RunConfig::from_figment(Figment::new().merge(Toml::string(&source))).unwrap();
        assert_eq!(config.fluidics.needle_rinse, Duration::from_secs(60));
        assert_eq!(config.fluidics.incubation_slice, Duration::from_secs(10));
    }

    #[test]
    fn test_missing_required_key() {
        let source = MINIMAL.replace("sample_name = \"embryo_01\"\n", "");
        let err = RunConfig::from_figment(Figment::new().merge(Toml::string(&source))).unwrap_err();
        assert!(matches!(err, HimError::Config(_)));
        assert!(err.to_string().contains("sample_name"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = minimal();
        config.application.log_level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("application.log_level"));
    }

    #[test]
    fn test_crop_must_fit_grid() {
        let mut config = minimal();
        config.autofocus.crop_size = 512;
        assert!(matches!(
            config.validate(),
            Err(HimError::Configuration(msg)) if msg.contains("crop_size")
        ));
    }

    #[test]
    fn test_threshold_range() {
        let mut config = minimal();
        config.autofocus.correlation_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transfer_requires_network_path() {
        let mut config = minimal();
        config.transfer.enabled = true;
        assert!(config.validate().is_err());
        config.transfer.network_path = Some(PathBuf::from("/mnt/share"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_camera_exposure_requires_ttl_lines() {
        let mut config = minimal();
        config.imaging.sync.mode = SyncMode::CameraExposure;
        assert!(config.validate().is_err());
        config.imaging.sequence[0].ttl_line = Some(3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            file,
            "experiment:\n  sample_name: s1\n  save_path: /tmp\n  roi_list_path: r.json\n  \
             injections_path: i.yml\nimaging:\n  num_z_planes: 3\n  z_step_um: 0.5\n  \
             sequence:\n    - wavelength: 488\n      intensity: 10\n"
        )
        .unwrap();
        let config = RunConfig::load_from(file.path()).unwrap();
        assert_eq!(config.experiment.sample_name, "s1");
        assert_eq!(config.imaging.sequence[0].wavelength, 488);
    }
}
