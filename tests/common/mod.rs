//! Common test utilities for him_daq integration tests
//!
//! This module provides reusable test helpers for:
//! - Timing assertions with appropriate tolerances
//! - A run fixture: temporary run inputs, configuration and a simulated rig

#![allow(dead_code)] // Utilities may not all be used by every test file

use figment::providers::{Format, Toml};
use figment::Figment;
use him_daq::alert::OperatorAlert;
use him_daq::config::RunConfig;
use him_daq::experiment::{HiMTask, TaskServices};
use him_daq::hardware::mock::SimulatedRig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Tolerance levels for timing assertions.
#[derive(Debug, Clone, Copy)]
pub enum TimingTolerance {
    /// Exact match - only for simulated time with `start_paused = true`
    Exact,
    /// 5% tolerance
    Tight,
    /// 20% tolerance
    Normal,
}

impl TimingTolerance {
    /// Get the tolerance factor as a fraction (0.0 to 1.0)
    pub fn factor(&self) -> f64 {
        match self {
            TimingTolerance::Exact => 0.0,
            TimingTolerance::Tight => 0.05,
            TimingTolerance::Normal => 0.20,
        }
    }
}

/// Assert that a duration is within tolerance of an expected value.
///
/// # Panics
/// Panics if the actual duration is outside the tolerance range.
pub fn assert_duration_near(
    actual: Duration,
    expected: Duration,
    tolerance: TimingTolerance,
    context: &str,
) {
    let factor = tolerance.factor();
    let min = expected.mul_f64(1.0 - factor);
    let max = expected.mul_f64(1.0 + factor);

    assert!(
        actual >= min && actual <= max,
        "{}: expected {:?} ±{:.0}%, got {:?} (acceptable range: {:?} to {:?})",
        context,
        expected,
        factor * 100.0,
        actual,
        min,
        max
    );
}

/// Two-step hybridization: one probe injection, a one-minute incubation.
pub const HYBRIDIZATION: &str = r#"
  - {step_number: 1, product: Probe, volume: 150, flowrate: 150, time: null}
  - {step_number: 2, product: null, volume: null, flowrate: null, time: 60}
"#;

/// Hybridization drawing three times through the needle valve.
pub const TRIPLE_NEEDLE_HYBRIDIZATION: &str = r#"
  - {step_number: 1, product: Probe, volume: 100, flowrate: 200, time: null}
  - {step_number: 2, product: Wash, volume: 100, flowrate: 200, time: null}
  - {step_number: 3, product: Probe, volume: 100, flowrate: 200, time: null}
  - {step_number: 4, product: Probe, volume: 100, flowrate: 200, time: null}
"#;

/// Temporary run: inputs on disk, configuration, simulated rig.
pub struct RunFixture {
    /// Holds `injections.yml`, `rois.json` and the `data/` save path
    pub dir: TempDir,
    pub rig: SimulatedRig,
    pub config: RunConfig,
}

impl RunFixture {
    /// `probes` are `(tube, name)` pairs; `hybridization` is the YAML list body.
    pub fn new(probes: &[(u32, &str)], hybridization: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), probes, hybridization);
        let config = config_for(dir.path(), "");
        Self {
            dir,
            rig: SimulatedRig::new(256, 256, 2),
            config,
        }
    }

    /// Same run with extra TOML merged over the configuration.
    pub fn with_config(mut self, extra: &str) -> Self {
        self.config = config_for(self.dir.path(), extra);
        self
    }

    /// Task on the simulated rig with the configured services.
    pub fn task(&self) -> HiMTask {
        self.task_with(TaskServices::from_config(&self.config.transfer))
    }

    /// Task on the simulated rig with `services`.
    pub fn task_with(&self, services: TaskServices) -> HiMTask {
        HiMTask::new(self.config.clone(), self.rig.instruments(), services)
    }

    /// Services built from the configuration, alerting through `alert`.
    pub fn services_with_alert(&self, alert: Arc<dyn OperatorAlert>) -> TaskServices {
        TaskServices {
            alert,
            ..TaskServices::from_config(&self.config.transfer)
        }
    }
}

/// Photobleaching list body shared by every fixture.
const PHOTOBLEACHING: &str =
    "  - {step_number: 1, product: Wash, volume: 100, flowrate: 200, time: null}\n";

fn write_inputs(dir: &Path, probes: &[(u32, &str)], hybridization: &str) {
    let probe_map: Vec<String> = probes
        .iter()
        .map(|(tube, name)| format!("{tube}: {name}"))
        .collect();
    let document = format!(
        "buffer: {{1: Wash, 2: SSC, 7: Probe}}\n\
         probes: {{{}}}\n\
         hybridization list:{hybridization}\
         photobleaching list:\n{PHOTOBLEACHING}",
        probe_map.join(", ")
    );
    std::fs::write(dir.join("injections.yml"), document).unwrap();

    let rois = r#"{
        "name": "fixture",
        "rois": [
            {"name": "ROI_001", "position": [0.0, 0.0, 10.0]},
            {"name": "ROI_002", "position": [150.0, 0.0, 11.0]}
        ]
    }"#;
    std::fs::write(dir.join("rois.json"), rois).unwrap();
}

fn config_for(dir: &Path, extra: &str) -> RunConfig {
    let source = format!(
        r#"
[experiment]
sample_name = "fixture"
save_path = '{root}/data'
roi_list_path = '{root}/rois.json'
injections_path = '{root}/injections.yml'

[imaging]
num_z_planes = 4
z_step_um = 0.5
centered_focal_plane = true
sequence = [{{ wavelength = 561, intensity = 20.0 }}]

[autofocus]
grid_size = 128
crop_size = 64
background_radius = 8
"#,
        root = dir.display()
    );
    // merged key by key, so `extra` may extend tables defined above
    let figment = Figment::new()
        .merge(Toml::string(&source))
        .merge(Toml::string(extra));
    RunConfig::from_figment(figment).unwrap()
}
