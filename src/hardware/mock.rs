//! Simulated Hardware Implementations
//!
//! Provides a simulated Hi-M rig for testing without physical hardware.
//! All simulated devices use async-safe operations (`tokio::time`), so a test running with
//! `start_paused = true` executes multi-minute protocols instantly with faithful timing.
//!
//! # Available Simulations
//!
//! - `SimFlow` - flow controller reaching its volume after `volume / flowrate * 60` s
//! - `SimValves` - valve bank recording every commanded position
//! - `SimNeedle` - needle positioner with a fixed travel time
//! - `SimStage` - XY stage with a fixed travel time
//! - `SimFocus` - focus drive with scripted autofocus outcomes
//! - `SimCamera` - camera producing a seeded textured frame and writing small stack files
//! - `SimTriggers` - digital lines emulating the FPGA ready line and the camera exposure output
//! - `SimControls` - external controls counting disable/enable calls
//!
//! `SimulatedRig` builds the whole set and hands out an [`Instruments`] bundle.

use anyhow::{bail, Result};
use async_trait::async_trait;
use ndarray::Array2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use crate::config::FileFormat;
use crate::experiment::roi::Roi;
use crate::hardware::capabilities::{
    CameraController, ExternalControls, FlowController, FocusController, NeedlePositioner,
    StagePositioner, TriggerIO, ValveBank, ValveController,
};
use crate::hardware::Instruments;

// =============================================================================
// SimFlow - Simulated Flow Controller
// =============================================================================

#[derive(Debug, Default)]
struct FlowState {
    pressure: f64,
    flowrate: Option<f64>,
    measurement: Option<(f64, Instant)>,
    injections: u32,
    rinses: Vec<Duration>,
}

/// Simulated pressure controller and flowmeter.
///
/// While regulating at `flowrate` µl/min, a volume measurement toward `target` µl
/// completes `target / flowrate * 60` seconds after it was started.
#[derive(Debug, Default)]
pub struct SimFlow {
    state: RwLock<FlowState>,
    fail_regulation: AtomicBool,
}

impl SimFlow {
    /// Idle controller at zero pressure.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `start_regulation` fail, emulating a disconnected controller.
    pub fn fail_regulation(&self, fail: bool) {
        self.fail_regulation.store(fail, Ordering::SeqCst);
    }

    /// Last commanded pressure in mbar.
    pub async fn pressure(&self) -> f64 {
        self.state.read().await.pressure
    }

    /// A regulation loop is running.
    pub async fn is_regulating(&self) -> bool {
        self.state.read().await.flowrate.is_some()
    }

    /// Number of regulations started.
    pub async fn injections(&self) -> u32 {
        self.state.read().await.injections
    }

    /// Durations of the rinses requested so far.
    pub async fn rinses(&self) -> Vec<Duration> {
        self.state.read().await.rinses.clone()
    }
}

#[async_trait]
impl FlowController for SimFlow {
    async fn set_pressure(&self, mbar: f64) -> Result<()> {
        self.state.write().await.pressure = mbar;
        Ok(())
    }

    async fn start_regulation(&self, flowrate: f64) -> Result<()> {
        if self.fail_regulation.load(Ordering::SeqCst) {
            bail!("SimFlow: regulation loop unavailable");
        }
        let mut state = self.state.write().await;
        state.flowrate = Some(flowrate);
        state.injections += 1;
        tracing::debug!(flowrate, "SimFlow: regulating");
        Ok(())
    }

    async fn stop_regulation(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.flowrate = None;
        state.measurement = None;
        Ok(())
    }

    async fn start_volume_measurement(&self, target: f64) -> Result<()> {
        self.state.write().await.measurement = Some((target, Instant::now()));
        Ok(())
    }

    async fn target_volume_reached(&self) -> Result<bool> {
        let state = self.state.read().await;
        match (state.flowrate, state.measurement) {
            (Some(flowrate), Some((target, started))) if flowrate > 0.0 => {
                let needed =
                    Duration::try_from_secs_f64(target / flowrate * 60.0).unwrap_or(Duration::MAX);
                Ok(started.elapsed() >= needed)
            }
            _ => Ok(false),
        }
    }

    async fn start_rinsing(&self, duration: Duration) -> Result<()> {
        self.state.write().await.rinses.push(duration);
        Ok(())
    }
}

// =============================================================================
// SimValves - Simulated Valve Bank
// =============================================================================

/// Simulated valves. Every commanded position is kept in order.
#[derive(Debug, Default)]
pub struct SimValves {
    positions: RwLock<HashMap<ValveBank, u32>>,
    history: RwLock<Vec<(ValveBank, u32)>>,
}

impl SimValves {
    /// Valves with no position commanded yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position of `bank`, if it was ever set.
    pub async fn position(&self, bank: ValveBank) -> Option<u32> {
        self.positions.read().await.get(&bank).copied()
    }

    /// Every `(bank, position)` command, in order.
    pub async fn history(&self) -> Vec<(ValveBank, u32)> {
        self.history.read().await.clone()
    }
}

#[async_trait]
impl ValveController for SimValves {
    async fn set_position(&self, bank: ValveBank, position: u32) -> Result<()> {
        self.positions.write().await.insert(bank, position);
        self.history.write().await.push((bank, position));
        Ok(())
    }

    async fn wait_for_idle(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}

// =============================================================================
// SimNeedle / SimStage - Simulated Motion
// =============================================================================

/// Simulated injection needle taking `travel` per move.
#[derive(Debug)]
pub struct SimNeedle {
    origin_defined: AtomicBool,
    travel: Duration,
    moving_until: RwLock<Option<Instant>>,
    moves: RwLock<Vec<u32>>,
}

impl SimNeedle {
    /// Homed needle with a two second travel.
    pub fn new() -> Self {
        Self {
            origin_defined: AtomicBool::new(true),
            travel: Duration::from_secs(2),
            moving_until: RwLock::new(None),
            moves: RwLock::new(Vec::new()),
        }
    }

    /// Emulate a needle whose reference position was never set.
    pub fn set_origin_defined(&self, defined: bool) {
        self.origin_defined.store(defined, Ordering::SeqCst);
    }

    /// Tubes the needle was sent to, in order.
    pub async fn moves(&self) -> Vec<u32> {
        self.moves.read().await.clone()
    }
}

impl Default for SimNeedle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NeedlePositioner for SimNeedle {
    async fn start_move_to(&self, tube: u32) -> Result<()> {
        self.moves.write().await.push(tube);
        *self.moving_until.write().await = Some(Instant::now() + self.travel);
        Ok(())
    }

    async fn is_moving(&self) -> Result<bool> {
        Ok(matches!(*self.moving_until.read().await, Some(until) if Instant::now() < until))
    }

    async fn origin_defined(&self) -> Result<bool> {
        Ok(self.origin_defined.load(Ordering::SeqCst))
    }
}

/// Simulated XY stage taking `travel` per ROI move.
#[derive(Debug)]
pub struct SimStage {
    travel: Duration,
    moving_until: RwLock<Option<Instant>>,
    visited: RwLock<Vec<String>>,
}

impl SimStage {
    /// Stage with a 500 ms travel per move.
    pub fn new() -> Self {
        Self {
            travel: Duration::from_millis(500),
            moving_until: RwLock::new(None),
            visited: RwLock::new(Vec::new()),
        }
    }

    /// ROI names visited, in order.
    pub async fn visited(&self) -> Vec<String> {
        self.visited.read().await.clone()
    }
}

impl Default for SimStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StagePositioner for SimStage {
    async fn move_to_roi(&self, roi: &Roi) -> Result<()> {
        self.visited.write().await.push(roi.name.clone());
        *self.moving_until.write().await = Some(Instant::now() + self.travel);
        Ok(())
    }

    async fn is_moving(&self) -> Result<bool> {
        Ok(matches!(*self.moving_until.read().await, Some(until) if Instant::now() < until))
    }
}

// =============================================================================
// SimFocus - Simulated Focus Drive
// =============================================================================

#[derive(Debug, Default)]
struct FocusState {
    position: f64,
    search_until: Option<Instant>,
    locked: bool,
    scripted: VecDeque<bool>,
    searches: u32,
    relative_moves: Vec<f64>,
}

/// Simulated focus drive.
///
/// A search runs for one second. Its outcome is popped from the scripted queue, and an
/// empty queue means the focus is found.
#[derive(Debug)]
pub struct SimFocus {
    calibrated: AtomicBool,
    state: RwLock<FocusState>,
}

impl SimFocus {
    /// Calibrated drive parked at 25 µm.
    pub fn new() -> Self {
        Self {
            calibrated: AtomicBool::new(true),
            state: RwLock::new(FocusState {
                position: 25.0,
                ..FocusState::default()
            }),
        }
    }

    /// Emulate an uncalibrated autofocus.
    pub fn set_calibrated(&self, calibrated: bool) {
        self.calibrated.store(calibrated, Ordering::SeqCst);
    }

    /// Queue the outcomes (`true` = found) of the next searches.
    pub async fn script_outcomes(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.state.write().await.scripted.extend(outcomes);
    }

    /// Number of searches started.
    pub async fn searches(&self) -> u32 {
        self.state.read().await.searches
    }

    /// Relative moves in µm, in order.
    pub async fn relative_moves(&self) -> Vec<f64> {
        self.state.read().await.relative_moves.clone()
    }
}

impl Default for SimFocus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FocusController for SimFocus {
    async fn is_calibrated(&self) -> Result<bool> {
        Ok(self.calibrated.load(Ordering::SeqCst))
    }

    async fn start_autofocus(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.searches += 1;
        state.locked = state.scripted.pop_front().unwrap_or(true);
        state.search_until = Some(Instant::now() + Duration::from_secs(1));
        Ok(())
    }

    async fn search_running(&self) -> Result<bool> {
        Ok(matches!(self.state.read().await.search_until, Some(until) if Instant::now() < until))
    }

    async fn is_stable(&self) -> Result<bool> {
        Ok(self.state.read().await.locked)
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.state.read().await.position)
    }

    async fn go_to_position(&self, z_um: f64) -> Result<()> {
        self.state.write().await.position = z_um;
        Ok(())
    }

    async fn move_relative(&self, dz_um: f64) -> Result<()> {
        let mut state = self.state.write().await;
        state.position += dz_um;
        state.relative_moves.push(dz_um);
        Ok(())
    }
}

// =============================================================================
// SimCamera - Simulated Camera
// =============================================================================

/// Simulated camera.
///
/// `snap` returns the same seeded texture on every call until `scramble` is enabled, after
/// which every frame is fresh noise uncorrelated with the first one.
#[derive(Debug)]
pub struct SimCamera {
    resolution: (usize, usize),
    seed: u64,
    scramble: AtomicBool,
    snaps: AtomicU64,
    armed_frames: RwLock<Option<u32>>,
    saved: RwLock<Vec<PathBuf>>,
}

impl SimCamera {
    /// Create a camera producing `width` x `height` frames.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            resolution: (height, width),
            seed: 0x5eed,
            scramble: AtomicBool::new(false),
            snaps: AtomicU64::new(0),
            armed_frames: RwLock::new(None),
            saved: RwLock::new(Vec::new()),
        }
    }

    /// Return fresh noise from every `snap`.
    pub fn set_scramble(&self, scramble: bool) {
        self.scramble.store(scramble, Ordering::SeqCst);
    }

    /// Stack files written so far.
    pub async fn saved(&self) -> Vec<PathBuf> {
        self.saved.read().await.clone()
    }

    /// Frames of the armed acquisition, `None` once stopped.
    pub async fn armed(&self) -> Option<u32> {
        *self.armed_frames.read().await
    }

    fn texture(&self, seed: u64) -> Array2<u16> {
        let mut rng = StdRng::seed_from_u64(seed);
        let (rows, cols) = self.resolution;
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            let background =
                800.0 + 200.0 * (r as f64 / rows as f64) + 100.0 * (c as f64 / cols as f64);
            (background + rng.gen_range(0.0..2000.0)) as u16
        })
    }
}

impl Default for SimCamera {
    fn default() -> Self {
        Self::new(512, 512)
    }
}

#[async_trait]
impl CameraController for SimCamera {
    async fn start_acquisition(&self, frames: u32) -> Result<()> {
        *self.armed_frames.write().await = Some(frames);
        Ok(())
    }

    async fn stop_acquisition(&self) -> Result<()> {
        *self.armed_frames.write().await = None;
        Ok(())
    }

    async fn snap(&self) -> Result<Array2<u16>> {
        let count = self.snaps.fetch_add(1, Ordering::SeqCst);
        // 33ms readout
        tokio::time::sleep(Duration::from_millis(33)).await;
        if self.scramble.load(Ordering::SeqCst) {
            Ok(self.texture(self.seed.wrapping_add(count + 1)))
        } else {
            Ok(self.texture(self.seed))
        }
    }

    async fn save_as(&self, stem: &Path, format: FileFormat) -> Result<Vec<PathBuf>> {
        let frames = self.armed_frames.read().await.unwrap_or(0);
        if let Some(parent) = stem.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = stem.with_extension(format.extension());
        let metadata = stem.with_extension("yaml");
        std::fs::write(&data, vec![0u8; frames as usize * 16])?;
        std::fs::write(
            &metadata,
            format!("frames: {frames}\nformat: {}\n", format.extension()),
        )?;
        let written = vec![data, metadata];
        self.saved.write().await.extend(written.iter().cloned());
        Ok(written)
    }
}

// =============================================================================
// SimTriggers - Simulated Digital Lines
// =============================================================================

/// Simulated digital I/O.
///
/// The exposure line toggles on every read, emulating a camera exposing frame after frame.
/// Every other input reads high (the FPGA acknowledges each plane) while `responding`.
#[derive(Debug)]
pub struct SimTriggers {
    exposure_line: u32,
    responding: AtomicBool,
    exposure: AtomicBool,
    pulses: AtomicU32,
    write_limit: AtomicU32,
    writes: RwLock<Vec<(u32, bool)>>,
}

impl SimTriggers {
    /// Responding lines with the camera exposure output on `exposure_line`.
    pub fn new(exposure_line: u32) -> Self {
        Self {
            exposure_line,
            responding: AtomicBool::new(true),
            exposure: AtomicBool::new(false),
            pulses: AtomicU32::new(0),
            write_limit: AtomicU32::new(u32::MAX),
            writes: RwLock::new(Vec::new()),
        }
    }

    /// When `false`, every input stays low and handshakes time out.
    pub fn set_responding(&self, responding: bool) {
        self.responding.store(responding, Ordering::SeqCst);
    }

    /// Let the next `writes` output writes succeed and fail every later one.
    pub async fn fail_writes_after(&self, writes: u32) {
        let done = self.writes.read().await.len() as u32;
        self.write_limit.store(done.saturating_add(writes), Ordering::SeqCst);
    }

    /// Number of rising edges written on any output.
    pub fn pulses(&self) -> u32 {
        self.pulses.load(Ordering::SeqCst)
    }

    /// Every `(line, level)` write, in order.
    pub async fn writes(&self) -> Vec<(u32, bool)> {
        self.writes.read().await.clone()
    }
}

impl Default for SimTriggers {
    fn default() -> Self {
        Self::new(2)
    }
}

#[async_trait]
impl TriggerIO for SimTriggers {
    async fn read_digital(&self, channel: u32) -> Result<bool> {
        if !self.responding.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if channel == self.exposure_line {
            // fetch_xor returns the previous level
            return Ok(!self.exposure.fetch_xor(true, Ordering::SeqCst));
        }
        Ok(true)
    }

    async fn write_digital(&self, channel: u32, value: bool) -> Result<()> {
        let written = self.writes.read().await.len() as u32;
        if written >= self.write_limit.load(Ordering::SeqCst) {
            bail!("SimTriggers: output {channel} not responding");
        }
        if value {
            self.pulses.fetch_add(1, Ordering::SeqCst);
        }
        self.writes.write().await.push((channel, value));
        Ok(())
    }
}

// =============================================================================
// SimControls - Simulated External Controls
// =============================================================================

/// External controls counting every lock and unlock.
#[derive(Debug, Default)]
pub struct SimControls {
    disabled: AtomicU32,
    enabled: AtomicU32,
    released: AtomicU32,
}

impl SimControls {
    /// Controls never locked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls to `disable_all`.
    pub fn disable_count(&self) -> u32 {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Calls to `enable_all`.
    pub fn enable_count(&self) -> u32 {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Calls to `release_sessions`.
    pub fn release_count(&self) -> u32 {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalControls for SimControls {
    async fn disable_all(&self) -> Result<()> {
        self.disabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn enable_all(&self) -> Result<()> {
        self.enabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release_sessions(&self) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// SimulatedRig
// =============================================================================

/// A complete simulated rig. Tests keep the rig to inspect and script the devices.
#[derive(Clone)]
pub struct SimulatedRig {
    /// Pressure controller and flowmeter
    pub flow: Arc<SimFlow>,
    /// Buffer, needle and flow valves
    pub valves: Arc<SimValves>,
    /// Injection needle
    pub needle: Arc<SimNeedle>,
    /// XY stage
    pub stage: Arc<SimStage>,
    /// Focus drive and autofocus
    pub focus: Arc<SimFocus>,
    /// Camera
    pub camera: Arc<SimCamera>,
    /// Digital lines
    pub triggers: Arc<SimTriggers>,
    /// External controls
    pub controls: Arc<SimControls>,
}

impl SimulatedRig {
    /// Rig with a `width` x `height` camera and the camera exposure output on `exposure_line`.
    pub fn new(width: usize, height: usize, exposure_line: u32) -> Self {
        Self {
            flow: Arc::new(SimFlow::new()),
            valves: Arc::new(SimValves::new()),
            needle: Arc::new(SimNeedle::new()),
            stage: Arc::new(SimStage::new()),
            focus: Arc::new(SimFocus::new()),
            camera: Arc::new(SimCamera::new(width, height)),
            triggers: Arc::new(SimTriggers::new(exposure_line)),
            controls: Arc::new(SimControls::new()),
        }
    }

    /// The rig as capability trait objects.
    pub fn instruments(&self) -> Instruments {
        Instruments {
            flow: self.flow.clone(),
            valves: self.valves.clone(),
            needle: self.needle.clone(),
            stage: self.stage.clone(),
            focus: self.focus.clone(),
            camera: self.camera.clone(),
            triggers: self.triggers.clone(),
            controls: self.controls.clone(),
        }
    }
}

impl Default for SimulatedRig {
    fn default() -> Self {
        Self::new(512, 512, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_flow_reaches_volume_on_time() {
        let flow = SimFlow::new();
        flow.start_regulation(150.0).await.unwrap();
        flow.start_volume_measurement(300.0).await.unwrap();
        tokio::time::sleep(Duration::from_secs(119)).await;
        assert!(!flow.target_volume_reached().await.unwrap());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(flow.target_volume_reached().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_needle_motion() {
        let needle = SimNeedle::new();
        needle.start_move_to(3).await.unwrap();
        assert!(needle.is_moving().await.unwrap());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!needle.is_moving().await.unwrap());
        assert_eq!(needle.moves().await, vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_focus() {
        let focus = SimFocus::new();
        focus.script_outcomes([false]).await;
        focus.start_autofocus().await.unwrap();
        assert!(focus.search_running().await.unwrap());
        assert!(!focus.is_stable().await.unwrap());
        focus.start_autofocus().await.unwrap();
        assert!(focus.is_stable().await.unwrap());
        assert_eq!(focus.searches().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_texture_is_repeatable() {
        let camera = SimCamera::new(32, 16);
        let a = camera.snap().await.unwrap();
        let b = camera.snap().await.unwrap();
        assert_eq!(a.dim(), (16, 32));
        assert_eq!(a, b);
        camera.set_scramble(true);
        assert_ne!(camera.snap().await.unwrap(), a);
    }

    #[tokio::test]
    async fn test_exposure_line_toggles() {
        let io = SimTriggers::new(2);
        assert!(io.read_digital(2).await.unwrap());
        assert!(!io.read_digital(2).await.unwrap());
        assert!(io.read_digital(1).await.unwrap());
        io.set_responding(false);
        assert!(!io.read_digital(1).await.unwrap());
    }
}
