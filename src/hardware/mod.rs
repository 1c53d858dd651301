//! Hardware collaborators of the orchestration.
//!
//! - `capabilities` - the traits drivers implement
//! - `mock` - simulated rig used by tests and `him_daq run --simulate`

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    CameraController, ExternalControls, FlowController, FocusController, NeedlePositioner,
    StagePositioner, TriggerIO, ValveBank, ValveController,
};

use std::sync::Arc;

/// Every collaborator a run talks to, built once at startup.
#[derive(Clone)]
pub struct Instruments {
    /// Pressure regulation and flowmeter
    pub flow: Arc<dyn FlowController>,
    /// Buffer, needle and flow valves
    pub valves: Arc<dyn ValveController>,
    /// Injection needle over the probe tubes
    pub needle: Arc<dyn NeedlePositioner>,
    /// XY stage
    pub stage: Arc<dyn StagePositioner>,
    /// Focus drive and autofocus
    pub focus: Arc<dyn FocusController>,
    /// Camera
    pub camera: Arc<dyn CameraController>,
    /// Digital lines of the per-plane handshake
    pub triggers: Arc<dyn TriggerIO>,
    /// Manual controls locked during a run
    pub controls: Arc<dyn ExternalControls>,
}
