//! Experiment orchestration
//!
//! Runs a Hi-M protocol: for each probe, inject and incubate (Hybridization), image every
//! ROI with autofocus (Imaging), inject again (Photobleaching) and rinse the needle.
//!
//! # Architecture
//!
//! - **HiMTask** (`task`): start / step / pause / resume / cleanup lifecycle
//! - **ProbeCycleScheduler** (`scheduler`): one probe cycle per step, in protocol order
//! - **InjectionExecutor** (`injection`): injections, incubations, valves, rinse
//! - **ImagingCycleController** (`imaging`): ROI loop and z-stacks
//! - **AutofocusSafetyMonitor** (`autofocus`): focus search, two-strikes abort, reference
//!   check based on `correlation`
//!
//! Inputs are parsed by `protocol` and `roi`; run state is written by `records`,
//! `reference` and `status`.
//!
//! # Example
//!
//! ```rust,ignore
//! use him_daq::experiment::{run_task, HiMTask, TaskServices};
//! use him_daq::hardware::mock::SimulatedRig;
//!
//! let rig = SimulatedRig::default();
//! let services = TaskServices::from_config(&config.transfer);
//! let mut task = HiMTask::new(config, rig.instruments(), services);
//! let final_state = run_task(&mut task).await;
//! ```

pub mod autofocus;
pub mod correlation;
pub mod imaging;
pub mod injection;
pub mod protocol;
pub mod records;
pub mod reference;
pub mod roi;
pub mod scheduler;
pub mod status;
pub mod task;

pub use autofocus::{AutofocusSafetyMonitor, FocusLossCounter, FocusOutcome, FocusVerdict};
pub use imaging::{ImagingCycleController, ImagingSummary};
pub use injection::{InjectionExecutor, InjectionReport};
pub use protocol::{FluidicStep, InjectionProtocol, Probe, ProbeList};
pub use roi::{Roi, RoiSet};
pub use scheduler::{NeedleTracker, ProbeCycleScheduler};
pub use status::{Process, RunStatus, StatusBoard};
pub use task::{run_task, HiMTask, InterruptableTask, TaskServices, TaskState};
