//! Injection sequence document: buffers, probes and the two fluidic phases.
//!
//! The document is YAML:
//!
//! ```yaml
//! buffer: {1: Wash, 2: SSC, 7: Probe}
//! probes: {1: RT1, 2: RT2}
//! hybridization list:
//!   - {step_number: 1, procedure: Hybridization, product: Probe,
//!      volume: 300, flowrate: 150, time: null}
//!   - {step_number: 2, procedure: Hybridization, product: null,
//!      volume: null, flowrate: null, time: 900}
//! photobleaching list:
//!   - {step_number: 1, procedure: Photobleaching, product: Wash,
//!      volume: 200, flowrate: 150, time: null}
//! ```
//!
//! Steps with a product are injections, steps with only a time are incubations.

use crate::error::{AppResult, HimError};
use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest injection or incubation a protocol may contain.
pub const MAX_STEP_DURATION: Duration = Duration::from_secs(48 * 3600);

/// Nominal time to push `volume` µl at `flowrate` µl/min.
///
/// Fails for values that are not finite and positive, or that last longer than
/// [`MAX_STEP_DURATION`].
pub fn injection_duration(flowrate: f64, volume: f64) -> Result<Duration, String> {
    if !(flowrate.is_finite() && flowrate > 0.0) {
        return Err(format!("flowrate {flowrate} must be finite and positive"));
    }
    if !(volume.is_finite() && volume > 0.0) {
        return Err(format!("volume {volume} must be finite and positive"));
    }
    bounded_duration(volume / flowrate * 60.0)
}

fn bounded_duration(seconds: f64) -> Result<Duration, String> {
    let duration = Duration::try_from_secs_f64(seconds)
        .map_err(|e| format!("{seconds} s is not a valid duration: {e}"))?;
    if duration > MAX_STEP_DURATION {
        return Err(format!(
            "step lasts {}, longer than {}",
            humantime::format_duration(duration),
            humantime::format_duration(MAX_STEP_DURATION)
        ));
    }
    Ok(duration)
}

/// A reagent tube processed once per cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Probe {
    /// Tube under the needle
    pub needle_position: u32,
    /// Probe name used in stack and score names
    pub name: String,
}

/// Probes ordered by ascending needle position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeList(Vec<Probe>);

impl ProbeList {
    /// Number of probes, one cycle each.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// No probe listed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Probe of cycle `index + 1`.
    pub fn get(&self, index: usize) -> Option<&Probe> {
        self.0.get(index)
    }

    /// Probes in cycle order.
    pub fn iter(&self) -> impl Iterator<Item = &Probe> {
        self.0.iter()
    }
}

impl From<BTreeMap<u32, String>> for ProbeList {
    fn from(map: BTreeMap<u32, String>) -> Self {
        Self(
            map.into_iter()
                .map(|(needle_position, name)| Probe {
                    needle_position,
                    name,
                })
                .collect(),
        )
    }
}

/// Product name to buffer valve position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferMap(BTreeMap<String, u32>);

impl BufferMap {
    /// Invert a valve to product mapping. Two valves holding the same product is an error,
    /// returned as the offending product name.
    pub fn from_valves(valves: &BTreeMap<u32, String>) -> Result<Self, String> {
        let mut inverse = BTreeMap::new();
        for (valve, product) in valves {
            if let Some(previous) = inverse.insert(product.clone(), *valve) {
                return Err(format!(
                    "product '{product}' is assigned to valves {previous} and {valve}"
                ));
            }
        }
        Ok(Self(inverse))
    }

    /// Buffer valve position connected to `product`.
    pub fn valve_for(&self, product: &str) -> Option<u32> {
        self.0.get(product).copied()
    }

    /// Number of connected buffers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// No buffer connected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One step of a fluidic phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FluidicStep {
    /// Push `volume` µl of `product` at `flowrate` µl/min.
    Injection {
        /// Buffer name as written in the document
        product: String,
        /// Buffer valve position of `product`
        valve: u32,
        /// µl/min
        flowrate: f64,
        /// µl
        volume: f64,
    },
    /// Wait with the flow closed.
    Incubation {
        /// Time to wait
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
}

impl FluidicStep {
    /// Nominal duration of the step.
    pub fn expected_duration(&self) -> Duration {
        match self {
            FluidicStep::Injection {
                flowrate, volume, ..
            } => injection_duration(*flowrate, *volume).unwrap_or(Duration::MAX),
            FluidicStep::Incubation { duration } => *duration,
        }
    }
}

impl fmt::Display for FluidicStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FluidicStep::Injection {
                product,
                flowrate,
                volume,
                ..
            } => write!(f, "inject {volume} µl of {product} at {flowrate} µl/min"),
            FluidicStep::Incubation { duration } => {
                write!(f, "incubate {}", humantime::format_duration(*duration))
            }
        }
    }
}

/// Step entry as written in the document.
#[derive(Debug, Clone, Deserialize)]
struct RawStep {
    #[serde(default)]
    step_number: Option<u32>,
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    flowrate: Option<f64>,
    #[serde(default)]
    time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    buffer: BTreeMap<u32, String>,
    probes: BTreeMap<u32, String>,
    #[serde(rename = "hybridization list")]
    hybridization: Vec<RawStep>,
    #[serde(rename = "photobleaching list")]
    photobleaching: Vec<RawStep>,
}

/// Fluidic protocol of a run, immutable once loaded.
#[derive(Debug, Clone, Serialize)]
pub struct InjectionProtocol {
    /// Buffer names by valve position
    pub buffers: BufferMap,
    /// Probes in cycle order
    pub probes: ProbeList,
    /// Steps run before imaging
    pub hybridization: Vec<FluidicStep>,
    /// Steps run after imaging, before the rinse
    pub photobleaching: Vec<FluidicStep>,
}

impl InjectionProtocol {
    /// Read and validate the document at `path`.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text, path)
    }

    /// Parse and validate a document. `origin` only names the source in errors.
    pub fn from_yaml_str(text: &str, origin: &Path) -> AppResult<Self> {
        let protocol_error = |message: String| HimError::Protocol {
            path: PathBuf::from(origin),
            message,
        };
        let raw: RawDocument =
            serde_yaml::from_str(text).map_err(|e| protocol_error(e.to_string()))?;

        let buffers = BufferMap::from_valves(&raw.buffer).map_err(&protocol_error)?;
        let probes = ProbeList::from(raw.probes);
        if probes.is_empty() {
            return Err(protocol_error("no probes defined".to_string()));
        }

        let hybridization = convert_phase(&raw.hybridization, &buffers, "hybridization")
            .map_err(&protocol_error)?;
        let photobleaching = convert_phase(&raw.photobleaching, &buffers, "photobleaching")
            .map_err(&protocol_error)?;

        Ok(Self {
            buffers,
            probes,
            hybridization,
            photobleaching,
        })
    }

    /// Nominal fluidics time of one probe cycle.
    pub fn expected_cycle_duration(&self) -> Duration {
        self.hybridization
            .iter()
            .chain(self.photobleaching.iter())
            .map(FluidicStep::expected_duration)
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

fn convert_phase(
    steps: &[RawStep],
    buffers: &BufferMap,
    phase: &str,
) -> Result<Vec<FluidicStep>, String> {
    steps
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            let number = raw.step_number.unwrap_or(index as u32 + 1);
            convert_step(raw, buffers).map_err(|e| format!("{phase} step {number}: {e}"))
        })
        .collect()
}

fn convert_step(raw: &RawStep, buffers: &BufferMap) -> Result<FluidicStep, String> {
    match &raw.product {
        Some(product) => {
            let valve = buffers
                .valve_for(product)
                .ok_or_else(|| format!("product '{product}' is not connected to any valve"))?;
            let volume = raw.volume.ok_or("injection needs a volume")?;
            let flowrate = raw.flowrate.ok_or("injection needs a flowrate")?;
            injection_duration(flowrate, volume)?;
            Ok(FluidicStep::Injection {
                product: product.clone(),
                valve,
                flowrate,
                volume,
            })
        }
        None => {
            let seconds = raw.time.ok_or("incubation needs a time in seconds")?;
            Ok(FluidicStep::Incubation {
                duration: bounded_duration(seconds)?,
            })
        }
    }
}
