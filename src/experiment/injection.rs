//! Fluidic step execution: injections, incubations, needle rinse and valve parking.

use crate::abort::{poll_until, AbortFlag, Deadline, WaitOutcome};
use crate::config::FluidicsConfig;
use crate::experiment::protocol::injection_duration;
use crate::hardware::{FlowController, ValveBank, ValveController};
use crate::upload::UploadWorkerPool;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::instrument;

/// Needle valve position delivering through the needle.
const NEEDLE_DELIVERY: u32 = 1;
/// Needle valve position routing rinse buffer.
const NEEDLE_RINSE: u32 = 2;
/// Idle position of the buffer valve.
const BUFFER_IDLE: u32 = 1;

/// Timing of one injection, for the operator log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InjectionReport {
    /// Time spent regulating, settle time included
    pub elapsed: Duration,
    /// Nominal `volume / flowrate`
    pub expected: Duration,
    /// The volume target was reached (false on abort or failure)
    pub completed: bool,
}

/// Runs fluidic steps against the flow and valve collaborators.
///
/// Collaborator errors are logged and turned into an abort request; nothing propagates.
pub struct InjectionExecutor {
    flow: Arc<dyn FlowController>,
    valves: Arc<dyn ValveController>,
    abort: AbortFlag,
    uploads: Option<Arc<UploadWorkerPool>>,
    timing: FluidicsConfig,
}

impl InjectionExecutor {
    /// Executor servicing `uploads` from its poll loops, when given.
    pub fn new(
        flow: Arc<dyn FlowController>,
        valves: Arc<dyn ValveController>,
        abort: AbortFlag,
        uploads: Option<Arc<UploadWorkerPool>>,
        timing: FluidicsConfig,
    ) -> Self {
        Self {
            flow,
            valves,
            abort,
            uploads,
            timing,
        }
    }

    fn fail(&self, action: &str, err: anyhow::Error) {
        tracing::error!(action, error = %format!("{err:#}"), "fluidics failure, aborting run");
        self.abort.request();
    }

    /// Give the upload worker a chance to start its next transfer.
    async fn service_uploads(&self) {
        if let Some(pool) = &self.uploads {
            pool.launch_next().await;
        }
    }

    /// Select `position` on `bank` and wait until the valves settled.
    pub async fn set_valve(&self, bank: ValveBank, position: u32) -> bool {
        let result = async {
            self.valves.set_position(bank, position).await?;
            self.valves.wait_for_idle().await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                self.fail("set valve", e);
                false
            }
        }
    }

    /// Inject until the flowmeter reports `volume` µl at `flowrate` µl/min, or abort.
    ///
    /// Regulation is always stopped and the pressure released afterwards. An injection
    /// whose nominal duration is not representable fails without pressurising.
    #[instrument(skip(self))]
    pub async fn run_injection(&self, flowrate: f64, volume: f64) -> InjectionReport {
        let expected = match injection_duration(flowrate, volume) {
            Ok(expected) => expected,
            Err(reason) => {
                self.fail("injection", anyhow::anyhow!(reason));
                return InjectionReport {
                    elapsed: Duration::ZERO,
                    expected: Duration::ZERO,
                    completed: false,
                };
            }
        };
        let started = Instant::now();

        let completed = match self.regulate_until_target(flowrate, volume).await {
            Ok(outcome) => outcome.is_ready(),
            Err(e) => {
                self.fail("injection", e);
                false
            }
        };
        self.release_pressure().await;

        let elapsed = started.elapsed();
        if completed {
            tracing::info!(?elapsed, ?expected, "injection finished");
        } else {
            tracing::warn!(?elapsed, ?expected, "injection interrupted");
        }
        InjectionReport {
            elapsed,
            expected,
            completed,
        }
    }

    async fn regulate_until_target(
        &self,
        flowrate: f64,
        volume: f64,
    ) -> anyhow::Result<WaitOutcome> {
        self.flow.set_pressure(0.0).await?;
        self.flow.start_regulation(flowrate).await?;
        self.flow.start_volume_measurement(volume).await?;

        let flow = self.flow.clone();
        let uploads = self.uploads.clone();
        poll_until(
            &self.abort,
            self.timing.poll_interval,
            Deadline::None,
            move || {
                let flow = flow.clone();
                let uploads = uploads.clone();
                async move {
                    if let Some(pool) = uploads {
                        pool.launch_next().await;
                    }
                    flow.target_volume_reached().await
                }
            },
        )
        .await
    }

    async fn release_pressure(&self) {
        if let Err(e) = self.flow.stop_regulation().await {
            self.fail("stop regulation", e);
        }
        sleep(self.timing.settle_time).await;
        if let Err(e) = self.flow.set_pressure(0.0).await {
            self.fail("release pressure", e);
        }
    }

    /// Wait `duration` with the flow closed, in slices that bound the abort latency.
    ///
    /// Abort is checked before each slice; a slice already entered elapses in full.
    /// Returns whether the whole duration elapsed.
    #[instrument(skip(self))]
    pub async fn run_incubation(&self, duration: Duration) -> bool {
        self.close_flow().await;

        let slice = self.timing.incubation_slice;
        let mut remaining = duration;
        let mut completed = true;
        while !remaining.is_zero() {
            if self.abort.is_set() {
                completed = false;
                break;
            }
            self.service_uploads().await;
            let chunk = remaining.min(slice);
            sleep(chunk).await;
            remaining -= chunk;
        }

        self.open_flow().await;
        if completed {
            tracing::info!(?duration, "incubation finished");
        } else {
            tracing::warn!(remaining = ?remaining, "incubation interrupted");
        }
        completed
    }

    /// Close the stop valve, if the rig has one.
    pub async fn close_flow(&self) {
        if let Some(valve) = self.timing.flow_valve {
            self.set_valve(ValveBank::Flow, valve.closed).await;
        }
    }

    /// Reopen the stop valve, if the rig has one.
    pub async fn open_flow(&self) {
        if let Some(valve) = self.timing.flow_valve {
            self.set_valve(ValveBank::Flow, valve.open).await;
        }
    }

    /// Route the needle valve to delivery. Done before every fluidic sequence.
    pub async fn select_needle_delivery(&self) -> bool {
        self.set_valve(ValveBank::Needle, NEEDLE_DELIVERY).await
    }

    /// Return buffer and needle valves to their idle positions.
    pub async fn park_valves(&self) {
        self.set_valve(ValveBank::Buffer, BUFFER_IDLE).await;
        self.set_valve(ValveBank::Needle, NEEDLE_DELIVERY).await;
    }

    /// Rinse the needle. The wait is a floor: it lasts `needle_rinse + rinse_margin` even if
    /// the controller finishes earlier. Not interrupted by abort once started.
    #[instrument(skip(self))]
    pub async fn rinse_needle(&self) {
        let rinse = self.timing.needle_rinse;
        self.set_valve(ValveBank::Buffer, self.timing.needle_valve_position)
            .await;
        self.set_valve(ValveBank::Needle, NEEDLE_RINSE).await;
        if let Err(e) = self.flow.start_rinsing(rinse).await {
            self.fail("start rinsing", e);
            return;
        }
        sleep(rinse + self.timing.rinse_margin).await;
        self.set_valve(ValveBank::Needle, NEEDLE_DELIVERY).await;
        tracing::info!(?rinse, "needle rinsed");
    }

    /// Leave the fluidics safe after an abort: no regulation, no pressure, valves parked.
    pub async fn safe_state(&self) {
        if let Err(e) = self.flow.stop_regulation().await {
            tracing::error!(error = %e, "could not stop regulation");
        }
        if let Err(e) = self.flow.set_pressure(0.0).await {
            tracing::error!(error = %e, "could not release pressure");
        }
        let idle = [
            (ValveBank::Buffer, BUFFER_IDLE),
            (ValveBank::Needle, NEEDLE_DELIVERY),
        ];
        for (bank, position) in idle {
            let result = async {
                self.valves.set_position(bank, position).await?;
                self.valves.wait_for_idle().await
            }
            .await;
            if let Err(e) = result {
                tracing::error!(?bank, error = %e, "could not park valve");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowValveConfig;
    use crate::hardware::mock::{SimFlow, SimValves};

    fn executor(flow: Arc<SimFlow>, valves: Arc<SimValves>, abort: AbortFlag) -> InjectionExecutor {
        let timing = FluidicsConfig {
            flow_valve: Some(FlowValveConfig { closed: 1, open: 2 }),
            ..FluidicsConfig::default()
        };
        InjectionExecutor::new(flow, valves, abort, None, timing)
    }

    #[tokio::test(start_paused = true)]
    async fn test_injection_reaches_target() {
        let flow = Arc::new(SimFlow::new());
        let exec = executor(flow.clone(), Arc::new(SimValves::new()), AbortFlag::new());
        let report = exec.run_injection(150.0, 300.0).await;
        assert!(report.completed);
        assert_eq!(report.expected, Duration::from_secs(120));
        // 120 s of polling plus the settle time
        assert!(report.elapsed >= Duration::from_secs(121));
        assert!(report.elapsed <= Duration::from_secs(122));
        assert!(!flow.is_regulating().await);
        assert_eq!(flow.pressure().await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injection_abort_latency() {
        let flow = Arc::new(SimFlow::new());
        let abort = AbortFlag::new();
        let exec = executor(flow.clone(), Arc::new(SimValves::new()), abort.clone());
        let trigger = abort.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10_500)).await;
            trigger.request();
        });
        let report = exec.run_injection(10.0, 1000.0).await;
        assert!(!report.completed);
        // one poll interval plus settle time
        assert!(report.elapsed <= Duration::from_millis(12_500));
        assert!(!flow.is_regulating().await);
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_regulation_failure_requests_abort() {
        let flow = Arc::new(SimFlow::new());
        flow.fail_regulation(true);
        let abort = AbortFlag::new();
        let exec = executor(flow.clone(), Arc::new(SimValves::new()), abort.clone());
        let report = exec.run_injection(150.0, 300.0).await;
        assert!(!report.completed);
        assert!(abort.is_set());
        assert_eq!(flow.pressure().await, 0.0);
        assert!(logs_contain("fluidics failure, aborting run"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_injection_fails_without_pressure() {
        let flow = Arc::new(SimFlow::new());
        let abort = AbortFlag::new();
        let exec = executor(flow.clone(), Arc::new(SimValves::new()), abort.clone());

        let report = exec.run_injection(150.0, f64::INFINITY).await;
        assert!(!report.completed);
        assert!(abort.is_set());
        assert!(!flow.is_regulating().await);

        let report = exec.run_injection(1e-30, 1e30).await;
        assert!(!report.completed);
        assert_eq!(report.elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incubation_abort_within_one_slice() {
        let valves = Arc::new(SimValves::new());
        let abort = AbortFlag::new();
        let exec = executor(Arc::new(SimFlow::new()), valves.clone(), abort.clone());
        let trigger = abort.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(45)).await;
            trigger.request();
        });
        let start = Instant::now();
        let completed = exec.run_incubation(Duration::from_secs(3600)).await;
        assert!(!completed);
        // abort lands in the second slice, which still elapses; valves add a little
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() <= Duration::from_secs(61));
        assert_eq!(
            valves.history().await,
            vec![(ValveBank::Flow, 1), (ValveBank::Flow, 2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_incubation_remainder_slice() {
        let exec = executor(Arc::new(SimFlow::new()), Arc::new(SimValves::new()), AbortFlag::new());
        let start = Instant::now();
        assert!(exec.run_incubation(Duration::from_secs(75)).await);
        assert!(start.elapsed() >= Duration::from_secs(75));
        assert!(start.elapsed() < Duration::from_secs(76));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rinse_is_a_floor_wait() {
        let flow = Arc::new(SimFlow::new());
        let valves = Arc::new(SimValves::new());
        let exec = executor(flow.clone(), valves.clone(), AbortFlag::new());
        let start = Instant::now();
        exec.rinse_needle().await;
        assert!(start.elapsed() >= Duration::from_secs(35));
        assert_eq!(flow.rinses().await, vec![Duration::from_secs(30)]);
        assert_eq!(
            valves.history().await,
            vec![
                (ValveBank::Buffer, 7),
                (ValveBank::Needle, 2),
                (ValveBank::Needle, 1)
            ]
        );
    }
}
