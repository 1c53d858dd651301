//! Probe cycle: Hybridization, Imaging, Photobleaching, needle rinse.

use crate::abort::{poll_until, AbortFlag, Deadline};
use crate::experiment::imaging::{ImagingCycleController, ImagingSummary};
use crate::experiment::injection::InjectionExecutor;
use crate::experiment::protocol::{FluidicStep, InjectionProtocol};
use crate::experiment::records::{EventLevel, EventLog};
use crate::experiment::status::{Process, StatusBoard};
use crate::hardware::{NeedlePositioner, ValveBank};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::instrument;

/// What to do with the needle before an injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeedleAction {
    /// Inject from the current tube
    Stay,
    /// Advance to this tube first
    MoveTo(u32),
}

/// Needle advance for repeated injections through the needle valve.
///
/// The first injection through the needle valve uses the probe tube. Every further one moves
/// the needle to the next tube first, so the (k+1)-th such injection draws from
/// `initial + k`.
#[derive(Debug, Clone)]
pub struct NeedleTracker {
    needle_valve: u32,
    position: u32,
    hits: u32,
}

impl NeedleTracker {
    /// Tracker for a needle resting on tube `initial`.
    pub fn new(needle_valve: u32, initial: u32) -> Self {
        Self {
            needle_valve,
            position: initial,
            hits: 0,
        }
    }

    /// Account for an injection from buffer valve `valve`.
    pub fn on_injection(&mut self, valve: u32) -> NeedleAction {
        if valve != self.needle_valve {
            return NeedleAction::Stay;
        }
        let action = if self.hits == 0 {
            NeedleAction::Stay
        } else {
            NeedleAction::MoveTo(self.position)
        };
        self.hits += 1;
        self.position += 1;
        action
    }

    /// Position the next needle-valve injection would use.
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Injections drawn through the needle so far.
    pub fn hits(&self) -> u32 {
        self.hits
    }
}

/// Outcome of one probe cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Probe name
    pub probe: String,
    /// Injections that reached their volume
    pub injections: u32,
    /// `None` when the cycle aborted before imaging
    pub imaging: Option<ImagingSummary>,
    /// Photobleaching and the rinse both ran
    pub photobleached: bool,
    /// The cycle ended on an abort
    pub aborted: bool,
}

/// Collaborators of the scheduler.
pub struct SchedulerContext {
    /// Needle autosampler
    pub needle: Arc<dyn NeedlePositioner>,
    /// Live run status
    pub status: Arc<StatusBoard>,
    /// Run event log
    pub events: Arc<EventLog>,
    /// Shared with every wait of the run
    pub abort: AbortFlag,
    /// Poll interval while the needle moves
    pub motion_poll: Duration,
    /// Buffer valve position routed through the needle
    pub needle_valve: u32,
}

/// Runs one probe's full cycle per call, in protocol order.
pub struct ProbeCycleScheduler {
    ctx: SchedulerContext,
    fluidics: InjectionExecutor,
    imaging: ImagingCycleController,
    protocol: InjectionProtocol,
    reports: Vec<CycleReport>,
}

impl ProbeCycleScheduler {
    /// Scheduler running the cycles of `protocol`.
    pub fn new(
        ctx: SchedulerContext,
        fluidics: InjectionExecutor,
        imaging: ImagingCycleController,
        protocol: InjectionProtocol,
    ) -> Self {
        Self {
            ctx,
            fluidics,
            imaging,
            protocol,
            reports: Vec::new(),
        }
    }

    /// Number of cycles in the run.
    pub fn probe_count(&self) -> usize {
        self.protocol.probes.len()
    }

    /// Reports of the cycles run so far.
    pub fn reports(&self) -> &[CycleReport] {
        &self.reports
    }

    /// Imaging controller of the run.
    pub fn imaging(&self) -> &ImagingCycleController {
        &self.imaging
    }

    /// Fluidics executor of the run.
    pub fn fluidics(&self) -> &InjectionExecutor {
        &self.fluidics
    }

    fn event(&self, cycle: u32, process: Process, message: &str, level: EventLevel) {
        self.ctx.events.record(cycle, process, message, level);
    }

    fn begin_phase(&self, cycle: u32, process: Process) {
        self.ctx.status.set_process(process);
        self.event(cycle, process, &format!("Started {process}"), EventLevel::Info);
    }

    /// Run the cycle of probe `index`. Returns whether another cycle should follow.
    #[instrument(skip(self))]
    pub async fn run_probe_cycle(&mut self, index: usize) -> bool {
        let Some(probe) = self.protocol.probes.get(index).cloned() else {
            tracing::warn!(index, "no probe at this index");
            return false;
        };
        let cycle = index as u32 + 1;
        let abort = self.ctx.abort.clone();
        tracing::info!(cycle, probe = %probe.name, "probe cycle started");
        self.ctx.status.begin_cycle(cycle);
        self.event(cycle, Process::None, &format!("Started cycle {cycle}"), EventLevel::Info);

        let mut report = CycleReport {
            probe: probe.name.clone(),
            ..CycleReport::default()
        };

        self.begin_phase(cycle, Process::Hybridization);
        if self.move_needle(probe.needle_position).await
            && self.fluidics.select_needle_delivery().await
        {
            self.fluidics.open_flow().await;
            let steps = self.protocol.hybridization.clone();
            let mut tracker = NeedleTracker::new(self.ctx.needle_valve, probe.needle_position);
            report.injections += self
                .run_sequence(cycle, Process::Hybridization, &steps, Some(&mut tracker))
                .await;
        }
        // always, so the needle is never left wet
        self.fluidics.park_valves().await;

        if !abort.is_set() {
            self.begin_phase(cycle, Process::Imaging);
            report.imaging = Some(self.imaging.run_all_rois(cycle, index, &probe).await);
        }

        if !abort.is_set() {
            self.begin_phase(cycle, Process::Photobleaching);
            if self.fluidics.select_needle_delivery().await {
                let steps = self.protocol.photobleaching.clone();
                report.injections += self
                    .run_sequence(cycle, Process::Photobleaching, &steps, None)
                    .await;
            }
            self.fluidics.close_flow().await;
            if !abort.is_set() {
                self.fluidics.rinse_needle().await;
                report.photobleached = true;
            }
            self.fluidics.park_valves().await;
        }

        if abort.is_set() {
            self.fluidics.safe_state().await;
            self.event(cycle, Process::None, "Cycle aborted", EventLevel::Warning);
            report.aborted = true;
        } else {
            self.event(cycle, Process::None, &format!("Finished cycle {cycle}"), EventLevel::Info);
        }
        self.reports.push(report);

        index + 1 < self.probe_count() && !abort.is_set()
    }

    /// Run `steps` in order. Returns the number of injections completed.
    async fn run_sequence(
        &self,
        cycle: u32,
        phase: Process,
        steps: &[FluidicStep],
        mut tracker: Option<&mut NeedleTracker>,
    ) -> u32 {
        let mut completed = 0;
        for (n, step) in steps.iter().enumerate() {
            if self.ctx.abort.is_set() {
                break;
            }
            let number = n + 1;
            tracing::info!(phase = %phase, step = number, "{step}");
            self.event(cycle, phase, &format!("Started step {number}: {step}"), EventLevel::Info);
            match step {
                FluidicStep::Injection {
                    valve,
                    flowrate,
                    volume,
                    ..
                } => {
                    if !self.fluidics.set_valve(ValveBank::Buffer, *valve).await {
                        break;
                    }
                    if let Some(tracker) = tracker.as_deref_mut() {
                        if let NeedleAction::MoveTo(position) = tracker.on_injection(*valve) {
                            self.advance_needle(position).await;
                        }
                    }
                    if self.fluidics.run_injection(*flowrate, *volume).await.completed {
                        completed += 1;
                    }
                }
                FluidicStep::Incubation { duration } => {
                    self.fluidics.run_incubation(*duration).await;
                }
            }
        }
        completed
    }

    /// Move to the next tube with the flow stopped.
    async fn advance_needle(&self, position: u32) {
        self.fluidics.close_flow().await;
        self.move_needle(position).await;
        self.fluidics.open_flow().await;
    }

    /// Move the needle and wait until it stops. Only abort ends the wait early.
    async fn move_needle(&self, position: u32) -> bool {
        let needle = self.ctx.needle.clone();
        let result = async {
            needle.start_move_to(position).await?;
            poll_until(&self.ctx.abort, self.ctx.motion_poll, Deadline::None, move || {
                let needle = needle.clone();
                async move { Ok(!needle.is_moving().await?) }
            })
            .await
        }
        .await;
        match result {
            Ok(outcome) => {
                if outcome.is_ready() {
                    tracing::info!(position, "needle in position");
                }
                outcome.is_ready()
            }
            Err(e) => {
                tracing::error!(position, error = %format!("{e:#}"), "needle move failed");
                self.ctx.abort.request();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_needle_injection_stays() {
        let mut tracker = NeedleTracker::new(7, 3);
        assert_eq!(tracker.on_injection(2), NeedleAction::Stay);
        assert_eq!(tracker.on_injection(7), NeedleAction::Stay);
        assert_eq!(tracker.position(), 4);
    }

    #[test]
    fn test_needle_advances_once_per_hit() {
        let mut tracker = NeedleTracker::new(7, 3);
        let actions: Vec<NeedleAction> = [7, 1, 7, 7]
            .iter()
            .map(|v| tracker.on_injection(*v))
            .collect();
        assert_eq!(
            actions,
            vec![
                NeedleAction::Stay,
                NeedleAction::Stay,
                NeedleAction::MoveTo(4),
                NeedleAction::MoveTo(5)
            ]
        );
        // k = 3 hits: the next injection would use initial + 3
        assert_eq!(tracker.hits(), 3);
        assert_eq!(tracker.position(), 6);
    }
}
