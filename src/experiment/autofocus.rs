//! Autofocus safety: focus search, consecutive-loss escalation and the reference check.

use crate::abort::{poll_until, AbortFlag, Deadline, WaitOutcome};
use crate::config::AutofocusConfig;
use crate::error::AppResult;
use crate::experiment::correlation::{correlation_score, CorrelationParams};
use crate::experiment::reference::{CorrelationScoreMatrix, ReferenceImageBank};
use crate::hardware::{CameraController, FocusController};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::instrument;

const SEARCH_START_POLL: Duration = Duration::from_millis(100);

/// Result of one focus search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusOutcome {
    /// Focus locked, image ready
    Found,
    /// Search finished without locking
    Lost,
    /// Search still running after the search timeout
    Timeout,
    /// Abort observed while waiting
    Interrupted,
}

impl fmt::Display for FocusOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FocusOutcome::Found => write!(f, "Found"),
            FocusOutcome::Lost => write!(f, "Lost"),
            FocusOutcome::Timeout => write!(f, "Timeout"),
            FocusOutcome::Interrupted => write!(f, "Interrupted"),
        }
    }
}

/// Two-strikes policy: two consecutive losses abort the run, any success resets.
///
/// A timeout counts as a loss. An interrupted search leaves the counter untouched.
#[derive(Debug, Clone, Default)]
pub struct FocusLossCounter {
    consecutive: u32,
}

impl FocusLossCounter {
    /// Counter with no loss recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outcome and return whether the run must abort.
    pub fn register(&mut self, outcome: FocusOutcome) -> bool {
        match outcome {
            FocusOutcome::Found => self.consecutive = 0,
            FocusOutcome::Lost | FocusOutcome::Timeout => self.consecutive += 1,
            FocusOutcome::Interrupted => {}
        }
        self.abort_run()
    }

    /// Two consecutive losses were recorded.
    pub fn abort_run(&self) -> bool {
        self.consecutive >= 2
    }

    /// Losses since the last successful search.
    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive
    }
}

/// What the caller has to do after a focus check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusVerdict {
    /// Result of the focus search
    pub outcome: FocusOutcome,
    /// Stop the run and alert the operator
    pub abort: bool,
    /// Correlation score against the stored reference, when computed
    pub score: Option<f64>,
    /// The stored reference was replaced by the new image
    pub reference_replaced: bool,
}

/// Runs the focus search for each ROI and decides whether the run may go on.
pub struct AutofocusSafetyMonitor {
    focus: Arc<dyn FocusController>,
    camera: Arc<dyn CameraController>,
    abort: AbortFlag,
    config: AutofocusConfig,
    counter: FocusLossCounter,
    bank: ReferenceImageBank,
    scores: CorrelationScoreMatrix,
}

impl AutofocusSafetyMonitor {
    /// Monitor starting with no loss and the given reference bank.
    pub fn new(
        focus: Arc<dyn FocusController>,
        camera: Arc<dyn CameraController>,
        abort: AbortFlag,
        config: AutofocusConfig,
        bank: ReferenceImageBank,
        scores: CorrelationScoreMatrix,
    ) -> Self {
        Self {
            focus,
            camera,
            abort,
            config,
            counter: FocusLossCounter::new(),
            bank,
            scores,
        }
    }

    fn params(&self) -> CorrelationParams {
        CorrelationParams {
            grid: self.config.grid_size,
            crop: self.config.crop_size,
            background_radius: self.config.background_radius,
        }
    }

    /// Correlation scores recorded so far.
    pub fn scores(&self) -> &CorrelationScoreMatrix {
        &self.scores
    }

    /// Reference images, one per ROI.
    pub fn bank(&self) -> &ReferenceImageBank {
        &self.bank
    }

    /// Write the score matrix.
    pub fn save_scores(&self, path: &Path) -> AppResult<()> {
        self.scores.save_csv(path)
    }

    /// Start a search and wait for its outcome.
    pub async fn search(&self) -> anyhow::Result<FocusOutcome> {
        self.focus.start_autofocus().await?;

        let focus = self.focus.clone();
        let started = poll_until(
            &self.abort,
            SEARCH_START_POLL,
            Deadline::After(self.config.start_timeout),
            move || {
                let focus = focus.clone();
                async move { focus.search_running().await }
            },
        )
        .await?;
        if started == WaitOutcome::Aborted {
            return Ok(FocusOutcome::Interrupted);
        }
        // a search too short to be seen running has already finished

        let focus = self.focus.clone();
        let finished = poll_until(
            &self.abort,
            self.config.poll_interval,
            Deadline::After(self.config.search_timeout),
            move || {
                let focus = focus.clone();
                async move { Ok(!focus.search_running().await?) }
            },
        )
        .await?;
        match finished {
            WaitOutcome::Aborted => Ok(FocusOutcome::Interrupted),
            WaitOutcome::TimedOut => Ok(FocusOutcome::Timeout),
            WaitOutcome::Ready => {
                if self.focus.is_stable().await? {
                    Ok(FocusOutcome::Found)
                } else {
                    Ok(FocusOutcome::Lost)
                }
            }
        }
    }

    /// Focus on the current ROI and apply the two-strikes policy.
    ///
    /// A collaborator error during the search counts as a loss.
    #[instrument(skip(self), fields(consecutive_losses = self.counter.consecutive_losses()))]
    pub async fn check_roi(&mut self, probe: usize, roi: usize) -> FocusVerdict {
        let outcome = match self.search().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "autofocus search failed");
                FocusOutcome::Lost
            }
        };
        let abort = self.counter.register(outcome);

        let mut verdict = FocusVerdict {
            outcome,
            abort,
            score: None,
            reference_replaced: false,
        };
        match outcome {
            FocusOutcome::Found if self.config.verify_with_reference => {
                self.verify_reference(probe, roi, &mut verdict).await;
            }
            FocusOutcome::Found | FocusOutcome::Interrupted => {}
            FocusOutcome::Lost | FocusOutcome::Timeout if abort => {
                tracing::error!(%outcome, "focus lost twice in a row");
            }
            FocusOutcome::Lost | FocusOutcome::Timeout => {
                tracing::warn!(%outcome, "focus lost, continuing");
            }
        }
        verdict
    }

    async fn verify_reference(&mut self, probe: usize, roi: usize, verdict: &mut FocusVerdict) {
        let image = match self.camera.snap().await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(error = %e, "could not snap focus image, skipping reference check");
                return;
            }
        };

        let Some(reference) = self.bank.get(roi) else {
            tracing::info!(roi, "no reference image yet, adopting the current one");
            self.store_reference(roi, image, verdict);
            return;
        };

        match correlation_score(reference, &image, self.params()) {
            Ok(result) => {
                verdict.score = Some(result.score);
                self.scores.record(probe, roi, result.score);
                tracing::info!(
                    score = result.score,
                    peak = ?result.peak,
                    "correlation with reference"
                );
                if result.score < self.config.correlation_threshold {
                    tracing::warn!(
                        score = result.score,
                        threshold = self.config.correlation_threshold,
                        "image drifted from reference, replacing it"
                    );
                    self.store_reference(roi, image, verdict);
                }
            }
            Err(e) => tracing::warn!(error = %e, "correlation score unavailable"),
        }
    }

    fn store_reference(
        &mut self,
        roi: usize,
        image: ndarray::Array2<u16>,
        verdict: &mut FocusVerdict,
    ) {
        match self.bank.replace(roi, image) {
            Ok(()) => verdict.reference_replaced = true,
            Err(e) => tracing::error!(error = %e, "could not persist reference image"),
        }
    }
}
