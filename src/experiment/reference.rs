//! Per-ROI reference images and the probe x ROI correlation scores.

use crate::error::{AppResult, HimError};
use ndarray::Array2;
use std::path::{Path, PathBuf};

/// One reference image per ROI, persisted with bincode.
///
/// Created empty on the first run of a sample or loaded from a previous run. An entry is
/// replaced whenever the focus check reports drift, and the bank is written immediately.
#[derive(Debug, Clone)]
pub struct ReferenceImageBank {
    images: Vec<Option<Array2<u16>>>,
    path: PathBuf,
}

impl ReferenceImageBank {
    /// Empty bank for `roi_count` ROIs, persisted at `path`.
    pub fn new(roi_count: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            images: vec![None; roi_count],
            path: path.into(),
        }
    }

    /// Load a bank written by a previous run. It is resized to `roi_count` and written to
    /// `path` from then on.
    pub fn load(source: &Path, roi_count: usize, path: impl Into<PathBuf>) -> AppResult<Self> {
        let bytes = std::fs::read(source)?;
        let mut images: Vec<Option<Array2<u16>>> = bincode::deserialize(&bytes)?;
        if images.len() != roi_count {
            tracing::warn!(
                source = %source.display(),
                stored = images.len(),
                roi_count,
                "reference bank does not match the ROI list, resizing"
            );
            images.resize(roi_count, None);
        }
        let bank = Self {
            images,
            path: path.into(),
        };
        bank.persist()?;
        Ok(bank)
    }

    /// Number of ROI slots.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// No ROI slot.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Reference image of `roi`, once one was adopted.
    pub fn get(&self, roi: usize) -> Option<&Array2<u16>> {
        self.images.get(roi).and_then(Option::as_ref)
    }

    /// Store `image` as the reference of `roi` and persist the bank.
    pub fn replace(&mut self, roi: usize, image: Array2<u16>) -> AppResult<()> {
        let slot = self.images.get_mut(roi).ok_or_else(|| {
            HimError::Persistence(format!("no reference slot for ROI index {roi}"))
        })?;
        *slot = Some(image);
        self.persist()
    }

    /// Write the bank atomically.
    pub fn persist(&self) -> AppResult<()> {
        let bytes = bincode::serialize(&self.images)?;
        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Probe x ROI matrix of correlation scores, NaN where no score was computed.
#[derive(Debug, Clone)]
pub struct CorrelationScoreMatrix {
    probes: Vec<String>,
    rois: Vec<String>,
    scores: Array2<f64>,
}

impl CorrelationScoreMatrix {
    /// Matrix with every score missing.
    pub fn new(probes: Vec<String>, rois: Vec<String>) -> Self {
        let scores = Array2::from_elem((probes.len(), rois.len()), f64::NAN);
        Self {
            probes,
            rois,
            scores,
        }
    }

    /// Store a score; out-of-range indices are ignored.
    pub fn record(&mut self, probe: usize, roi: usize, score: f64) {
        if let Some(cell) = self.scores.get_mut((probe, roi)) {
            *cell = score;
        }
    }

    /// Score of `probe` at `roi`, if recorded.
    pub fn get(&self, probe: usize, roi: usize) -> Option<f64> {
        self.scores.get((probe, roi)).copied().filter(|s| !s.is_nan())
    }

    /// Write the matrix as CSV: one row per probe, one column per ROI.
    pub fn save_csv(&self, path: &Path) -> AppResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(std::iter::once("probe").chain(self.rois.iter().map(String::as_str)))?;
        for (name, row) in self.probes.iter().zip(self.scores.rows()) {
            let cells = row.iter().map(|s| {
                if s.is_nan() {
                    String::new()
                } else {
                    format!("{s:.4}")
                }
            });
            writer.write_record(std::iter::once(name.clone()).chain(cells))?;
        }
        writer.flush()?;
        Ok(())
    }
}
