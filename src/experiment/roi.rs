//! Regions of interest imaged every probe cycle.

use crate::error::{AppResult, HimError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A stage position imaged every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    /// Identifier, e.g. `ROI_001`
    pub name: String,
    /// Stage position `[x, y, z]` in µm
    pub position: [f64; 3],
}

impl Roi {
    /// Recorded focus height in µm.
    pub fn z(&self) -> f64 {
        self.position[2]
    }

    /// Label used in stack file names: `ROI_001` becomes `001_ROI`.
    pub fn file_label(&self) -> String {
        let number = self.name.trim_start_matches("ROI_").trim_start_matches("ROI");
        format!("{}_ROI", number.trim_start_matches('_'))
    }
}

/// Ordered ROI list, imaged in the given order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiSet {
    /// Name given to the list when it was drawn
    #[serde(default)]
    pub name: String,
    /// ROIs in imaging order
    pub rois: Vec<Roi>,
}

impl RoiSet {
    /// Load a ROI list saved as JSON (`{name, rois: [{name, position}]}`).
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let set: RoiSet = serde_json::from_str(&text)?;
        if set.rois.is_empty() {
            return Err(HimError::Configuration(format!(
                "ROI list {} is empty",
                path.display()
            )));
        }
        Ok(set)
    }

    /// Number of ROIs.
    pub fn len(&self) -> usize {
        self.rois.len()
    }

    /// No ROI listed.
    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }

    /// ROIs in imaging order.
    pub fn iter(&self) -> impl Iterator<Item = &Roi> {
        self.rois.iter()
    }

    /// Focus offset applied before imaging each ROI.
    ///
    /// Entry `n > 0` is `z_n - z_{n-1}`. Entry 0 is `z_first - z_last`, the move made when a
    /// new cycle wraps from the last ROI back to the first.
    pub fn axial_corrections(&self) -> Vec<f64> {
        let Some(first) = self.rois.first() else {
            return Vec::new();
        };
        let last = self.rois.last().unwrap_or(first);
        std::iter::once(first.z() - last.z())
            .chain(self.rois.windows(2).map(|pair| pair[1].z() - pair[0].z()))
            .collect()
    }
}
