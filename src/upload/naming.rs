//! Stack names and the mapping of vendor files to them.
//!
//! Vendor acquisition software writes files named by acquisition index (`..._pt12.czi`).
//! The i-th vendor file in index order corresponds to the i-th name in the acquisition log.

use crate::error::{AppResult, HimError};
use crate::experiment::records::AcquisitionLog;
use crate::experiment::roi::Roi;
use crate::upload::list_files;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Logical name of the stack acquired for `probe` at `roi`.
pub fn stack_name(prefix: &str, probe: &str, roi: &Roi) -> String {
    format!("scan_{prefix}_{probe}_{}", roi.file_label())
}

/// Resolves vendor files to their logical upload name.
#[derive(Debug, Clone)]
pub struct VendorRenamer {
    directory: PathBuf,
    pattern: Regex,
    index: Regex,
    log: AcquisitionLog,
}

impl VendorRenamer {
    /// `pattern` selects vendor files by file name.
    pub fn new(
        directory: impl Into<PathBuf>,
        pattern: &str,
        log: AcquisitionLog,
    ) -> AppResult<Self> {
        let compile = |source: &str| {
            Regex::new(source).map_err(|e| {
                HimError::Configuration(format!("Invalid vendor file pattern '{source}': {e}"))
            })
        };
        Ok(Self {
            directory: directory.into(),
            pattern: compile(pattern)?,
            index: compile(r"_pt(\d+)")?,
            log,
        })
    }

    /// Folder the vendor software writes into.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn acquisition_index(&self, path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        self.index.captures(name)?.get(1)?.as_str().parse().ok()
    }

    /// Vendor files present, in acquisition order. Files without an index are ignored.
    pub fn vendor_files(&self) -> AppResult<Vec<PathBuf>> {
        let mut indexed: Vec<(u64, PathBuf)> = list_files(&self.directory)?
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| self.pattern.is_match(n))
            })
            .filter_map(|p| self.acquisition_index(&p).map(|i| (i, p)))
            .collect();
        indexed.sort();
        Ok(indexed.into_iter().map(|(_, p)| p).collect())
    }

    /// Upload file name of `path` (logical name plus the original extension), or `None`
    /// while the acquisition log has no entry for it yet.
    pub fn resolve(&self, path: &Path) -> AppResult<Option<String>> {
        let files = self.vendor_files()?;
        let Some(position) = files.iter().position(|p| p == path) else {
            return Ok(None);
        };
        let names = self.log.names()?;
        Ok(names.get(position).map(|name| match path.extension() {
            Some(ext) => format!("{name}.{}", ext.to_string_lossy()),
            None => name.clone(),
        }))
    }
}
