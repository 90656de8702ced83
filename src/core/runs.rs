//! Run-record files: one JSON file per executor call under `logs/runs/`.
//!
//! These hold the raw output. The index mirrors only their metadata.

use crate::core::action_log::RunStatus;
use crate::core::error::KeelError;
use crate::core::jsonfile::{self, Loaded};
use crate::core::router::Intent;
use crate::core::store::ProjectPaths;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const RUN_FILE_PREFIX: &str = "run_";

/// Markers that classify a failure. Matched case-insensitively against raw output.
const ERROR_MARKERS: &[(&str, &str)] = &[
    ("traceback (most recent call last)", "traceback"),
    ("syntaxerror", "syntax_error"),
    ("modulenotfounderror", "missing_module"),
    ("importerror", "import_error"),
    ("no such file or directory", "missing_file"),
    ("permission denied", "permission_denied"),
    ("panicked at", "panic"),
    ("segmentation fault", "segfault"),
    ("timed out", "timeout"),
    ("timeout", "timeout"),
    ("command not found", "command_not_found"),
    ("assertionerror", "assertion_failed"),
    ("error:", "error"),
    ("exception", "exception"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub project: String,
    pub intent: Intent,
    pub task: String,
    pub script_path: Option<String>,
    pub status: RunStatus,
    pub returncode: Option<i32>,
    pub duration_ms: u64,
    pub summary: Option<String>,
    pub error_keywords: Vec<String>,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub raw_output: String,
}

#[derive(Debug, Default)]
pub struct RunListing {
    /// Oldest first.
    pub records: Vec<RunRecord>,
    pub unreadable: Vec<PathBuf>,
}

pub fn error_keywords(raw_output: &str) -> Vec<String> {
    let lower = raw_output.to_lowercase();
    let mut found: Vec<String> = ERROR_MARKERS
        .iter()
        .filter(|(needle, _)| lower.contains(needle))
        .map(|(_, label)| label.to_string())
        .collect();
    found.sort();
    found.dedup();
    found
}

pub fn run_file(paths: &ProjectPaths, run_id: &str) -> PathBuf {
    paths
        .runs_dir()
        .join(format!("{}{}.json", RUN_FILE_PREFIX, run_id))
}

pub fn write(paths: &ProjectPaths, record: &RunRecord) -> Result<PathBuf, KeelError> {
    let path = run_file(paths, &record.run_id);
    jsonfile::write_atomic(&path, record)?;
    Ok(path)
}

fn run_files(dir: &Path) -> Result<Vec<PathBuf>, KeelError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_run = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .is_some_and(|n| n.starts_with(RUN_FILE_PREFIX) && n.ends_with(".json"));
        if is_run && path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

/// Every readable run record, oldest first.
pub fn list(paths: &ProjectPaths) -> Result<RunListing, KeelError> {
    let mut listing = RunListing::default();
    for path in run_files(&paths.runs_dir())? {
        match jsonfile::load::<RunRecord>(&path)? {
            Loaded::Present(record) => listing.records.push(record),
            Loaded::Missing => {}
            Loaded::Corrupt { reason } => {
                warn!(path = %path.display(), reason = %reason, "unreadable run record");
                listing.unreadable.push(path);
            }
        }
    }
    listing
        .records
        .sort_by(|a, b| (a.timestamp, &a.run_id).cmp(&(b.timestamp, &b.run_id)));
    Ok(listing)
}

/// Delete the oldest records beyond `cap`. Returns the removed run ids.
/// Unreadable files are removed first since nothing can use them.
pub fn trim(paths: &ProjectPaths, cap: usize) -> Result<(usize, Vec<String>), KeelError> {
    let listing = list(paths)?;
    let before = listing.records.len() + listing.unreadable.len();
    for path in &listing.unreadable {
        fs::remove_file(path)?;
    }
    let excess = listing.records.len().saturating_sub(cap);
    let mut removed = Vec::with_capacity(excess);
    for record in listing.records.iter().take(excess) {
        let path = run_file(paths, &record.run_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        removed.push(record.run_id.clone());
    }
    Ok((before, removed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_failures() {
        let out = "Traceback (most recent call last):\n  File \"x.py\"\nModuleNotFoundError: No module named 'foo'";
        assert_eq!(error_keywords(out), vec!["missing_module", "traceback"]);
        assert!(error_keywords("all good").is_empty());
        assert_eq!(
            error_keywords("thread 'main' panicked at src/main.rs"),
            vec!["panic"]
        );
    }
}
