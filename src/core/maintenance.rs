//! Bounded growth for every tracked file class.
//!
//! [`MaintenanceScheduler::maintain`] runs under the project's broker scope
//! and trims each class against its own cap:
//! - action log: FIFO by count (per-project override of `max_entries`)
//! - run-record files: newest `max_run_records` kept
//! - commit history: newest `max_commits` kept
//! - plaintext logs: once over `max_log_bytes`, newest lines up to half the cap kept
//!
//! A failure in one class is reported and the remaining classes still run.
//! Every trim that removes index-visible data updates `sync_metadata` in the
//! same transaction that drops the index rows.

use crate::core::action_log::ActionLog;
use crate::core::broker::ProjectBroker;
use crate::core::config::KeelConfig;
use crate::core::error::KeelError;
use crate::core::index::{Index, SOURCE_COMMITS, SOURCE_LOG_PREFIX, SOURCE_RUNS};
use crate::core::jsonfile::{self, Loaded};
use crate::core::project;
use crate::core::records::{self, ProjectConfig};
use crate::core::runs;
use crate::core::store::{ProjectId, ProjectPaths, Store};
use crate::core::time;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileClass {
    ActionLog,
    RunRecords,
    CommitHistory,
    PlaintextLog,
}

/// A completed trim. Counts are entries for JSON classes and bytes for
/// plaintext logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimEvent {
    pub class: FileClass,
    pub source: String,
    pub before: u64,
    pub after: u64,
    pub removed: u64,
    /// Cumulative offset recorded in `sync_metadata`, where the class has one.
    pub trim_offset: Option<u64>,
    /// Epoch milliseconds.
    pub at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceFailure {
    pub class: FileClass,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub project: String,
    pub events: Vec<TrimEvent>,
    pub failures: Vec<MaintenanceFailure>,
}

impl MaintenanceReport {
    pub fn trimmed(&self, class: FileClass) -> bool {
        self.events.iter().any(|e| e.class == class)
    }
}

#[derive(Debug, Clone)]
pub struct MaintenanceScheduler {
    max_entries: usize,
    max_run_records: usize,
    max_log_bytes: u64,
    max_commits: usize,
}

impl MaintenanceScheduler {
    pub fn new(config: &KeelConfig) -> Self {
        Self {
            max_entries: config.memory.max_entries,
            max_run_records: config.maintenance.max_run_records,
            max_log_bytes: config.maintenance.max_log_bytes,
            max_commits: config.maintenance.max_commits,
        }
    }

    pub fn maintain(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
    ) -> Result<MaintenanceReport, KeelError> {
        let broker = ProjectBroker::new(project, paths)?;
        broker.with_lock("keel", "maintenance.maintain", || {
            Ok(self.maintain_locked(project, paths))
        })
    }

    pub(crate) fn maintain_locked(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
    ) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            project: project.to_string(),
            events: Vec::new(),
            failures: Vec::new(),
        };
        let index = Index::new(project, paths);

        let mut run = |class: FileClass, result: Result<Vec<TrimEvent>, KeelError>| match result {
            Ok(events) => report.events.extend(events),
            Err(e) => {
                warn!(project = %project, class = ?class, error = %e, "maintenance step failed");
                report.failures.push(MaintenanceFailure {
                    class,
                    error: e.to_string(),
                });
            }
        };

        run(FileClass::ActionLog, self.trim_actions(project, paths));
        run(FileClass::RunRecords, self.trim_runs(paths, &index));
        run(FileClass::CommitHistory, self.trim_commits(paths, &index));
        run(FileClass::PlaintextLog, self.trim_logs(paths, &index));

        if !report.events.is_empty() {
            info!(
                project = %project,
                trims = report.events.len(),
                failures = report.failures.len(),
                "maintenance trimmed"
            );
        }
        report
    }

    /// Every active project, in parallel. Projects never share a lock.
    pub fn maintain_all(
        &self,
        store: &Store,
    ) -> Result<Vec<Result<MaintenanceReport, KeelError>>, KeelError> {
        let projects = project::list(store)?;
        Ok(projects
            .par_iter()
            .map(|id| {
                let paths = store.existing_project(id)?;
                self.maintain(id, &paths)
            })
            .collect())
    }

    fn trim_actions(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
    ) -> Result<Vec<TrimEvent>, KeelError> {
        let cap = match records::load_project_config(paths)? {
            Loaded::Present(cfg) => cfg.max_entries(self.max_entries),
            _ => ProjectConfig::default().max_entries(self.max_entries),
        };
        let log = ActionLog::new(project, paths, cap);
        Ok(log.trim_locked(cap)?.into_iter().collect())
    }

    fn trim_runs(&self, paths: &ProjectPaths, index: &Index) -> Result<Vec<TrimEvent>, KeelError> {
        let listing = runs::list(paths)?;
        let before = (listing.records.len() + listing.unreadable.len()) as u64;
        if before as usize <= self.max_run_records && listing.unreadable.is_empty() {
            return Ok(Vec::new());
        }
        let previous = previous_offset(index, SOURCE_RUNS);
        index.mark_pending(SOURCE_RUNS)?;
        let (_, removed) = runs::trim(paths, self.max_run_records)?;
        let after = runs::list(paths)?.records.len() as u64;
        let removed_total = previous + removed.len() as u64;
        index.mirror_run_trim(&removed, removed_total)?;
        if before == after {
            return Ok(Vec::new());
        }
        Ok(vec![TrimEvent {
            class: FileClass::RunRecords,
            source: SOURCE_RUNS.to_string(),
            before,
            after,
            removed: before - after,
            trim_offset: Some(removed_total),
            at: time::now_epoch_ms(),
        }])
    }

    fn trim_commits(
        &self,
        paths: &ProjectPaths,
        index: &Index,
    ) -> Result<Vec<TrimEvent>, KeelError> {
        let mut history = match records::load_commit_history(paths)? {
            Loaded::Present(doc) => doc,
            Loaded::Missing => return Ok(Vec::new()),
            Loaded::Corrupt { reason } => {
                return Err(KeelError::CorruptSource {
                    path: paths.commit_history().display().to_string(),
                    reason,
                });
            }
        };
        let before = history.history.len() as u64;
        let removed = history.trim(self.max_commits);
        if removed == 0 {
            return Ok(Vec::new());
        }
        index.mark_pending(SOURCE_COMMITS)?;
        records::save_commit_history(paths, &history)?;
        index.mirror_commits(&history.history, true)?;
        Ok(vec![TrimEvent {
            class: FileClass::CommitHistory,
            source: SOURCE_COMMITS.to_string(),
            before,
            after: history.history.len() as u64,
            removed: removed as u64,
            trim_offset: None,
            at: time::now_epoch_ms(),
        }])
    }

    fn trim_logs(&self, paths: &ProjectPaths, index: &Index) -> Result<Vec<TrimEvent>, KeelError> {
        let mut events = Vec::new();
        for path in [paths.actions_log(), paths.audit_log()] {
            let Some((before, after)) = trim_log_file(&path, self.max_log_bytes)? else {
                continue;
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let source = format!("{}{}", SOURCE_LOG_PREFIX, name);
            let total = previous_offset(index, &source) + (before - after);
            index.record_log_trim(&name, total, after)?;
            events.push(TrimEvent {
                class: FileClass::PlaintextLog,
                source,
                before,
                after,
                removed: before - after,
                trim_offset: Some(total),
                at: time::now_epoch_ms(),
            });
        }
        Ok(events)
    }
}

fn previous_offset(index: &Index, source: &str) -> u64 {
    match index.sync_state(source) {
        Ok(Some(state)) => state.last_trim_offset,
        Ok(None) => 0,
        Err(e) => {
            warn!(source, error = %e, "sync state unreadable; offset restarts at 0");
            0
        }
    }
}

/// Keep the newest whole lines fitting in half of `max_bytes`. Returns
/// `(bytes_before, bytes_after)` when the file was over the cap.
pub fn trim_log_file(path: &Path, max_bytes: u64) -> Result<Option<(u64, u64)>, KeelError> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if size <= max_bytes {
        return Ok(None);
    }
    let content = fs::read(path)?;
    let budget = (max_bytes / 2) as usize;
    let mut kept: Vec<&[u8]> = Vec::new();
    let mut used = 0usize;
    for line in content.split_inclusive(|b| *b == b'\n').rev() {
        if used + line.len() > budget {
            break;
        }
        used += line.len();
        kept.push(line);
    }
    kept.reverse();
    let bytes = kept.concat();
    jsonfile::write_bytes_atomic(path, &bytes)?;
    Ok(Some((size, bytes.len() as u64)))
}
