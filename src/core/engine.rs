//! Engine: the operations exposed to outer surfaces, wired into the control
//! flow route → guard → execute → record → regenerate → maintain.
//!
//! The engine carries no notion of a current project. Every call names its
//! project explicitly.

use crate::core::action_log::{
    Action, ActionLog, ActionPayload, AppendOutcome, NewAction, Order, RunStatus,
};
use crate::core::broker::ProjectBroker;
use crate::core::config::{self, KeelConfig};
use crate::core::context::{ContextBuilder, ContextDocument};
use crate::core::error::KeelError;
use crate::core::executor::{CommitInfo, ExecutionOutcome, ExecutionRequest, Executor};
use crate::core::index::{
    Index, IndexAggregate, IndexInput, IndexRecord, QueryFilter, ReindexReport, SOURCE_COMMITS,
    SOURCE_RUNS, SyncState,
};
use crate::core::jsonfile::{self, Loaded};
use crate::core::maintenance::{MaintenanceReport, MaintenanceScheduler};
use crate::core::path_guard::{GuardDecision, OpKind, PathGuard};
use crate::core::project;
use crate::core::records::{self, CommitEntry, CommitHistoryDocument, ProjectConfig, Snapshot};
use crate::core::router::{self, Intent, RoutedCommand};
use crate::core::runs::{self, RunRecord};
use crate::core::store::{ProjectId, ProjectPaths, Store};
use crate::core::time;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        routed: RoutedCommand,
        success: bool,
        summary: Option<String>,
        run_id: Option<String>,
        /// Hash of the regenerated context document, when the project still exists.
        context_hash: Option<String>,
    },
    Refused {
        routed: RoutedCommand,
        /// Safe to show to the requester; omits rule internals.
        message: String,
    },
}

impl TaskOutcome {
    pub fn routed(&self) -> &RoutedCommand {
        match self {
            TaskOutcome::Completed { routed, .. } | TaskOutcome::Refused { routed, .. } => routed,
        }
    }
}

pub struct Engine {
    store: Store,
    config: KeelConfig,
    guard: PathGuard,
    context: ContextBuilder,
    maintenance: MaintenanceScheduler,
}

impl Engine {
    /// Load `keel.toml` and the guard rules once for this process.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, KeelError> {
        let root = std::path::absolute(root.as_ref())?;
        let config = config::load_config(&root)?;
        Self::with_config(root, config)
    }

    pub fn with_config(root: impl Into<PathBuf>, config: KeelConfig) -> Result<Self, KeelError> {
        config.validate()?;
        Ok(Self {
            store: Store::new(root),
            guard: PathGuard::from_config(&config.protection),
            context: ContextBuilder::new(&config),
            maintenance: MaintenanceScheduler::new(&config),
            config,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &KeelConfig {
        &self.config
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    // --- projects ---

    pub fn create_project(
        &self,
        project: &ProjectId,
        description: &str,
    ) -> Result<ProjectPaths, KeelError> {
        project::create(&self.store, project, description)
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectId>, KeelError> {
        project::list(&self.store)
    }

    pub fn archive_project(&self, project: &ProjectId) -> Result<PathBuf, KeelError> {
        let paths = self.store.existing_project(project)?;
        project::archive(&self.store, project, self.action_cap(&paths))
    }

    pub fn delete_project(&self, project: &ProjectId) -> Result<(), KeelError> {
        project::delete(&self.store, project)
    }

    // --- routing and protection ---

    pub fn route(&self, task: &str) -> RoutedCommand {
        router::route(task)
    }

    /// Guard verdict for `path`, recorded as a `protection` action.
    pub fn check(
        &self,
        project: &ProjectId,
        path: &str,
        kind: OpKind,
    ) -> Result<GuardDecision, KeelError> {
        let paths = self.store.existing_project(project)?;
        let broker = ProjectBroker::new(project, &paths)?;
        broker.with_lock("keel", "guard.check", || {
            self.check_locked(project, &paths, path, kind)
        })
    }

    fn check_locked(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
        path: &str,
        kind: OpKind,
    ) -> Result<GuardDecision, KeelError> {
        let decision = self.guard.scoped(project, &paths.root).check(path, kind);
        if !decision.is_allowed() {
            warn!(project = %project, path, kind = %kind, rule = decision.rule(), "path denied");
        }
        self.log_for(project, paths).append_locked(NewAction::new(
            format!(
                "{} {} '{}'",
                if decision.is_allowed() { "Allowed" } else { "Denied" },
                kind,
                path
            ),
            ActionPayload::Protection {
                path: path.to_string(),
                operation: kind,
                rule: decision.rule().to_string(),
                allowed: decision.is_allowed(),
            },
        ))?;
        Ok(decision)
    }

    // --- action log ---

    fn action_cap(&self, paths: &ProjectPaths) -> usize {
        let global = self.config.memory.max_entries;
        match records::load_project_config(paths) {
            Ok(Loaded::Present(cfg)) => cfg.max_entries(global),
            _ => global,
        }
    }

    fn log_for(&self, project: &ProjectId, paths: &ProjectPaths) -> ActionLog {
        ActionLog::new(project, paths, self.action_cap(paths))
    }

    pub fn append(&self, project: &ProjectId, action: NewAction) -> Result<AppendOutcome, KeelError> {
        let paths = self.store.existing_project(project)?;
        self.log_for(project, &paths).append(action)
    }

    /// Newest first; `n` defaults to the API window.
    pub fn recent(&self, project: &ProjectId, n: Option<usize>) -> Result<Vec<Action>, KeelError> {
        let paths = self.store.existing_project(project)?;
        self.log_for(project, &paths).recent(
            n.unwrap_or(self.config.memory.api_window),
            Order::NewestFirst,
        )
    }

    pub fn all_actions(&self, project: &ProjectId) -> Result<Vec<Action>, KeelError> {
        let paths = self.store.existing_project(project)?;
        self.log_for(project, &paths).all()
    }

    // --- context ---

    pub fn build(&self, project: &ProjectId) -> Result<ContextDocument, KeelError> {
        let paths = self.store.existing_project(project)?;
        self.context.build(project, &paths)
    }

    pub fn regenerate(&self, project: &ProjectId) -> Result<ContextDocument, KeelError> {
        let paths = self.store.existing_project(project)?;
        self.context.regenerate(project, &paths)
    }

    /// Replace the user notes, cut to `notes_max_chars`. Returns the stored length.
    pub fn save_notes(&self, project: &ProjectId, notes: &str) -> Result<usize, KeelError> {
        let paths = self.store.existing_project(project)?;
        let broker = ProjectBroker::new(project, &paths)?;
        broker.with_lock("keel", "config.save_notes", || {
            let now = time::now_epoch_ms();
            let mut cfg = match records::load_project_config(&paths)? {
                Loaded::Present(cfg) => cfg,
                Loaded::Missing => ProjectConfig::new(project, "", now),
                Loaded::Corrupt { reason } => {
                    warn!(project = %project, reason = %reason, "config corrupt; rewriting");
                    jsonfile::quarantine(&paths.config())?;
                    ProjectConfig::new(project, "", now)
                }
            };
            let stored = cfg.set_notes(notes, self.config.context.notes_max_chars, now);
            records::save_project_config(&paths, &cfg)?;
            self.log_for(project, &paths).append_locked(NewAction::new(
                "Updated user notes",
                ActionPayload::Note { chars: stored },
            ))?;
            Ok(stored)
        })
    }

    // --- commit history and snapshot ---

    /// Record a commit from the git collaborator. Returns `None` when the
    /// commit was already known.
    pub fn record_commit(
        &self,
        project: &ProjectId,
        commit: &CommitInfo,
    ) -> Result<Option<CommitEntry>, KeelError> {
        let paths = self.store.existing_project(project)?;
        let entry = CommitEntry::from_info(commit)?;
        let broker = ProjectBroker::new(project, &paths)?;
        broker.with_lock("keel", "commits.record", || {
            self.record_commit_locked(project, &paths, entry)
        })
    }

    fn record_commit_locked(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
        entry: CommitEntry,
    ) -> Result<Option<CommitEntry>, KeelError> {
        let mut history = match records::load_commit_history(paths)? {
            Loaded::Present(doc) => doc,
            Loaded::Missing => CommitHistoryDocument::default(),
            Loaded::Corrupt { reason } => {
                warn!(project = %project, reason = %reason, "commit history corrupt; starting fresh");
                jsonfile::quarantine(&paths.commit_history())?;
                CommitHistoryDocument::default()
            }
        };
        if !history.record(entry.clone()) {
            debug!(project = %project, commit = %entry.commit_id, "commit already recorded");
            return Ok(None);
        }
        let index = Index::new(project, paths);
        if let Err(e) = index.mark_pending(SOURCE_COMMITS) {
            warn!(project = %project, error = %e, "could not mark index pending");
        }
        records::save_commit_history(paths, &history)?;
        if let Err(e) = index.mirror_commits(&history.history, false) {
            warn!(project = %project, error = %e, "commit mirror failed; left pending");
        }
        self.log_for(project, paths).append_locked(NewAction::new(
            format!("Committed {}: {}", entry.commit_id, entry.summary),
            ActionPayload::Commit {
                commit_id: entry.commit_id_full.clone(),
                files: entry.files_changed.clone(),
            },
        ))?;
        Ok(Some(entry))
    }

    pub fn update_snapshot<F>(&self, project: &ProjectId, f: F) -> Result<Snapshot, KeelError>
    where
        F: FnOnce(&mut Snapshot),
    {
        let paths = self.store.existing_project(project)?;
        let broker = ProjectBroker::new(project, &paths)?;
        broker.with_lock("keel", "snapshot.update", || update_snapshot_locked(&paths, f))
    }

    // --- index ---

    pub fn query(
        &self,
        project: &ProjectId,
        filter: &QueryFilter,
    ) -> Result<Vec<IndexRecord>, KeelError> {
        let paths = self.store.existing_project(project)?;
        Index::new(project, &paths).query(filter)
    }

    pub fn aggregate(&self, project: &ProjectId) -> Result<IndexAggregate, KeelError> {
        let paths = self.store.existing_project(project)?;
        Index::new(project, &paths).aggregate()
    }

    pub fn sync_states(&self, project: &ProjectId) -> Result<Vec<SyncState>, KeelError> {
        let paths = self.store.existing_project(project)?;
        Index::new(project, &paths).sync_states()
    }

    pub fn reindex(&self, project: &ProjectId) -> Result<ReindexReport, KeelError> {
        let paths = self.store.existing_project(project)?;
        Index::new(project, &paths).reindex()
    }

    pub fn reindex_all(&self) -> Result<Vec<(ProjectId, Result<ReindexReport, KeelError>)>, KeelError> {
        let projects = self.list_projects()?;
        Ok(projects
            .into_par_iter()
            .map(|id| {
                let result = self.reindex(&id);
                (id, result)
            })
            .collect())
    }

    // --- maintenance ---

    pub fn maintain(&self, project: &ProjectId) -> Result<MaintenanceReport, KeelError> {
        let paths = self.store.existing_project(project)?;
        self.maintenance.maintain(project, &paths)
    }

    pub fn maintain_all(&self) -> Result<Vec<Result<MaintenanceReport, KeelError>>, KeelError> {
        self.maintenance.maintain_all(&self.store)
    }

    // --- task flow ---

    /// Route a task, gate its paths, run it and record the result.
    pub fn handle_task(
        &self,
        project: &ProjectId,
        task: &str,
        executor: &dyn Executor,
    ) -> Result<TaskOutcome, KeelError> {
        let paths = self.store.existing_project(project)?;
        let routed = self.route(task);
        info!(
            project = %project,
            intent = %routed.intent,
            matcher = %routed.matcher,
            confidence = routed.confidence,
            "task routed"
        );

        if routed.intent == Intent::ArchiveProject {
            return self.archive_from_task(project, routed);
        }

        let broker = ProjectBroker::new(project, &paths)?;
        match routed.intent {
            // Gate and mutate in one scope so the verdict still holds when the file is touched.
            Intent::DeleteFile => broker.with_lock("keel", "task.delete_file", || {
                match self.gate_locked(project, &paths, &routed, OpKind::Delete)? {
                    Ok(targets) => self.delete_files_locked(project, &paths, routed.clone(), &targets),
                    Err(refused) => Ok(refused),
                }
            }),
            Intent::UpdateFile => broker.with_lock("keel", "task.update_file", || {
                match self.gate_locked(project, &paths, &routed, OpKind::Write)? {
                    Ok(targets) => self.update_file_locked(project, &paths, routed.clone(), &targets),
                    Err(refused) => Ok(refused),
                }
            }),
            _ => {
                let gated = broker.with_lock("keel", "task.guard", || {
                    self.gate_locked(project, &paths, &routed, OpKind::Read)
                })?;
                match gated {
                    Ok(_) => self.execute(project, &paths, routed, executor),
                    Err(refused) => Ok(refused),
                }
            }
        }
    }

    /// Normalized targets, or the refusal for the first denied path.
    fn gate_locked(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
        routed: &RoutedCommand,
        kind: OpKind,
    ) -> Result<Result<Vec<String>, TaskOutcome>, KeelError> {
        let requested = routed.paths();
        let mut normalized = Vec::with_capacity(requested.len());
        for path in &requested {
            let decision = self.check_locked(project, paths, path, kind)?;
            if !decision.is_allowed() {
                return Ok(Err(TaskOutcome::Refused {
                    routed: routed.clone(),
                    message: decision.user_message(),
                }));
            }
            normalized.push(decision.normalized.unwrap_or_else(|| path.clone()));
        }
        Ok(Ok(normalized))
    }

    fn archive_from_task(
        &self,
        project: &ProjectId,
        routed: RoutedCommand,
    ) -> Result<TaskOutcome, KeelError> {
        let target = ProjectId::parse(routed.param("project_name").unwrap_or_default())?;
        self.archive_project(&target)?;
        let context_hash = if &target == project {
            None
        } else {
            Some(self.regenerate(project)?.content_hash)
        };
        Ok(TaskOutcome::Completed {
            summary: Some(format!("Project '{}' moved to trash", target)),
            routed,
            success: true,
            run_id: None,
            context_hash,
        })
    }

    fn delete_files_locked(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
        routed: RoutedCommand,
        targets: &[String],
    ) -> Result<TaskOutcome, KeelError> {
        let report = remove_targets(&paths.root, targets, |p| fs::remove_file(p));
        let mut summary = format!("Deleted {}", report.removed.join(", "));
        if !report.missing.is_empty() {
            summary = format!(
                "Deleted [{}]; not found [{}]",
                report.removed.join(", "),
                report.missing.join(", ")
            );
        }
        if let Some((rel, err)) = &report.failed {
            warn!(project = %project, path = %rel, error = %err, "delete failed");
            summary.push_str(&format!("; could not delete {}: {}", rel, err));
        }
        // Whatever was removed is recorded, even when a later target failed.
        if !report.removed.is_empty() {
            self.log_for(project, paths).append_locked(NewAction::new(
                summary.clone(),
                ActionPayload::FileDelete {
                    paths: report.removed.clone(),
                },
            ))?;
            update_snapshot_locked(paths, |s| s.pending_changes = true)?;
        }
        let success = report.missing.is_empty() && report.failed.is_none();
        self.finish_locked(project, paths, routed, success, Some(summary), None)
    }

    fn update_file_locked(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
        routed: RoutedCommand,
        targets: &[String],
    ) -> Result<TaskOutcome, KeelError> {
        let Some(rel) = targets.first() else {
            return Err(KeelError::ValidationError(
                "update_file needs a file path".to_string(),
            ));
        };
        let content = routed.param("content").unwrap_or_default().to_string();
        let full = paths.root.join(rel);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        jsonfile::write_bytes_atomic(&full, content.as_bytes())?;
        let summary = format!("Wrote {} ({} bytes)", rel, content.len());
        self.log_for(project, paths).append_locked(NewAction::new(
            summary.clone(),
            ActionPayload::FileUpdate {
                path: rel.clone(),
                bytes: content.len() as u64,
            },
        ))?;
        update_snapshot_locked(paths, |s| s.pending_changes = true)?;
        self.finish_locked(project, paths, routed, true, Some(summary), None)
    }

    /// Executor call happens outside the project scope; recording happens inside it.
    fn execute(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
        routed: RoutedCommand,
        executor: &dyn Executor,
    ) -> Result<TaskOutcome, KeelError> {
        let request = ExecutionRequest {
            project: project.clone(),
            project_root: paths.root.clone(),
            intent: routed.intent,
            task: routed.original.clone(),
            params: routed.params.clone(),
        };
        let started = Instant::now();
        let outcome = match executor.execute(&request) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(project = %project, error = %e, "executor failed");
                ExecutionOutcome {
                    success: false,
                    change_summary: Some(format!("executor error: {}", e)),
                    duration_ms: started.elapsed().as_millis() as u64,
                    raw_output: e.to_string(),
                    ..Default::default()
                }
            }
        };

        let broker = ProjectBroker::new(project, paths)?;
        broker.with_lock("keel", "task.record", || {
            let run_id = self.record_run_locked(project, paths, &routed, &outcome)?;
            if let Some(commit) = &outcome.commit {
                match CommitEntry::from_info(commit) {
                    Ok(entry) => {
                        self.record_commit_locked(project, paths, entry)?;
                    }
                    Err(e) => warn!(project = %project, error = %e, "executor reported an invalid commit"),
                }
            }
            let script = routed.param("script_path").map(str::to_string);
            update_snapshot_locked(paths, |s| {
                s.last_run = Some(time::now_epoch_ms());
                s.last_run_status = Some(RunStatus::from_success(outcome.success).as_str().to_string());
                if script.is_some() {
                    s.last_run_script = script.clone();
                }
                s.status = (if outcome.success { "ok" } else { "error" }).to_string();
                if outcome.commit.is_some() {
                    s.pending_changes = false;
                } else if !outcome.changed_files.is_empty() {
                    s.pending_changes = true;
                }
            })?;
            self.finish_locked(
                project,
                paths,
                routed,
                outcome.success,
                outcome.change_summary.clone(),
                Some(run_id),
            )
        })
    }

    fn record_run_locked(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
        routed: &RoutedCommand,
        outcome: &ExecutionOutcome,
    ) -> Result<String, KeelError> {
        let status = RunStatus::from_success(outcome.success);
        let record = RunRecord {
            run_id: Ulid::new().to_string(),
            project: project.to_string(),
            intent: routed.intent,
            task: routed.original.clone(),
            script_path: routed.param("script_path").map(str::to_string),
            status,
            returncode: outcome.returncode,
            duration_ms: outcome.duration_ms,
            summary: outcome.change_summary.clone(),
            error_keywords: if outcome.success {
                Vec::new()
            } else {
                runs::error_keywords(&outcome.raw_output)
            },
            timestamp: time::now_epoch_ms(),
            raw_output: outcome.raw_output.clone(),
        };

        let index = Index::new(project, paths);
        if let Err(e) = index.mark_pending(SOURCE_RUNS) {
            warn!(project = %project, error = %e, "could not mark index pending");
        }
        runs::write(paths, &record)?;
        if let Err(e) = index.upsert(&IndexInput::Run(record.clone())) {
            warn!(project = %project, error = %e, "run mirror failed; left pending");
        }

        let description = match (&routed.intent, &record.summary) {
            (_, Some(summary)) if !summary.trim().is_empty() => summary.clone(),
            (Intent::RunLocal, _) => format!(
                "Ran {}",
                record.script_path.as_deref().unwrap_or("script")
            ),
            _ => format!("Executed task: {}", routed.original),
        };
        let payload = match (routed.intent, &record.script_path) {
            (Intent::RunLocal, Some(script)) => ActionPayload::RunLocal {
                script: script.clone(),
                status,
                returncode: record.returncode,
                duration_ms: record.duration_ms,
                run_id: Some(record.run_id.clone()),
            },
            _ => ActionPayload::Execute {
                status,
                returncode: record.returncode,
                duration_ms: record.duration_ms,
                summary: record.summary.clone(),
                run_id: Some(record.run_id.clone()),
            },
        };
        self.log_for(project, paths)
            .append_locked(NewAction::new(description, payload))?;
        Ok(record.run_id)
    }

    /// Regenerate the context and trim, still inside the caller's scope.
    fn finish_locked(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
        routed: RoutedCommand,
        success: bool,
        summary: Option<String>,
        run_id: Option<String>,
    ) -> Result<TaskOutcome, KeelError> {
        let doc = self.context.regenerate_locked(project, paths)?;
        let report = self.maintenance.maintain_locked(project, paths);
        if !report.failures.is_empty() {
            warn!(project = %project, failures = report.failures.len(), "post-task maintenance incomplete");
        }
        Ok(TaskOutcome::Completed {
            routed,
            success,
            summary,
            run_id,
            context_hash: Some(doc.content_hash),
        })
    }
}

fn update_snapshot_locked<F>(paths: &ProjectPaths, f: F) -> Result<Snapshot, KeelError>
where
    F: FnOnce(&mut Snapshot),
{
    let mut snapshot = match records::load_snapshot(paths)? {
        Loaded::Present(s) => s,
        Loaded::Missing => Snapshot::default(),
        Loaded::Corrupt { reason } => {
            warn!(path = %paths.snapshot().display(), reason = %reason, "snapshot corrupt; resetting");
            Snapshot::default()
        }
    };
    f(&mut snapshot);
    records::save_snapshot(paths, &snapshot)?;
    Ok(snapshot)
}

#[derive(Debug, Default)]
struct DeleteReport {
    removed: Vec<String>,
    missing: Vec<String>,
    /// First target that could not be removed. Later targets are left alone.
    failed: Option<(String, std::io::Error)>,
}

fn remove_targets<F>(root: &Path, targets: &[String], mut remove: F) -> DeleteReport
where
    F: FnMut(&Path) -> std::io::Result<()>,
{
    let mut report = DeleteReport::default();
    for rel in targets {
        let full = root.join(rel);
        if !full.is_file() {
            report.missing.push(rel.clone());
            continue;
        }
        match remove(&full) {
            Ok(()) => report.removed.push(rel.clone()),
            Err(e) => {
                report.failed = Some((rel.clone(), e));
                break;
            }
        }
    }
    report
}
