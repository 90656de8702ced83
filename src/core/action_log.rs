//! Append-only, size-bounded record of what the agent did in a project.
//!
//! `memory.json` is the source of truth. Each append runs inside the
//! project's broker scope and:
//! 1. validates the action (rejections happen before any write)
//! 2. assigns the next sequence number and a non-decreasing timestamp
//! 3. evicts the oldest entries past the cap, strictly FIFO
//! 4. marks the index pending, swaps the new document into place, then
//!    mirrors the append and the new trim offset into the index in one
//!    transaction
//!
//! If step 4 fails after the JSON write, the index stays `pending` and is
//! rebuilt before its next read.

use crate::core::broker::ProjectBroker;
use crate::core::error::KeelError;
use crate::core::index::{Index, SOURCE_ACTIONS};
use crate::core::jsonfile::{self, Loaded};
use crate::core::maintenance::{FileClass, TrimEvent};
use crate::core::path_guard::OpKind;
use crate::core::store::{ProjectId, ProjectPaths};
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use tracing::{debug, warn};

pub const ACTION_LOG_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Execute,
    Commit,
    FileUpdate,
    FileDelete,
    RunLocal,
    Archive,
    Protection,
    Note,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Execute => "execute",
            ActionType::Commit => "commit",
            ActionType::FileUpdate => "file_update",
            ActionType::FileDelete => "file_delete",
            ActionType::RunLocal => "run_local",
            ActionType::Archive => "archive",
            ActionType::Protection => "protection",
            ActionType::Note => "note",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn from_success(success: bool) -> Self {
        if success {
            RunStatus::Success
        } else {
            RunStatus::Failure
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }
}

/// Structured detail attached to an action; one variant per action type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPayload {
    Execute {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        returncode: Option<i32>,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },
    Commit {
        commit_id: String,
        files: Vec<String>,
    },
    FileUpdate {
        path: String,
        bytes: u64,
    },
    FileDelete {
        paths: Vec<String>,
    },
    RunLocal {
        script: String,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        returncode: Option<i32>,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },
    Archive {
        project: String,
    },
    Protection {
        path: String,
        operation: OpKind,
        rule: String,
        allowed: bool,
    },
    Note {
        chars: usize,
    },
}

impl ActionPayload {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionPayload::Execute { .. } => ActionType::Execute,
            ActionPayload::Commit { .. } => ActionType::Commit,
            ActionPayload::FileUpdate { .. } => ActionType::FileUpdate,
            ActionPayload::FileDelete { .. } => ActionType::FileDelete,
            ActionPayload::RunLocal { .. } => ActionType::RunLocal,
            ActionPayload::Archive { .. } => ActionType::Archive,
            ActionPayload::Protection { .. } => ActionType::Protection,
            ActionPayload::Note { .. } => ActionType::Note,
        }
    }

    /// Short status label used by the context document and the index.
    pub fn status_label(&self) -> &'static str {
        match self {
            ActionPayload::Execute { status, .. } | ActionPayload::RunLocal { status, .. } => {
                status.as_str()
            }
            ActionPayload::Protection { allowed: true, .. } => "allowed",
            ActionPayload::Protection { allowed: false, .. } => "denied",
            _ => "ok",
        }
    }

    fn validate(&self) -> Result<(), KeelError> {
        let bad = |msg: &str| Err(KeelError::ValidationError(msg.to_string()));
        match self {
            ActionPayload::Commit { commit_id, .. } if commit_id.trim().is_empty() => {
                bad("commit payload needs a commit id")
            }
            ActionPayload::FileUpdate { path, .. } if path.trim().is_empty() => {
                bad("file_update payload needs a path")
            }
            ActionPayload::FileDelete { paths } if paths.is_empty() => {
                bad("file_delete payload needs at least one path")
            }
            ActionPayload::RunLocal { script, .. } if script.trim().is_empty() => {
                bad("run_local payload needs a script path")
            }
            ActionPayload::Archive { project } if project.trim().is_empty() => {
                bad("archive payload needs a project name")
            }
            ActionPayload::Protection { path, rule, .. }
                if path.is_empty() || rule.trim().is_empty() =>
            {
                bad("protection payload needs a path and the rule that fired")
            }
            _ => Ok(()),
        }
    }
}

/// An action as submitted by a caller, before sequencing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAction {
    pub action_type: ActionType,
    pub description: String,
    pub payload: ActionPayload,
}

impl NewAction {
    pub fn new(description: impl Into<String>, payload: ActionPayload) -> Self {
        Self {
            action_type: payload.action_type(),
            description: description.into(),
            payload,
        }
    }

    pub fn validate(&self) -> Result<(), KeelError> {
        if self.description.trim().is_empty() {
            return Err(KeelError::ValidationError(
                "action description is empty".to_string(),
            ));
        }
        if self.payload.action_type() != self.action_type {
            return Err(KeelError::ValidationError(format!(
                "payload '{}' does not match action type '{}'",
                self.payload.action_type().as_str(),
                self.action_type.as_str()
            )));
        }
        self.payload.validate()
    }
}

/// Immutable stored action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Absolute position in the project's history; never reused.
    pub seq: u64,
    /// Epoch milliseconds, non-decreasing within a project.
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub description: String,
    pub extra: ActionPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ActionStats {
    /// Every action ever appended, retained or not.
    pub total_actions: u64,
    pub by_type: BTreeMap<ActionType, u64>,
    /// Actions dropped by FIFO eviction. Also the seq of the oldest retained action.
    pub evicted_total: u64,
}

/// On-disk `memory.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLogDocument {
    pub version: String,
    pub project_name: String,
    pub created_at: u64,
    pub last_updated: u64,
    pub stats: ActionStats,
    pub actions: Vec<Action>,
}

impl ActionLogDocument {
    pub fn empty(project: &ProjectId, now: u64) -> Self {
        Self {
            version: ACTION_LOG_VERSION.to_string(),
            project_name: project.to_string(),
            created_at: now,
            last_updated: now,
            stats: ActionStats::default(),
            actions: Vec::new(),
        }
    }

    /// Offset of the first retained action in the logical log.
    pub fn trim_offset(&self) -> u64 {
        self.stats.evicted_total
    }

    /// Logical length: every action ever appended.
    pub fn logical_len(&self) -> u64 {
        self.stats.total_actions
    }

    /// Drop the oldest entries until at most `cap` remain. Returns how many went.
    pub fn evict_to(&mut self, cap: usize) -> u64 {
        if self.actions.len() <= cap {
            return 0;
        }
        let excess = self.actions.len() - cap;
        self.actions.drain(..excess);
        self.stats.evicted_total += excess as u64;
        excess as u64
    }

    fn push(&mut self, action: NewAction, now: u64) -> Action {
        let last = self.actions.last().map(|a| a.timestamp).or(Some(self.last_updated));
        let timestamp = time::monotonic_after(last, now);
        let stored = Action {
            seq: self.stats.total_actions,
            timestamp,
            action_type: action.action_type,
            description: action.description.trim().to_string(),
            extra: action.payload,
        };
        self.stats.total_actions += 1;
        *self.stats.by_type.entry(stored.action_type).or_insert(0) += 1;
        self.last_updated = timestamp;
        self.actions.push(stored.clone());
        stored
    }

    pub fn is_consistent(&self) -> bool {
        self.stats.total_actions == self.stats.evicted_total + self.actions.len() as u64
            && self
                .actions
                .iter()
                .enumerate()
                .all(|(i, a)| a.seq == self.stats.evicted_total + i as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    OldestFirst,
    NewestFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub action: Action,
    pub trim: Option<TrimEvent>,
}

pub fn load_document(paths: &ProjectPaths) -> Result<Loaded<ActionLogDocument>, KeelError> {
    jsonfile::load(&paths.action_log())
}

pub struct ActionLog {
    project: ProjectId,
    paths: ProjectPaths,
    cap: usize,
}

impl ActionLog {
    pub fn new(project: &ProjectId, paths: &ProjectPaths, cap: usize) -> Self {
        Self {
            project: project.clone(),
            paths: paths.clone(),
            cap: cap.max(1),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Current document. Missing file reads as an empty log.
    pub fn document(&self) -> Result<ActionLogDocument, KeelError> {
        match load_document(&self.paths)? {
            Loaded::Present(doc) => Ok(doc),
            Loaded::Missing => Ok(ActionLogDocument::empty(&self.project, 0)),
            Loaded::Corrupt { reason } => Err(KeelError::CorruptSource {
                path: self.paths.action_log().display().to_string(),
                reason,
            }),
        }
    }

    pub fn all(&self) -> Result<Vec<Action>, KeelError> {
        Ok(self.document()?.actions)
    }

    /// The `n` most recent actions in the requested order.
    pub fn recent(&self, n: usize, order: Order) -> Result<Vec<Action>, KeelError> {
        let actions = self.document()?.actions;
        let start = actions.len().saturating_sub(n);
        let mut window = actions[start..].to_vec();
        if order == Order::NewestFirst {
            window.reverse();
        }
        Ok(window)
    }

    pub fn append(&self, action: NewAction) -> Result<AppendOutcome, KeelError> {
        action.validate()?;
        let broker = ProjectBroker::new(&self.project, &self.paths)?;
        broker.with_lock("keel", "action_log.append", || self.append_locked(action))
    }

    /// Append while the caller already holds the project's broker scope.
    pub(crate) fn append_locked(&self, action: NewAction) -> Result<AppendOutcome, KeelError> {
        action.validate()?;
        let now = time::now_epoch_ms();
        let index = Index::new(&self.project, &self.paths);

        let (mut doc, recovered) = match load_document(&self.paths)? {
            Loaded::Present(doc) => (doc, false),
            Loaded::Missing => (ActionLogDocument::empty(&self.project, now), false),
            Loaded::Corrupt { reason } => {
                let moved = jsonfile::quarantine(&self.paths.action_log())?;
                warn!(
                    project = %self.project,
                    reason = %reason,
                    moved_to = %moved.display(),
                    "action log corrupt; starting a fresh log"
                );
                (ActionLogDocument::empty(&self.project, now), true)
            }
        };

        let before = doc.actions.len() as u64;
        let stored = doc.push(action, now);
        let evicted = doc.evict_to(self.cap);
        let trim = (evicted > 0).then(|| TrimEvent {
            class: FileClass::ActionLog,
            source: SOURCE_ACTIONS.to_string(),
            before: before + 1,
            after: doc.actions.len() as u64,
            removed: evicted,
            trim_offset: Some(doc.trim_offset()),
            at: stored.timestamp,
        });

        if let Err(e) = index.mark_pending(SOURCE_ACTIONS) {
            warn!(project = %self.project, error = %e, "could not mark index pending");
        }
        jsonfile::write_atomic(&self.paths.action_log(), &doc)?;
        self.append_plaintext(&stored);

        if !recovered {
            if let Err(e) = index.mirror_append(&stored, doc.trim_offset(), doc.logical_len(), evicted > 0) {
                warn!(project = %self.project, error = %e, "index mirror failed; left pending");
            }
        }
        debug!(
            project = %self.project,
            seq = stored.seq,
            action_type = stored.action_type.as_str(),
            evicted,
            "action appended"
        );

        Ok(AppendOutcome {
            action: stored,
            trim,
        })
    }

    /// FIFO-trim to `cap` outside of an append. Caller holds the broker scope.
    pub(crate) fn trim_locked(&self, cap: usize) -> Result<Option<TrimEvent>, KeelError> {
        let mut doc = match load_document(&self.paths)? {
            Loaded::Present(doc) => doc,
            Loaded::Missing => return Ok(None),
            Loaded::Corrupt { reason } => {
                return Err(KeelError::CorruptSource {
                    path: self.paths.action_log().display().to_string(),
                    reason,
                });
            }
        };
        let before = doc.actions.len() as u64;
        let removed = doc.evict_to(cap.max(1));
        if removed == 0 {
            return Ok(None);
        }
        let index = Index::new(&self.project, &self.paths);
        if let Err(e) = index.mark_pending(SOURCE_ACTIONS) {
            warn!(project = %self.project, error = %e, "could not mark index pending");
        }
        jsonfile::write_atomic(&self.paths.action_log(), &doc)?;
        if let Err(e) = index.mirror_trim(doc.trim_offset(), doc.logical_len()) {
            warn!(project = %self.project, error = %e, "index trim mirror failed; left pending");
        }
        Ok(Some(TrimEvent {
            class: FileClass::ActionLog,
            source: SOURCE_ACTIONS.to_string(),
            before,
            after: doc.actions.len() as u64,
            removed,
            trim_offset: Some(doc.trim_offset()),
            at: time::now_epoch_ms(),
        }))
    }

    /// Human-readable trail next to the JSON log. Best effort.
    fn append_plaintext(&self, action: &Action) {
        let path = self.paths.actions_log();
        let line = format!(
            "[{}] #{} {}: {}\n",
            time::ms_to_epoch_z(action.timestamp),
            action.seq,
            action.action_type.as_str(),
            action.description.replace('\n', " ")
        );
        let result = fs::create_dir_all(self.paths.logs_dir()).and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?
                .write_all(line.as_bytes())
        });
        if let Err(e) = result {
            warn!(project = %self.project, error = %e, "actions.log append failed");
        }
    }
}
