//! Small per-project JSON records consumed by the context builder:
//! commit history, run snapshot and project configuration.
//!
//! Writers here assume the caller holds the project's broker scope.

use crate::core::config::{README_CHARS_MAX, README_CHARS_MIN};
use crate::core::error::KeelError;
use crate::core::executor::CommitInfo;
use crate::core::jsonfile::{self, Loaded};
use crate::core::store::{ProjectId, ProjectPaths};
use crate::core::time;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const RECORD_VERSION: &str = "1.0";
pub const SHORT_COMMIT_LEN: usize = 7;

static COMMIT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{7,64}$").expect("static regex"));

// --- CommitHistory ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub commit_id: String,
    pub commit_id_full: String,
    pub summary: String,
    pub files_changed: Vec<String>,
    pub timestamp: u64,
}

impl CommitEntry {
    pub fn from_info(info: &CommitInfo) -> Result<Self, KeelError> {
        let full = info.commit_id.trim();
        if !COMMIT_ID_RE.is_match(full) {
            return Err(KeelError::ValidationError(format!(
                "'{}' is not a commit hash",
                full
            )));
        }
        let summary = info.message.lines().next().unwrap_or_default().trim();
        Ok(Self {
            commit_id: full[..SHORT_COMMIT_LEN].to_lowercase(),
            commit_id_full: full.to_lowercase(),
            summary: if summary.is_empty() {
                "(no message)".to_string()
            } else {
                summary.to_string()
            },
            files_changed: info.files.clone(),
            timestamp: info.timestamp.unwrap_or_else(time::now_epoch_ms),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitHistoryDocument {
    pub version: String,
    pub last_commit: Option<CommitEntry>,
    /// Newest first.
    pub history: Vec<CommitEntry>,
}

impl Default for CommitHistoryDocument {
    fn default() -> Self {
        Self {
            version: RECORD_VERSION.to_string(),
            last_commit: None,
            history: Vec::new(),
        }
    }
}

impl CommitHistoryDocument {
    /// Insert newest-first, de-duplicated by full hash. Returns false for a
    /// commit already present.
    pub fn record(&mut self, entry: CommitEntry) -> bool {
        if self
            .history
            .iter()
            .any(|c| c.commit_id_full == entry.commit_id_full)
        {
            return false;
        }
        self.history.insert(0, entry);
        self.last_commit = self.history.first().cloned();
        true
    }

    /// Keep the newest `cap` entries. Returns the number removed.
    pub fn trim(&mut self, cap: usize) -> usize {
        if self.history.len() <= cap {
            return 0;
        }
        let removed = self.history.len() - cap;
        self.history.truncate(cap);
        self.last_commit = self.history.first().cloned();
        removed
    }
}

pub fn load_commit_history(
    paths: &ProjectPaths,
) -> Result<Loaded<CommitHistoryDocument>, KeelError> {
    jsonfile::load(&paths.commit_history())
}

pub fn save_commit_history(
    paths: &ProjectPaths,
    doc: &CommitHistoryDocument,
) -> Result<(), KeelError> {
    jsonfile::write_atomic(&paths.commit_history(), doc)
}

// --- Snapshot ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub last_run: Option<u64>,
    pub last_run_status: Option<String>,
    pub last_run_script: Option<String>,
    pub status: String,
    pub pending_changes: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            last_run: None,
            last_run_status: None,
            last_run_script: None,
            status: "unknown".to_string(),
            pending_changes: false,
        }
    }
}

pub fn load_snapshot(paths: &ProjectPaths) -> Result<Loaded<Snapshot>, KeelError> {
    jsonfile::load(&paths.snapshot())
}

pub fn save_snapshot(paths: &ProjectPaths, snapshot: &Snapshot) -> Result<(), KeelError> {
    jsonfile::write_atomic(&paths.snapshot(), snapshot)
}

// --- ConfigStore ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MemoryOverrides {
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMemory {
    pub notes: String,
    pub last_updated: u64,
}

/// Per-project `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub version: String,
    pub project_name: String,
    pub description: String,
    pub created_at: u64,
    pub memory: MemoryOverrides,
    pub readme_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_memory: Option<UserMemory>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            version: RECORD_VERSION.to_string(),
            project_name: String::new(),
            description: String::new(),
            created_at: 0,
            memory: MemoryOverrides::default(),
            readme_chars: None,
            user_memory: None,
        }
    }
}

impl ProjectConfig {
    pub fn new(project: &ProjectId, description: &str, now: u64) -> Self {
        Self {
            project_name: project.to_string(),
            description: description.trim().to_string(),
            created_at: now,
            ..Default::default()
        }
    }

    /// Action cap for this project: the override when set, else the global cap.
    pub fn max_entries(&self, global: usize) -> usize {
        self.memory.max_entries.filter(|n| *n > 0).unwrap_or(global)
    }

    /// README excerpt length, always within the supported bounds.
    pub fn readme_chars(&self, global: usize) -> usize {
        self.readme_chars
            .unwrap_or(global)
            .clamp(README_CHARS_MIN, README_CHARS_MAX)
    }

    /// Store notes, cut to `max_chars` characters.
    pub fn set_notes(&mut self, notes: &str, max_chars: usize, now: u64) -> usize {
        let trimmed: String = notes.trim().chars().take(max_chars).collect();
        let len = trimmed.chars().count();
        self.user_memory = Some(UserMemory {
            notes: trimmed,
            last_updated: now,
        });
        len
    }

    /// Copy without user notes, as embedded in the context document.
    pub fn without_user_memory(&self) -> Self {
        Self {
            user_memory: None,
            ..self.clone()
        }
    }
}

pub fn load_project_config(paths: &ProjectPaths) -> Result<Loaded<ProjectConfig>, KeelError> {
    jsonfile::load(&paths.config())
}

pub fn save_project_config(paths: &ProjectPaths, config: &ProjectConfig) -> Result<(), KeelError> {
    jsonfile::write_atomic(&paths.config(), config)
}
