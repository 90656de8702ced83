//! Workspace layout and project identity.
//!
//! A [`Store`] is the workspace root. Every project lives under
//! `<root>/projects/<id>/` and keeps its state files in a `.keel/` directory
//! inside the project tree. Nothing here holds a notion of an "active"
//! project; callers pass a [`ProjectId`] explicitly.

use crate::core::error::KeelError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

pub const PROJECTS_DIR: &str = "projects";
pub const TRASH_DIR: &str = ".trash";
pub const STATE_DIR: &str = ".keel";

pub const ACTION_LOG_FILE: &str = "memory.json";
pub const COMMIT_HISTORY_FILE: &str = "commit_history.json";
pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const PROJECT_CONFIG_FILE: &str = "config.json";
pub const CONTEXT_FILE: &str = "context_full.json";
pub const INDEX_DB_FILE: &str = "context.db";
pub const ACTIONS_LOG_FILE: &str = "actions.log";
pub const AUDIT_LOG_FILE: &str = "broker.events.jsonl";

const MAX_PROJECT_ID_LEN: usize = 64;

static PROJECT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));

/// Names that are filesystem-hostile on at least one platform.
const RESERVED_NAMES: &[&str] = &[
    "con", "nul", "prn", "aux", "com1", "com2", "com3", "lpt1", "lpt2", "lpt3",
];

/// Validated, path-safe project identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    pub fn parse(raw: &str) -> Result<Self, KeelError> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(KeelError::ValidationError(
                "project identifier is empty".to_string(),
            ));
        }
        if name.len() > MAX_PROJECT_ID_LEN {
            return Err(KeelError::ValidationError(format!(
                "project identifier longer than {} characters",
                MAX_PROJECT_ID_LEN
            )));
        }
        if !PROJECT_ID_RE.is_match(name) {
            return Err(KeelError::ValidationError(format!(
                "project identifier '{}' may only contain letters, digits, '_' and '-'",
                name
            )));
        }
        if RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
            return Err(KeelError::ValidationError(format!(
                "project identifier '{}' is reserved",
                name
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ProjectId {
    type Error = KeelError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProjectId> for String {
    fn from(value: ProjectId) -> Self {
        value.0
    }
}

/// Store handle representing a Keel workspace.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the workspace root directory
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join(PROJECTS_DIR)
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.projects_dir().join(TRASH_DIR)
    }

    pub fn project(&self, id: &ProjectId) -> ProjectPaths {
        ProjectPaths::new(self.projects_dir().join(id.as_str()))
    }

    /// Paths for an existing project; `NotFound` when the root is missing.
    pub fn existing_project(&self, id: &ProjectId) -> Result<ProjectPaths, KeelError> {
        let paths = self.project(id);
        if !paths.root.is_dir() {
            return Err(KeelError::NotFound(format!("project '{}'", id)));
        }
        Ok(paths)
    }
}

/// Per-project file layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: PathBuf) -> Self {
        let state_dir = root.join(STATE_DIR);
        Self { root, state_dir }
    }

    pub fn action_log(&self) -> PathBuf {
        self.state_dir.join(ACTION_LOG_FILE)
    }

    pub fn commit_history(&self) -> PathBuf {
        self.state_dir.join(COMMIT_HISTORY_FILE)
    }

    pub fn snapshot(&self) -> PathBuf {
        self.state_dir.join(SNAPSHOT_FILE)
    }

    pub fn config(&self) -> PathBuf {
        self.state_dir.join(PROJECT_CONFIG_FILE)
    }

    pub fn context(&self) -> PathBuf {
        self.state_dir.join(CONTEXT_FILE)
    }

    pub fn index_db(&self) -> PathBuf {
        self.state_dir.join(INDEX_DB_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.logs_dir().join("runs")
    }

    pub fn actions_log(&self) -> PathBuf {
        self.logs_dir().join(ACTIONS_LOG_FILE)
    }

    pub fn audit_log(&self) -> PathBuf {
        self.logs_dir().join(AUDIT_LOG_FILE)
    }

    pub fn readme(&self) -> Option<PathBuf> {
        ["README.md", "readme.md", "README.MD", "README"]
            .iter()
            .map(|name| self.root.join(name))
            .find(|p| p.is_file())
    }
}
