//! Unified context document.
//!
//! [`ContextBuilder::build`] re-reads `memory.json`, `commit_history.json`,
//! `snapshot.json`, `config.json` and the README on every call; nothing is
//! cached between calls. A missing source yields its default section. A
//! corrupt source does the same and is listed under `degraded`. Only a
//! project that cannot be resolved fails the build.

use crate::core::action_log::{self, ActionStats, ActionType};
use crate::core::broker::ProjectBroker;
use crate::core::config::KeelConfig;
use crate::core::error::KeelError;
use crate::core::index::{Index, IndexInput, SOURCE_CONTEXT};
use crate::core::jsonfile::{self, Loaded};
use crate::core::readme::ReadmeBlock;
use crate::core::records::{self, CommitEntry, ProjectConfig, Snapshot, UserMemory};
use crate::core::router::clean_token;
use crate::core::store::{ProjectId, ProjectPaths};
use crate::core::time;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use tracing::{debug, warn};

pub const CONTEXT_VERSION: &str = "1.0";
pub const DEFAULT_FOCUS: &str = "General development";

const FOCUS_WINDOW: usize = 10;
const FOCUS_TERMS: usize = 3;
const COMMON_OPERATIONS: usize = 5;
const FOCUS_STOPWORDS: &[&str] = &[
    "with", "from", "that", "this", "were", "been", "have", "will", "your", "into",
];

/// Files whose presence at the project root implies a technology.
const MARKER_FILES: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("package.json", "javascript"),
    ("requirements.txt", "python"),
    ("setup.py", "python"),
    ("pyproject.toml", "python"),
    ("go.mod", "go"),
    ("pom.xml", "java"),
    ("Dockerfile", "docker"),
    ("docker-compose.yml", "docker"),
    ("tsconfig.json", "typescript"),
];

const EXTENSION_HINTS: &[(&str, &str)] = &[
    (".py", "python"),
    (".js", "javascript"),
    (".jsx", "javascript"),
    (".ts", "typescript"),
    (".tsx", "typescript"),
    (".rs", "rust"),
    (".go", "go"),
    (".java", "java"),
    (".rb", "ruby"),
    (".sh", "shell"),
    (".html", "html"),
    (".css", "css"),
    (".sql", "sql"),
];

const KEYWORD_HINTS: &[(&str, &str)] = &[
    ("python", "python"),
    ("pytest", "python"),
    ("pip", "python"),
    ("node", "javascript"),
    ("npm", "javascript"),
    ("typescript", "typescript"),
    ("cargo", "rust"),
    ("rust", "rust"),
    ("golang", "go"),
    ("maven", "java"),
    ("gradle", "java"),
    ("docker", "docker"),
    ("dockerfile", "docker"),
    ("postgres", "sql"),
    ("mysql", "sql"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectBlock {
    pub name: String,
    pub description: String,
    pub created_at: u64,
    pub tech_stack: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommitsBlock {
    pub last_commit: Option<CommitEntry>,
    pub recent: Vec<CommitEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentAction {
    pub time: u64,
    pub action: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityBlock {
    pub total_actions: u64,
    pub common_operations: Vec<ActionType>,
    pub recent_focus: String,
    /// Newest first.
    pub recent_actions: Vec<RecentAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedSource {
    pub source: String,
    pub reason: String,
}

/// On-disk `context_full.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDocument {
    pub version: String,
    pub generated_at: String,
    /// sha256 of the document with `generated_at` and `content_hash` blanked.
    pub content_hash: String,
    pub project: ProjectBlock,
    pub readme: ReadmeBlock,
    pub commits: CommitsBlock,
    pub activity: ActivityBlock,
    pub snapshot: Snapshot,
    pub config: ProjectConfig,
    pub stats: ActionStats,
    pub user_memory: Option<UserMemory>,
    #[serde(default)]
    pub degraded: Vec<DegradedSource>,
}

impl ContextDocument {
    pub fn canonical_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let canonical = Self {
            generated_at: String::new(),
            content_hash: String::new(),
            ..self.clone()
        };
        serde_json::to_vec(&canonical)
    }

    pub fn computed_hash_hex(&self) -> Result<String, serde_json::Error> {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json_bytes()?);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Equal up to regeneration time.
    pub fn same_content(&self, other: &Self) -> bool {
        self.content_hash == other.content_hash
            && self.canonical_json_bytes().ok() == other.canonical_json_bytes().ok()
    }
}

#[derive(Debug, Clone)]
pub struct ContextBuilder {
    context_window: usize,
    readme_chars: usize,
    notes_max_chars: usize,
    recent_commits: usize,
}

impl ContextBuilder {
    pub fn new(config: &KeelConfig) -> Self {
        Self {
            context_window: config.memory.context_window,
            readme_chars: config.context.readme_chars,
            notes_max_chars: config.context.notes_max_chars,
            recent_commits: config.context.recent_commits,
        }
    }

    pub fn build(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
    ) -> Result<ContextDocument, KeelError> {
        if !paths.root.is_dir() {
            return Err(KeelError::NotFound(format!("project '{}'", project)));
        }
        let mut degraded = Vec::new();
        let mut note = |source: &str, reason: String| {
            warn!(project = %project, source, reason = %reason, "context source degraded");
            degraded.push(DegradedSource {
                source: source.to_string(),
                reason,
            });
        };

        let log = match action_log::load_document(paths)? {
            Loaded::Present(doc) => Some(doc),
            Loaded::Missing => None,
            Loaded::Corrupt { reason } => {
                note("memory", reason);
                None
            }
        };
        let history = match records::load_commit_history(paths)? {
            Loaded::Present(doc) => doc,
            Loaded::Missing => Default::default(),
            Loaded::Corrupt { reason } => {
                note("commit_history", reason);
                Default::default()
            }
        };
        let snapshot = match records::load_snapshot(paths)? {
            Loaded::Present(s) => s,
            Loaded::Missing => Snapshot::default(),
            Loaded::Corrupt { reason } => {
                note("snapshot", reason);
                Snapshot::default()
            }
        };
        let config = match records::load_project_config(paths)? {
            Loaded::Present(c) => c,
            Loaded::Missing => ProjectConfig::new(project, "", 0),
            Loaded::Corrupt { reason } => {
                note("config", reason);
                ProjectConfig::new(project, "", 0)
            }
        };
        let readme = match paths.readme() {
            None => ReadmeBlock::default(),
            Some(path) => match fs::read(&path) {
                Ok(bytes) => ReadmeBlock::from_content(
                    &String::from_utf8_lossy(&bytes),
                    config.readme_chars(self.readme_chars),
                ),
                Err(e) => {
                    note("readme", e.to_string());
                    ReadmeBlock::default()
                }
            },
        };

        let (stats, actions) = match log {
            Some(doc) => (doc.stats, doc.actions),
            None => (ActionStats::default(), Vec::new()),
        };

        let start = actions.len().saturating_sub(self.context_window);
        let recent_actions = actions[start..]
            .iter()
            .rev()
            .map(|a| RecentAction {
                time: a.timestamp,
                action: a.description.clone(),
                status: a.extra.status_label().to_string(),
            })
            .collect();

        let descriptions: Vec<&str> = actions.iter().map(|a| a.description.as_str()).collect();
        let focus_start = descriptions.len().saturating_sub(FOCUS_WINDOW);

        let user_memory = config.user_memory.clone().map(|mut m| {
            m.notes = m.notes.chars().take(self.notes_max_chars).collect();
            m
        });

        let mut doc = ContextDocument {
            version: CONTEXT_VERSION.to_string(),
            generated_at: time::now_epoch_z(),
            content_hash: String::new(),
            project: ProjectBlock {
                name: project.to_string(),
                description: config.description.clone(),
                created_at: config.created_at,
                tech_stack: tech_stack(paths, &descriptions),
            },
            readme,
            commits: CommitsBlock {
                last_commit: history.last_commit.clone(),
                recent: history
                    .history
                    .iter()
                    .take(self.recent_commits)
                    .cloned()
                    .collect(),
            },
            activity: ActivityBlock {
                total_actions: stats.total_actions,
                common_operations: common_operations(&stats),
                recent_focus: recent_focus(&descriptions[focus_start..]),
                recent_actions,
            },
            snapshot,
            config: config.without_user_memory(),
            stats,
            user_memory,
            degraded,
        };
        doc.content_hash = doc.computed_hash_hex()?;
        debug!(project = %project, hash = %doc.content_hash, "context built");
        Ok(doc)
    }

    /// Build, persist `context_full.json` and mirror it into the index.
    pub fn regenerate(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
    ) -> Result<ContextDocument, KeelError> {
        let broker = ProjectBroker::new(project, paths)?;
        broker.with_lock("keel", "context.regenerate", || {
            self.regenerate_locked(project, paths)
        })
    }

    pub(crate) fn regenerate_locked(
        &self,
        project: &ProjectId,
        paths: &ProjectPaths,
    ) -> Result<ContextDocument, KeelError> {
        let doc = self.build(project, paths)?;
        let index = Index::new(project, paths);
        if let Err(e) = index.mark_pending(SOURCE_CONTEXT) {
            warn!(project = %project, error = %e, "could not mark index pending");
        }
        jsonfile::write_atomic(&paths.context(), &doc)?;
        if let Err(e) = index.upsert(&IndexInput::Document(doc.clone())) {
            warn!(project = %project, error = %e, "context index upsert failed; left pending");
        }
        Ok(doc)
    }
}

/// Action types by cumulative count, most frequent first.
fn common_operations(stats: &ActionStats) -> Vec<ActionType> {
    let mut ops: Vec<(ActionType, u64)> = stats.by_type.iter().map(|(t, n)| (*t, *n)).collect();
    ops.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ops.into_iter()
        .take(COMMON_OPERATIONS)
        .map(|(t, _)| t)
        .collect()
}

/// Most frequent words of four or more letters across recent descriptions.
fn recent_focus(descriptions: &[&str]) -> String {
    let mut counts: FxHashMap<String, (usize, usize)> = FxHashMap::default();
    let mut order = 0usize;
    for desc in descriptions {
        for word in desc
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| w.chars().count() >= 4)
        {
            let word = word.to_lowercase();
            if FOCUS_STOPWORDS.contains(&word.as_str()) {
                continue;
            }
            let entry = counts.entry(word).or_insert((0, order));
            entry.0 += 1;
            order += 1;
        }
    }
    if counts.is_empty() {
        return DEFAULT_FOCUS.to_string();
    }
    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.0.cmp(&a.1.0).then(a.1.1.cmp(&b.1.1)));
    ranked
        .into_iter()
        .take(FOCUS_TERMS)
        .map(|(w, _)| w)
        .collect::<Vec<_>>()
        .join(", ")
}

fn tech_stack(paths: &ProjectPaths, descriptions: &[&str]) -> Vec<String> {
    let mut found: BTreeSet<&'static str> = MARKER_FILES
        .iter()
        .filter(|(file, _)| paths.root.join(file).is_file())
        .map(|(_, tech)| *tech)
        .collect();
    for desc in descriptions {
        for raw in desc.split_whitespace() {
            let token = clean_token(raw).to_lowercase();
            if token.is_empty() {
                continue;
            }
            for (ext, tech) in EXTENSION_HINTS {
                if token.len() > ext.len() && token.ends_with(ext) {
                    found.insert(tech);
                }
            }
            if let Some((_, tech)) = KEYWORD_HINTS.iter().find(|(kw, _)| *kw == token) {
                found.insert(tech);
            }
        }
    }
    found.into_iter().map(str::to_string).collect()
}
