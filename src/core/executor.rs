//! Seam to the external executor (the AI coding tool, script runner and git
//! plumbing). Keel never runs code itself; it hands an [`ExecutionRequest`]
//! to whatever implements [`Executor`] and records the outcome.

use crate::core::error::KeelError;
use crate::core::router::Intent;
use crate::core::store::ProjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub project: ProjectId,
    pub project_root: PathBuf,
    pub intent: Intent,
    pub task: String,
    pub params: BTreeMap<String, String>,
}

/// Commit produced by the git collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub commit_id: String,
    pub message: String,
    pub files: Vec<String>,
    /// Epoch milliseconds; defaults to record time.
    #[serde(default)]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub change_summary: Option<String>,
    pub duration_ms: u64,
    /// Kept in the run-record file only; never indexed.
    pub raw_output: String,
    pub returncode: Option<i32>,
    pub commit: Option<CommitInfo>,
    /// Files the executor reports as modified but not committed.
    #[serde(default)]
    pub changed_files: Vec<String>,
}

pub trait Executor: Send + Sync {
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, KeelError>;
}

impl<F> Executor for F
where
    F: Fn(&ExecutionRequest) -> Result<ExecutionOutcome, KeelError> + Send + Sync,
{
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, KeelError> {
        self(request)
    }
}

/// Executor for surfaces with no collaborator attached: every request fails
/// with an explanatory outcome.
pub struct Unavailable;

impl Executor for Unavailable {
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, KeelError> {
        Ok(ExecutionOutcome {
            success: false,
            change_summary: Some(format!(
                "no executor attached for intent '{}'",
                request.intent
            )),
            ..Default::default()
        })
    }
}
