//! The project broker is the "thin waist" for per-project mutation.
//!
//! Every read-modify-write of a project's JSON sources or index goes through
//! [`ProjectBroker::with_lock`], which:
//! - serializes callers per project (in-process mutex from a global registry,
//!   plus an advisory file lock on `.keel/.lock` for other processes)
//! - appends an audit event to `logs/broker.events.jsonl`
//!
//! Different projects never share a lock. Waiters are admitted in no
//! particular order; `std::sync::Mutex` makes no fairness guarantee.

use crate::core::error::KeelError;
use crate::core::store::{ProjectId, ProjectPaths};
use crate::core::time;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, warn};

const LOCK_FILE: &str = ".lock";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub project: String,
    pub status: String,
}

/// Process-wide map from project root to its mutex.
struct LockRegistry {
    locks: Mutex<FxHashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    fn lock_for(&self, root: &PathBuf) -> Result<Arc<Mutex<()>>, KeelError> {
        let mut locks = self.locks.lock().map_err(|_| {
            KeelError::ValidationError("broker lock registry poisoned".to_string())
        })?;
        Ok(locks
            .entry(root.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}

fn registry() -> &'static LockRegistry {
    static REGISTRY: OnceLock<LockRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| LockRegistry {
        locks: Mutex::new(FxHashMap::default()),
    })
}

pub struct ProjectBroker {
    project: ProjectId,
    paths: ProjectPaths,
    lock: Arc<Mutex<()>>,
}

impl ProjectBroker {
    pub fn new(project: &ProjectId, paths: &ProjectPaths) -> Result<Self, KeelError> {
        let lock = registry().lock_for(&paths.root)?;
        Ok(Self {
            project: project.clone(),
            paths: paths.clone(),
            lock,
        })
    }

    /// Run `f` while holding the project's exclusive scope.
    pub fn with_lock<F, R>(&self, actor: &str, op: &str, f: F) -> Result<R, KeelError>
    where
        F: FnOnce() -> Result<R, KeelError>,
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| KeelError::ValidationError("project lock poisoned".to_string()))?;

        fs::create_dir_all(&self.paths.state_dir)?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.paths.state_dir.join(LOCK_FILE))?;
        lock_file.lock()?;
        debug!(project = %self.project, op, "broker lock acquired");

        let result = f();

        let status = if result.is_ok() { "success" } else { "error" };
        if self.paths.state_dir.is_dir() {
            if let Err(e) = self.log_event(actor, op, status) {
                warn!(project = %self.project, op, error = %e, "audit append failed");
            }
        }
        let _ = lock_file.unlock();

        result
    }

    fn log_event(&self, actor: &str, op: &str, status: &str) -> Result<(), KeelError> {
        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            project: self.project.to_string(),
            status: status.to_string(),
        };

        let path = self.paths.audit_log();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(f, "{}", serde_json::to_string(&ev)?)?;
        Ok(())
    }
}

/// Read back the audit log; unparsable lines are skipped.
pub fn read_audit(paths: &ProjectPaths) -> Result<Vec<BrokerEvent>, KeelError> {
    let path = paths.audit_log();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(&path)?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<BrokerEvent>(line).ok())
        .collect())
}
