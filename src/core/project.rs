//! Project lifecycle: create, list, archive, delete.

use crate::core::action_log::{ActionLog, ActionLogDocument, ActionPayload, NewAction};
use crate::core::broker::ProjectBroker;
use crate::core::error::KeelError;
use crate::core::index::Index;
use crate::core::jsonfile;
use crate::core::records::{self, CommitHistoryDocument, ProjectConfig, Snapshot};
use crate::core::store::{ProjectId, ProjectPaths, Store};
use crate::core::time;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::info;

const SCAFFOLD_DIRS: &[&str] = &["src", "tests", "docs"];

fn readme_template(project: &ProjectId, description: &str) -> String {
    format!(
        "# {}\n\n{}\n\n## Project Structure\n\n- `src/` - Source code\n- `tests/` - Test files\n- `docs/` - Documentation\n",
        project,
        if description.trim().is_empty() {
            "New project"
        } else {
            description.trim()
        }
    )
}

/// Create the project tree and seed every state file.
pub fn create(store: &Store, project: &ProjectId, description: &str) -> Result<ProjectPaths, KeelError> {
    let paths = store.project(project);
    fs::create_dir_all(store.projects_dir())?;
    // Claiming the root with a non-recursive create is the existence check;
    // of two racing creates exactly one gets past it.
    match fs::create_dir(&paths.root) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(KeelError::ValidationError(format!(
                "project '{}' already exists",
                project
            )));
        }
        Err(e) => return Err(e.into()),
    }

    let broker = ProjectBroker::new(project, &paths)?;
    broker.with_lock("keel", "project.create", || {
        for dir in SCAFFOLD_DIRS {
            fs::create_dir_all(paths.root.join(dir))?;
        }
        fs::create_dir_all(paths.runs_dir())?;
        fs::write(paths.root.join("README.md"), readme_template(project, description))?;

        let now = time::now_epoch_ms();
        jsonfile::write_atomic(&paths.action_log(), &ActionLogDocument::empty(project, now))?;
        records::save_project_config(&paths, &ProjectConfig::new(project, description, now))?;
        records::save_snapshot(&paths, &Snapshot::default())?;
        records::save_commit_history(&paths, &CommitHistoryDocument::default())?;
        Index::new(project, &paths).init()
    })?;
    info!(project = %project, "project created");
    Ok(paths)
}

/// Active projects sorted by name. Dot-directories and names that are not
/// valid identifiers are skipped.
pub fn list(store: &Store) -> Result<Vec<ProjectId>, KeelError> {
    let dir = store.projects_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if let Ok(id) = ProjectId::parse(&name) {
            out.push(id);
        }
    }
    out.sort();
    Ok(out)
}

/// Soft delete: record the archive in the project's own log, then move the
/// tree to `projects/.trash/<id>`, replacing an earlier archive of the same name.
pub fn archive(store: &Store, project: &ProjectId, action_cap: usize) -> Result<PathBuf, KeelError> {
    let paths = store.existing_project(project)?;
    let target = store.trash_dir().join(project.as_str());
    let broker = ProjectBroker::new(project, &paths)?;
    broker.with_lock("keel", "project.archive", || {
        let log = ActionLog::new(project, &paths, action_cap);
        log.append_locked(NewAction::new(
            format!("Archived project {}", project),
            ActionPayload::Archive {
                project: project.to_string(),
            },
        ))?;
        fs::create_dir_all(store.trash_dir())?;
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&paths.root, &target)?;
        Ok(())
    })?;
    info!(project = %project, to = %target.display(), "project archived");
    Ok(target)
}

/// Hard delete of the project tree.
pub fn delete(store: &Store, project: &ProjectId) -> Result<(), KeelError> {
    let paths = store.existing_project(project)?;
    let broker = ProjectBroker::new(project, &paths)?;
    broker.with_lock("keel", "project.delete", || {
        fs::remove_dir_all(&paths.root)?;
        Ok(())
    })?;
    info!(project = %project, "project deleted");
    Ok(())
}

/// Archived project names.
pub fn archived(store: &Store) -> Result<Vec<String>, KeelError> {
    let dir = store.trash_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out: Vec<String> = fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    out.sort();
    Ok(out)
}
