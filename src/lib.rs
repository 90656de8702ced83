//! Keel: persistent state for a code-change agent.
//!
//! Keel remembers, across restarts and concurrent requests, what an
//! automation agent did to a project, why, and what is currently true.
//!
//! # Control flow
//!
//! ```text
//! task ─▶ router ─▶ path guard ─▶ executor ─▶ action log ─▶ context ─▶ index
//!                                                  └──────▶ maintenance
//! ```
//!
//! - **Router**: pure, ordered matchers turn a task string into an intent
//!   with parameters and a confidence. First match wins.
//! - **PathGuard**: closed allow-list; traversal and out-of-project paths
//!   are always denied and `.keel/` infrastructure is never writable.
//! - **ActionLog**: `memory.json` is the source of truth, FIFO-trimmed to
//!   a cap, with stats updated in the same write as each append.
//! - **Index**: a SQLite mirror with `sync_metadata`; stale reads trigger a
//!   synchronous rebuild from the JSON sources.
//!
//! All mutation of a project goes through its broker scope
//! ([`core::broker::ProjectBroker`]). Projects never share a lock.
//!
//! # Crate Structure
//!
//! - [`core`]: every subsystem, plus [`core::engine::Engine`] which wires
//!   them into the operations outer surfaces call.

pub mod core;

mod cli;

use crate::cli::{
    Cli, Command, ContextCommand, IndexCommand, LogCommand, ProjectCommand,
};
use crate::core::action_log::{ActionPayload, NewAction};
use crate::core::engine::Engine;
use crate::core::error::KeelError;
use crate::core::executor::Unavailable;
use crate::core::index::{QueryFilter, RecordKind};
use crate::core::path_guard::OpKind;
use crate::core::store::ProjectId;
use crate::core::time;
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;

pub const ROOT_ENV: &str = "KEEL_ROOT";

fn emit(cmd: &str, status: &str, payload: impl Serialize) -> Result<(), KeelError> {
    let value = serde_json::to_value(payload)?;
    let extra = if value.is_object() {
        value
    } else {
        json!({ "result": value })
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&time::command_envelope(cmd, status, extra))?
    );
    Ok(())
}

fn resolve_root(flag: Option<PathBuf>) -> Result<PathBuf, KeelError> {
    if let Some(root) = flag {
        return Ok(root);
    }
    if let Some(root) = std::env::var_os(ROOT_ENV) {
        return Ok(PathBuf::from(root));
    }
    Ok(std::env::current_dir()?)
}

fn parse_kind(raw: &str) -> Result<OpKind, KeelError> {
    OpKind::parse(raw).ok_or_else(|| {
        KeelError::ValidationError(format!("unknown operation kind '{}'", raw))
    })
}

pub fn run() -> Result<(), KeelError> {
    let cli = Cli::parse();

    if let Command::Route { task } = &cli.command {
        let routed = core::router::route(task);
        return emit("route", "ok", &routed);
    }

    let engine = Engine::open(resolve_root(cli.root)?)?;

    match cli.command {
        Command::Route { .. } => Ok(()),
        Command::Project(group) => match group.command {
            ProjectCommand::Create { name, description } => {
                let id = ProjectId::parse(&name)?;
                let paths = engine.create_project(&id, &description)?;
                emit(
                    "project.create",
                    "ok",
                    json!({ "project": id, "root": paths.root }),
                )
            }
            ProjectCommand::List => {
                let projects = engine.list_projects()?;
                emit("project.list", "ok", json!({ "projects": projects }))
            }
            ProjectCommand::Archive { name } => {
                let id = ProjectId::parse(&name)?;
                let target = engine.archive_project(&id)?;
                emit(
                    "project.archive",
                    "ok",
                    json!({ "project": id, "archived_to": target }),
                )
            }
            ProjectCommand::Delete { name } => {
                let id = ProjectId::parse(&name)?;
                engine.delete_project(&id)?;
                emit("project.delete", "ok", json!({ "project": id }))
            }
        },
        Command::Check {
            project,
            path,
            kind,
        } => {
            let id = ProjectId::parse(&project)?;
            let decision = engine.check(&id, &path, parse_kind(&kind)?)?;
            let message = decision.user_message();
            match decision.clone().into_result() {
                Ok(normalized) => emit(
                    "check",
                    "allowed",
                    json!({ "path": normalized, "decision": decision }),
                ),
                Err(e) => emit(
                    "check",
                    "denied",
                    json!({ "error": e.kind(), "message": message, "decision": decision }),
                ),
            }
        }
        Command::Log(group) => match group.command {
            LogCommand::Append {
                project,
                description,
            } => {
                let id = ProjectId::parse(&project)?;
                let chars = description.trim().chars().count();
                let outcome = engine.append(
                    &id,
                    NewAction::new(description, ActionPayload::Note { chars }),
                )?;
                emit(
                    "log.append",
                    "ok",
                    json!({ "action": outcome.action, "trim": outcome.trim }),
                )
            }
            LogCommand::Recent { project, limit } => {
                let id = ProjectId::parse(&project)?;
                let actions = engine.recent(&id, limit)?;
                emit("log.recent", "ok", json!({ "actions": actions }))
            }
        },
        Command::Context(group) => match group.command {
            ContextCommand::Build { project, write } => {
                let id = ProjectId::parse(&project)?;
                let doc = if write {
                    engine.regenerate(&id)?
                } else {
                    engine.build(&id)?
                };
                emit("context.build", "ok", json!({ "context": doc }))
            }
            ContextCommand::Notes { project, notes } => {
                let id = ProjectId::parse(&project)?;
                let stored = engine.save_notes(&id, &notes)?;
                emit("context.notes", "ok", json!({ "stored_chars": stored }))
            }
        },
        Command::Index(group) => match group.command {
            IndexCommand::Query {
                project,
                kind,
                action_type,
                status,
                since,
                limit,
            } => {
                let id = ProjectId::parse(&project)?;
                let kind = match kind {
                    Some(raw) => Some(RecordKind::parse(&raw).ok_or_else(|| {
                        KeelError::ValidationError(format!("unknown record kind '{}'", raw))
                    })?),
                    None => None,
                };
                let filter = QueryFilter {
                    kind,
                    action_type,
                    status,
                    since,
                    limit,
                };
                let records = engine.query(&id, &filter)?;
                emit("index.query", "ok", json!({ "records": records }))
            }
            IndexCommand::Aggregate { project } => {
                let id = ProjectId::parse(&project)?;
                emit("index.aggregate", "ok", engine.aggregate(&id)?)
            }
            IndexCommand::Reindex { project: Some(project) } => {
                let id = ProjectId::parse(&project)?;
                emit("index.reindex", "ok", engine.reindex(&id)?)
            }
            IndexCommand::Reindex { project: None } => {
                let results: Vec<_> = engine
                    .reindex_all()?
                    .into_iter()
                    .map(|(id, r)| match r {
                        Ok(report) => json!({ "project": id, "report": report }),
                        Err(e) => json!({ "project": id, "error": e.to_string() }),
                    })
                    .collect();
                emit("index.reindex", "ok", json!({ "projects": results }))
            }
            IndexCommand::Status { project } => {
                let id = ProjectId::parse(&project)?;
                emit("index.status", "ok", json!({ "sources": engine.sync_states(&id)? }))
            }
        },
        Command::Maintain { project: Some(project) } => {
            let id = ProjectId::parse(&project)?;
            emit("maintain", "ok", engine.maintain(&id)?)
        }
        Command::Maintain { project: None } => {
            let reports: Vec<_> = engine
                .maintain_all()?
                .into_iter()
                .map(|r| match r {
                    Ok(report) => json!(report),
                    Err(e) => json!({ "error": e.to_string(), "kind": e.kind() }),
                })
                .collect();
            emit("maintain", "ok", json!({ "reports": reports }))
        }
        Command::Task { project, task } => {
            let id = ProjectId::parse(&project)?;
            let outcome = engine.handle_task(&id, &task, &Unavailable)?;
            emit("task", "ok", outcome)
        }
    }
}
