//! CLI struct definitions for the Keel command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "keel",
    version = env!("CARGO_PKG_VERSION"),
    about = "Keel keeps the persistent state of a code-change agent: routed intents, guarded paths, a bounded action log and a rebuildable index."
)]
pub(crate) struct Cli {
    /// Workspace root (holds `keel.toml` and `projects/`). Defaults to
    /// `$KEEL_ROOT`, then the current directory.
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Classify a task string without side effects
    Route {
        task: String,
    },
    /// Project lifecycle
    Project(ProjectCli),
    /// Evaluate a path against the guard and record the verdict
    Check {
        #[clap(long)]
        project: String,
        #[clap(long)]
        path: String,
        /// read, write or delete
        #[clap(long, default_value = "read")]
        kind: String,
    },
    /// Action log access
    Log(LogCli),
    /// Context document
    Context(ContextCli),
    /// Index queries and rebuilds
    Index(IndexCli),
    /// Trim tracked files for one project, or all of them
    Maintain {
        #[clap(long)]
        project: Option<String>,
    },
    /// Route and run a task; executor-backed intents fail without a collaborator
    Task {
        #[clap(long)]
        project: String,
        task: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct ProjectCli {
    #[clap(subcommand)]
    pub command: ProjectCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ProjectCommand {
    Create {
        name: String,
        #[clap(long, default_value = "")]
        description: String,
    },
    List,
    /// Move a project to `projects/.trash/`
    Archive {
        name: String,
    },
    /// Remove a project tree permanently
    Delete {
        name: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct LogCli {
    #[clap(subcommand)]
    pub command: LogCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum LogCommand {
    /// Append a note action
    Append {
        #[clap(long)]
        project: String,
        #[clap(long)]
        description: String,
    },
    /// Most recent actions, newest first
    Recent {
        #[clap(long)]
        project: String,
        #[clap(long, short = 'n')]
        limit: Option<usize>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct ContextCli {
    #[clap(subcommand)]
    pub command: ContextCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ContextCommand {
    /// Build the context document; `--write` also persists and indexes it
    Build {
        #[clap(long)]
        project: String,
        #[clap(long)]
        write: bool,
    },
    /// Replace the user notes
    Notes {
        #[clap(long)]
        project: String,
        notes: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct IndexCli {
    #[clap(subcommand)]
    pub command: IndexCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum IndexCommand {
    Query {
        #[clap(long)]
        project: String,
        /// document, commit, run or action
        #[clap(long)]
        kind: Option<String>,
        #[clap(long)]
        action_type: Option<String>,
        #[clap(long)]
        status: Option<String>,
        /// Epoch milliseconds, inclusive
        #[clap(long)]
        since: Option<u64>,
        #[clap(long)]
        limit: Option<usize>,
    },
    Aggregate {
        #[clap(long)]
        project: String,
    },
    /// Rebuild from the JSON sources; every project when none is given
    Reindex {
        #[clap(long)]
        project: Option<String>,
    },
    /// Show sync_metadata rows
    Status {
        #[clap(long)]
        project: String,
    },
}
