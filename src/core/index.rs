//! Queryable mirror of a project's JSON sources.
//!
//! The index is never authoritative. Every table can be rebuilt from
//! `memory.json`, `commit_history.json`, the run-record files and
//! `context_full.json` via [`Index::reindex`], which builds a fresh database
//! beside the live one and swaps it into place.
//!
//! `sync_metadata` has one row per source. Writers follow a two-phase
//! discipline: mark the source `pending`, write the JSON source, then apply
//! the index change and flip the row back to `synced` in one transaction.
//! [`Index::ensure_fresh`] refuses to serve reads while any row is pending or
//! the action offsets disagree with the log; it rebuilds synchronously
//! instead.

use crate::core::action_log::{self, Action, ActionLogDocument};
use crate::core::broker::ProjectBroker;
use crate::core::context::ContextDocument;
use crate::core::db;
use crate::core::error::KeelError;
use crate::core::jsonfile::{self, Loaded};
use crate::core::records::{self, CommitEntry};
use crate::core::runs::{self, RunRecord};
use crate::core::store::{ProjectId, ProjectPaths};
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub const SOURCE_ACTIONS: &str = "actions";
pub const SOURCE_RUNS: &str = "runs";
pub const SOURCE_COMMITS: &str = "commits";
pub const SOURCE_CONTEXT: &str = "context";
/// Prefix for plaintext-log sources, e.g. `log:actions.log`.
pub const SOURCE_LOG_PREFIX: &str = "log:";

const TRACKED_SOURCES: [&str; 4] = [SOURCE_ACTIONS, SOURCE_RUNS, SOURCE_COMMITS, SOURCE_CONTEXT];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
}

impl SyncStatus {
    fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
        }
    }

    fn parse(raw: &str) -> Self {
        if raw == "pending" {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub source: String,
    pub last_trim_offset: u64,
    pub synced_length: u64,
    pub last_synced_at: Option<String>,
    pub last_trimmed_at: Option<String>,
    pub status: SyncStatus,
}

/// Inputs accepted by [`Index::upsert`].
#[derive(Debug, Clone)]
pub enum IndexInput {
    Document(ContextDocument),
    Run(RunRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Document,
    Commit,
    Run,
    Action,
}

impl RecordKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "document" | "documents" => Some(RecordKind::Document),
            "commit" | "commits" => Some(RecordKind::Commit),
            "run" | "runs" => Some(RecordKind::Run),
            "action" | "actions" => Some(RecordKind::Action),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Restrict to one record kind; `None` returns every kind.
    pub kind: Option<RecordKind>,
    pub action_type: Option<String>,
    /// Matches action status labels and run statuses.
    pub status: Option<String>,
    /// Epoch milliseconds, inclusive.
    pub since: Option<u64>,
    /// Per-kind row limit.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum IndexRecord {
    Document {
        version_hash: String,
        generated_at: String,
        total_actions: u64,
        tech_stack: Vec<String>,
        status: String,
    },
    Commit {
        commit_id: String,
        summary: String,
        files_changed: u64,
        timestamp: u64,
    },
    Run {
        run_id: String,
        intent: String,
        script_path: Option<String>,
        status: String,
        returncode: Option<i32>,
        duration_ms: u64,
        summary: Option<String>,
        error_keywords: Vec<String>,
        timestamp: u64,
    },
    Action {
        seq: u64,
        ts: u64,
        action_type: String,
        description: String,
        status: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexAggregate {
    pub actions_by_type: BTreeMap<String, u64>,
    pub runs_by_status: BTreeMap<String, u64>,
    pub retained_actions: u64,
    pub commits: u64,
    pub documents: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexReport {
    pub actions: u64,
    pub runs: u64,
    pub commits: u64,
    pub documents: u64,
    /// Sources that could not be read and were indexed as empty.
    pub skipped: Vec<String>,
}

pub struct Index {
    project: ProjectId,
    paths: ProjectPaths,
}

impl Index {
    pub fn new(project: &ProjectId, paths: &ProjectPaths) -> Self {
        Self {
            project: project.clone(),
            paths: paths.clone(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.paths.index_db()
    }

    fn connect(&self) -> Result<Connection, KeelError> {
        fs::create_dir_all(&self.paths.state_dir)?;
        let conn = db::db_connect(&self.db_path())?;
        db::ensure_index_schema(&conn)?;
        Ok(conn)
    }

    /// Create the database and a `synced` row for every tracked source.
    pub fn init(&self) -> Result<(), KeelError> {
        let conn = self.connect()?;
        for source in TRACKED_SOURCES {
            conn.execute(
                "INSERT OR IGNORE INTO sync_metadata (source, last_synced_at, sync_status)
                 VALUES (?1, ?2, 'synced')",
                params![source, time::now_epoch_z()],
            )?;
        }
        Ok(())
    }

    /// Mirror a context document or a run record. Caller holds the project scope.
    pub fn upsert(&self, input: &IndexInput) -> Result<(), KeelError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        match input {
            IndexInput::Document(doc) => {
                insert_document(&tx, &self.project, doc)?;
                set_synced(&tx, SOURCE_CONTEXT, None, None, false)?;
            }
            IndexInput::Run(record) => {
                insert_run(&tx, record)?;
                set_synced(&tx, SOURCE_RUNS, None, None, false)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn mark_pending(&self, source: &str) -> Result<(), KeelError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO sync_metadata (source, sync_status) VALUES (?1, 'pending')
             ON CONFLICT(source) DO UPDATE SET sync_status = 'pending'",
            params![source],
        )?;
        Ok(())
    }

    pub fn sync_state(&self, source: &str) -> Result<Option<SyncState>, KeelError> {
        let conn = self.connect()?;
        read_sync_state(&conn, source)
    }

    pub fn sync_states(&self) -> Result<Vec<SyncState>, KeelError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT source, last_trim_offset, synced_length, last_synced_at, last_trimmed_at, sync_status
             FROM sync_metadata ORDER BY source",
        )?;
        let rows = stmt.query_map([], sync_state_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Insert one appended action, drop evicted rows and record the new
    /// offsets, all in one transaction.
    pub(crate) fn mirror_append(
        &self,
        action: &Action,
        trim_offset: u64,
        logical_len: u64,
        trimmed: bool,
    ) -> Result<(), KeelError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        insert_action(&tx, &self.project, action)?;
        tx.execute(
            "DELETE FROM actions WHERE seq < ?1",
            params![trim_offset as i64],
        )?;
        set_synced(
            &tx,
            SOURCE_ACTIONS,
            Some(trim_offset),
            Some(logical_len),
            trimmed,
        )?;
        tx.commit()?;
        Ok(())
    }

    pub(crate) fn mirror_trim(&self, trim_offset: u64, logical_len: u64) -> Result<(), KeelError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM actions WHERE seq < ?1",
            params![trim_offset as i64],
        )?;
        set_synced(
            &tx,
            SOURCE_ACTIONS,
            Some(trim_offset),
            Some(logical_len),
            true,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Replace the commit rows with exactly `history`.
    pub(crate) fn mirror_commits(
        &self,
        history: &[CommitEntry],
        trimmed: bool,
    ) -> Result<(), KeelError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM commits", [])?;
        for entry in history {
            insert_commit(&tx, &self.project, entry)?;
        }
        set_synced(
            &tx,
            SOURCE_COMMITS,
            None,
            Some(history.len() as u64),
            trimmed,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drop rows for run files removed by maintenance; `removed_total` is
    /// the cumulative count of evicted run records.
    pub(crate) fn mirror_run_trim(
        &self,
        removed: &[String],
        removed_total: u64,
    ) -> Result<(), KeelError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        for run_id in removed {
            tx.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
        }
        set_synced(&tx, SOURCE_RUNS, Some(removed_total), None, true)?;
        tx.commit()?;
        Ok(())
    }

    /// Record a plaintext-log trim; `trimmed_bytes_total` is cumulative.
    pub(crate) fn record_log_trim(
        &self,
        log_name: &str,
        trimmed_bytes_total: u64,
        size_after: u64,
    ) -> Result<(), KeelError> {
        let conn = self.connect()?;
        let source = format!("{}{}", SOURCE_LOG_PREFIX, log_name);
        set_synced(
            &conn,
            &source,
            Some(trimmed_bytes_total),
            Some(size_after),
            true,
        )?;
        Ok(())
    }

    /// `Err(StaleIndex)` when the index has not absorbed the current sources.
    pub fn check_fresh(&self) -> Result<(), KeelError> {
        let (log_offset, log_len) = match action_log::load_document(&self.paths)? {
            Loaded::Present(doc) => (doc.trim_offset(), doc.logical_len()),
            Loaded::Missing => (0, 0),
            // Nothing trustworthy to compare against; the next append
            // quarantines the file and forces a rebuild.
            Loaded::Corrupt { .. } => return Ok(()),
        };
        let stale = |index_offset: u64| KeelError::StaleIndex {
            project: self.project.to_string(),
            index_offset,
            log_offset,
        };

        if !self.db_path().exists() {
            return Err(stale(0));
        }
        let conn = self.connect()?;
        let Some(actions) = read_sync_state(&conn, SOURCE_ACTIONS)? else {
            return Err(stale(0));
        };
        if actions.status == SyncStatus::Pending
            || actions.last_trim_offset != log_offset
            || actions.synced_length != log_len
        {
            return Err(stale(actions.last_trim_offset));
        }
        for source in [SOURCE_RUNS, SOURCE_COMMITS, SOURCE_CONTEXT] {
            if let Some(state) = read_sync_state(&conn, source)? {
                if state.status == SyncStatus::Pending {
                    return Err(stale(actions.last_trim_offset));
                }
            }
        }
        Ok(())
    }

    /// Rebuild synchronously when stale. Returns whether a rebuild ran.
    pub fn ensure_fresh(&self) -> Result<bool, KeelError> {
        match self.check_fresh() {
            Ok(()) => return Ok(false),
            Err(KeelError::StaleIndex {
                index_offset,
                log_offset,
                ..
            }) => {
                debug!(project = %self.project, index_offset, log_offset, "index stale");
            }
            Err(KeelError::RusqliteError(e)) => {
                warn!(project = %self.project, error = %e, "index unreadable; rebuilding");
            }
            Err(e) => return Err(e),
        }

        let broker = ProjectBroker::new(&self.project, &self.paths)?;
        broker.with_lock("keel", "index.catch_up", || self.ensure_fresh_locked())
    }

    fn ensure_fresh_locked(&self) -> Result<bool, KeelError> {
        // Another caller may have rebuilt while we waited.
        match self.check_fresh() {
            Ok(()) => Ok(false),
            Err(KeelError::StaleIndex { .. }) | Err(KeelError::RusqliteError(_)) => {
                self.reindex_locked().map(|_| true)
            }
            Err(e) => Err(e),
        }
    }

    /// Run a read against a fresh index. Reads share the project scope with
    /// rebuilds, so they never see a database mid-swap.
    fn read_fresh<F, R>(&self, op: &str, f: F) -> Result<R, KeelError>
    where
        F: FnOnce(&Connection) -> Result<R, KeelError>,
    {
        let broker = ProjectBroker::new(&self.project, &self.paths)?;
        broker.with_lock("keel", op, || {
            if self.ensure_fresh_locked()? {
                debug!(project = %self.project, op, "index rebuilt before read");
            }
            let conn = self.connect()?;
            f(&conn)
        })
    }

    pub fn query(&self, filter: &QueryFilter) -> Result<Vec<IndexRecord>, KeelError> {
        self.read_fresh("index.query", |conn| query_records(conn, filter))
    }

    pub fn aggregate(&self) -> Result<IndexAggregate, KeelError> {
        self.read_fresh("index.aggregate", aggregate_counts)
    }

    /// Full rebuild from the JSON sources, under the project scope.
    pub fn reindex(&self) -> Result<ReindexReport, KeelError> {
        let broker = ProjectBroker::new(&self.project, &self.paths)?;
        broker.with_lock("keel", "index.reindex", || self.reindex_locked())
    }

    pub(crate) fn reindex_locked(&self) -> Result<ReindexReport, KeelError> {
        fs::create_dir_all(&self.paths.state_dir)?;
        let live = self.db_path();
        let tmp = self.paths.state_dir.join(".context.db.rebuild");
        remove_db_files(&tmp)?;

        // Carry over trim history that the JSON sources cannot reproduce.
        let previous: Vec<SyncState> = if live.exists() {
            match self.sync_states() {
                Ok(states) => states,
                Err(e) => {
                    warn!(
                        project = %self.project,
                        error = %e,
                        "sync history unreadable; trim offsets restart from the sources"
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let report = {
            let mut conn = db::db_connect(&tmp)?;
            db::ensure_index_schema(&conn)?;
            let report = self.populate(&mut conn, &previous)?;
            conn.query_row("PRAGMA journal_mode=DELETE;", [], |_| Ok(()))?;
            report
        };

        // The main file is replaced in one rename, so the path never goes
        // missing. Old sidecars would replay onto the new file; drop them first.
        remove_sidecars(&live)?;
        fs::rename(&tmp, &live)?;
        info!(
            project = %self.project,
            actions = report.actions,
            runs = report.runs,
            commits = report.commits,
            "index rebuilt"
        );
        Ok(report)
    }

    fn populate(
        &self,
        conn: &mut Connection,
        previous: &[SyncState],
    ) -> Result<ReindexReport, KeelError> {
        let mut report = ReindexReport::default();
        let tx = conn.transaction()?;

        let log = match action_log::load_document(&self.paths)? {
            Loaded::Present(doc) => doc,
            Loaded::Missing => ActionLogDocument::empty(&self.project, 0),
            Loaded::Corrupt { reason } => {
                warn!(project = %self.project, reason = %reason, "skipping corrupt action log");
                report.skipped.push(SOURCE_ACTIONS.to_string());
                ActionLogDocument::empty(&self.project, 0)
            }
        };
        for action in &log.actions {
            insert_action(&tx, &self.project, action)?;
        }
        report.actions = log.actions.len() as u64;

        let history = match records::load_commit_history(&self.paths)? {
            Loaded::Present(doc) => doc.history,
            Loaded::Missing => Vec::new(),
            Loaded::Corrupt { .. } => {
                report.skipped.push(SOURCE_COMMITS.to_string());
                Vec::new()
            }
        };
        for entry in &history {
            insert_commit(&tx, &self.project, entry)?;
        }
        report.commits = history.len() as u64;

        let run_listing = runs::list(&self.paths)?;
        for record in &run_listing.records {
            insert_run(&tx, record)?;
        }
        report.runs = run_listing.records.len() as u64;
        if !run_listing.unreadable.is_empty() {
            report.skipped.push(SOURCE_RUNS.to_string());
        }

        match jsonfile::load::<ContextDocument>(&self.paths.context())? {
            Loaded::Present(doc) => {
                insert_document(&tx, &self.project, &doc)?;
                report.documents = 1;
            }
            Loaded::Missing => {}
            Loaded::Corrupt { .. } => report.skipped.push(SOURCE_CONTEXT.to_string()),
        }

        let prev = |source: &str| previous.iter().find(|s| s.source == source);
        let now = time::now_epoch_z();
        let runs_offset = prev(SOURCE_RUNS).map(|s| s.last_trim_offset).unwrap_or(0);
        let rows: [(&str, u64, u64); 4] = [
            (SOURCE_ACTIONS, log.trim_offset(), log.logical_len()),
            (SOURCE_RUNS, runs_offset, report.runs),
            (SOURCE_COMMITS, 0, report.commits),
            (SOURCE_CONTEXT, 0, report.documents),
        ];
        for (source, offset, length) in rows {
            tx.execute(
                "INSERT INTO sync_metadata
                   (source, last_trim_offset, synced_length, last_synced_at, last_trimmed_at, sync_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'synced')",
                params![
                    source,
                    offset as i64,
                    length as i64,
                    now,
                    prev(source).and_then(|s| s.last_trimmed_at.clone())
                ],
            )?;
        }
        for state in previous
            .iter()
            .filter(|s| s.source.starts_with(SOURCE_LOG_PREFIX))
        {
            tx.execute(
                "INSERT INTO sync_metadata
                   (source, last_trim_offset, synced_length, last_synced_at, last_trimmed_at, sync_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'synced')",
                params![
                    state.source,
                    state.last_trim_offset as i64,
                    state.synced_length as i64,
                    now,
                    state.last_trimmed_at
                ],
            )?;
        }

        tx.commit()?;
        Ok(report)
    }
}

fn remove_db_files(path: &std::path::Path) -> Result<(), KeelError> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    remove_sidecars(path)
}

fn remove_sidecars(path: &std::path::Path) -> Result<(), KeelError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    for suffix in ["-wal", "-shm", "-journal"] {
        let candidate = path.with_file_name(format!("{}{}", name, suffix));
        if candidate.exists() {
            fs::remove_file(&candidate)?;
        }
    }
    Ok(())
}

fn sync_state_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncState> {
    let status: String = row.get(5)?;
    Ok(SyncState {
        source: row.get(0)?,
        last_trim_offset: row.get::<_, i64>(1)? as u64,
        synced_length: row.get::<_, i64>(2)? as u64,
        last_synced_at: row.get(3)?,
        last_trimmed_at: row.get(4)?,
        status: SyncStatus::parse(&status),
    })
}

fn read_sync_state(conn: &Connection, source: &str) -> Result<Option<SyncState>, KeelError> {
    Ok(conn
        .query_row(
            "SELECT source, last_trim_offset, synced_length, last_synced_at, last_trimmed_at, sync_status
             FROM sync_metadata WHERE source = ?1",
            params![source],
            sync_state_from_row,
        )
        .optional()?)
}

/// Upsert a sync row as `synced`. `None` leaves a numeric column unchanged.
fn set_synced(
    conn: &Connection,
    source: &str,
    trim_offset: Option<u64>,
    length: Option<u64>,
    trimmed: bool,
) -> Result<(), KeelError> {
    let now = time::now_epoch_z();
    conn.execute(
        "INSERT INTO sync_metadata
           (source, last_trim_offset, synced_length, last_synced_at, last_trimmed_at, sync_status)
         VALUES (?1, COALESCE(?2, 0), COALESCE(?3, 0), ?4, CASE WHEN ?5 THEN ?4 END, ?6)
         ON CONFLICT(source) DO UPDATE SET
           last_trim_offset = COALESCE(?2, last_trim_offset),
           synced_length = COALESCE(?3, synced_length),
           last_synced_at = ?4,
           last_trimmed_at = CASE WHEN ?5 THEN ?4 ELSE last_trimmed_at END,
           sync_status = ?6",
        params![
            source,
            trim_offset.map(|v| v as i64),
            length.map(|v| v as i64),
            now,
            trimmed,
            SyncStatus::Synced.as_str()
        ],
    )?;
    Ok(())
}

fn insert_action(conn: &Connection, project: &ProjectId, action: &Action) -> Result<(), KeelError> {
    conn.execute(
        "INSERT OR REPLACE INTO actions (seq, project, ts, action_type, description, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            action.seq as i64,
            project.as_str(),
            action.timestamp as i64,
            action.action_type.as_str(),
            action.description,
            action.extra.status_label()
        ],
    )?;
    Ok(())
}

fn insert_commit(
    conn: &Connection,
    project: &ProjectId,
    entry: &CommitEntry,
) -> Result<(), KeelError> {
    conn.execute(
        "INSERT OR REPLACE INTO commits (commit_id, project, summary, files_changed, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.commit_id_full,
            project.as_str(),
            entry.summary,
            entry.files_changed.len() as i64,
            entry.timestamp as i64
        ],
    )?;
    Ok(())
}

/// Metadata only: the raw output of a run never reaches the index.
fn insert_run(conn: &Connection, record: &RunRecord) -> Result<(), KeelError> {
    conn.execute(
        "INSERT OR REPLACE INTO runs
           (run_id, project, intent, script_path, status, returncode, duration_ms, summary,
            error_keywords, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.run_id,
            record.project,
            record.intent.as_str(),
            record.script_path,
            record.status.as_str(),
            record.returncode,
            record.duration_ms as i64,
            record.summary,
            serde_json::to_string(&record.error_keywords)?,
            record.timestamp as i64
        ],
    )?;
    Ok(())
}

/// The index keeps only the current document lineage head.
fn insert_document(
    conn: &Connection,
    project: &ProjectId,
    doc: &ContextDocument,
) -> Result<(), KeelError> {
    conn.execute(
        "DELETE FROM documents WHERE version_hash <> ?1",
        params![doc.content_hash],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO documents
           (version_hash, project, generated_at, total_actions, tech_stack, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            doc.content_hash,
            project.as_str(),
            doc.generated_at,
            doc.activity.total_actions as i64,
            serde_json::to_string(&doc.project.tech_stack)?,
            doc.snapshot.status
        ],
    )?;
    Ok(())
}

fn query_records(conn: &Connection, filter: &QueryFilter) -> Result<Vec<IndexRecord>, KeelError> {
    let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
    let since = filter.since.unwrap_or(0) as i64;
    let wants = |k: RecordKind| filter.kind.is_none_or(|f| f == k);
    let mut out = Vec::new();

    if wants(RecordKind::Document) && filter.action_type.is_none() && filter.status.is_none() {
        let mut stmt = conn.prepare(
            "SELECT version_hash, generated_at, total_actions, tech_stack, status
             FROM documents
             WHERE CAST(rtrim(generated_at, 'Z') AS INTEGER) >= ?1 / 1000
             ORDER BY generated_at DESC LIMIT ?2",
        )?;
        // generated_at has second resolution, so `since` is compared per second.
        let rows = stmt.query_map(params![since, limit], |row| {
            let stack: String = row.get(3)?;
            Ok(IndexRecord::Document {
                version_hash: row.get(0)?,
                generated_at: row.get(1)?,
                total_actions: row.get::<_, i64>(2)? as u64,
                tech_stack: serde_json::from_str(&stack).unwrap_or_default(),
                status: row.get(4)?,
            })
        })?;
        out.extend(rows.collect::<Result<Vec<_>, _>>()?);
    }

    if wants(RecordKind::Commit) && filter.action_type.is_none() && filter.status.is_none() {
        let mut stmt = conn.prepare(
            "SELECT commit_id, summary, files_changed, timestamp FROM commits
             WHERE timestamp >= ?1 ORDER BY timestamp DESC, commit_id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since, limit], |row| {
            Ok(IndexRecord::Commit {
                commit_id: row.get(0)?,
                summary: row.get(1)?,
                files_changed: row.get::<_, i64>(2)? as u64,
                timestamp: row.get::<_, i64>(3)? as u64,
            })
        })?;
        out.extend(rows.collect::<Result<Vec<_>, _>>()?);
    }

    if wants(RecordKind::Run) && filter.action_type.is_none() {
        let mut stmt = conn.prepare(
            "SELECT run_id, intent, script_path, status, returncode, duration_ms, summary,
                    error_keywords, timestamp
             FROM runs
             WHERE (?1 IS NULL OR status = ?1) AND timestamp >= ?2
             ORDER BY timestamp DESC, run_id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![filter.status, since, limit], |row| {
            let keywords: String = row.get(7)?;
            Ok(IndexRecord::Run {
                run_id: row.get(0)?,
                intent: row.get(1)?,
                script_path: row.get(2)?,
                status: row.get(3)?,
                returncode: row.get(4)?,
                duration_ms: row.get::<_, i64>(5)? as u64,
                summary: row.get(6)?,
                error_keywords: serde_json::from_str(&keywords).unwrap_or_default(),
                timestamp: row.get::<_, i64>(8)? as u64,
            })
        })?;
        out.extend(rows.collect::<Result<Vec<_>, _>>()?);
    }

    if wants(RecordKind::Action) {
        let mut stmt = conn.prepare(
            "SELECT seq, ts, action_type, description, status FROM actions
             WHERE (?1 IS NULL OR action_type = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND ts >= ?3
             ORDER BY seq DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![filter.action_type, filter.status, since, limit],
            |row| {
                Ok(IndexRecord::Action {
                    seq: row.get::<_, i64>(0)? as u64,
                    ts: row.get::<_, i64>(1)? as u64,
                    action_type: row.get(2)?,
                    description: row.get(3)?,
                    status: row.get(4)?,
                })
            },
        )?;
        out.extend(rows.collect::<Result<Vec<_>, _>>()?);
    }

    Ok(out)
}

fn aggregate_counts(conn: &Connection) -> Result<IndexAggregate, KeelError> {
    let mut agg = IndexAggregate {
        actions_by_type: grouped_counts(
            conn,
            "SELECT action_type, COUNT(*) FROM actions GROUP BY action_type",
        )?,
        runs_by_status: grouped_counts(
            conn,
            "SELECT status, COUNT(*) FROM runs GROUP BY status",
        )?,
        ..Default::default()
    };
    agg.retained_actions = agg.actions_by_type.values().sum();
    agg.commits = conn.query_row("SELECT COUNT(*) FROM commits", [], |r| r.get::<_, i64>(0))?
        as u64;
    agg.documents =
        conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get::<_, i64>(0))? as u64;
    Ok(agg)
}

fn grouped_counts(conn: &Connection, sql: &str) -> Result<BTreeMap<String, u64>, KeelError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
    })?;
    Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
}
