//! Index database schema.
//!
//! One `context.db` per project. Every table is derived from the JSON
//! sources and can be dropped and rebuilt by `Index::reindex`. Run rows carry
//! metadata only; raw executor output stays in the run-record files.

pub const INDEX_SCHEMA_VERSION: i64 = 1;

pub const INDEX_DB_SCHEMA_VERSION: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL,
        applied_at TEXT NOT NULL
    )
";

pub const INDEX_DB_SCHEMA_DOCUMENTS: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        version_hash TEXT PRIMARY KEY,
        project TEXT NOT NULL,
        generated_at TEXT NOT NULL,
        total_actions INTEGER NOT NULL,
        tech_stack TEXT NOT NULL,
        status TEXT NOT NULL
    )
";

pub const INDEX_DB_SCHEMA_COMMITS: &str = "
    CREATE TABLE IF NOT EXISTS commits (
        commit_id TEXT PRIMARY KEY,
        project TEXT NOT NULL,
        summary TEXT NOT NULL,
        files_changed INTEGER NOT NULL,
        timestamp INTEGER NOT NULL
    )
";

pub const INDEX_DB_SCHEMA_RUNS: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        project TEXT NOT NULL,
        intent TEXT NOT NULL,
        script_path TEXT,
        status TEXT NOT NULL,
        returncode INTEGER,
        duration_ms INTEGER NOT NULL,
        summary TEXT,
        error_keywords TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )
";

pub const INDEX_DB_SCHEMA_ACTIONS: &str = "
    CREATE TABLE IF NOT EXISTS actions (
        seq INTEGER PRIMARY KEY,
        project TEXT NOT NULL,
        ts INTEGER NOT NULL,
        action_type TEXT NOT NULL,
        description TEXT NOT NULL,
        status TEXT NOT NULL
    )
";

pub const INDEX_DB_SCHEMA_SYNC_METADATA: &str = "
    CREATE TABLE IF NOT EXISTS sync_metadata (
        source TEXT PRIMARY KEY,
        last_trim_offset INTEGER NOT NULL DEFAULT 0,
        synced_length INTEGER NOT NULL DEFAULT 0,
        last_synced_at TEXT,
        last_trimmed_at TEXT,
        sync_status TEXT NOT NULL DEFAULT 'synced'
            CHECK (sync_status IN ('synced', 'pending'))
    )
";

pub const INDEX_DB_SCHEMA_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_actions_type ON actions(action_type)",
    "CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)",
    "CREATE INDEX IF NOT EXISTS idx_runs_ts ON runs(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_commits_ts ON commits(timestamp)",
];

pub fn index_tables() -> [&'static str; 6] {
    [
        INDEX_DB_SCHEMA_VERSION,
        INDEX_DB_SCHEMA_DOCUMENTS,
        INDEX_DB_SCHEMA_COMMITS,
        INDEX_DB_SCHEMA_RUNS,
        INDEX_DB_SCHEMA_ACTIONS,
        INDEX_DB_SCHEMA_SYNC_METADATA,
    ]
}
