use crate::core::error;
use crate::core::schemas;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;

pub fn db_connect(db_path: &Path) -> Result<Connection, error::KeelError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::KeelError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::KeelError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::KeelError::RusqliteError)?;
    Ok(conn)
}

/// Create every index table if missing and stamp the schema version once.
pub fn ensure_index_schema(conn: &Connection) -> Result<(), error::KeelError> {
    for ddl in schemas::index_tables() {
        conn.execute(ddl, [])?;
    }
    for ddl in schemas::INDEX_DB_SCHEMA_INDEXES {
        conn.execute(ddl, [])?;
    }
    let current: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .optional()?
        .flatten();
    if current.is_none() {
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![schemas::INDEX_SCHEMA_VERSION, time::now_epoch_z()],
        )?;
    }
    Ok(())
}
