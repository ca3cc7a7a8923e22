//! Database schema and connection pragmas.

use rusqlite::Connection;

use crate::error::StorageResult;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Executes a single statement that may return rows (PRAGMAs).
fn exec_stmt(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    conn.prepare(sql)?.query([])?.next()?;
    Ok(())
}

/// Per-connection settings, applied by the pool on every new connection.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    // WAL lets the query thread read while the engine thread writes
    exec_stmt(conn, "PRAGMA journal_mode = WAL")?;
    exec_stmt(conn, "PRAGMA synchronous = NORMAL")?;
    exec_stmt(conn, "PRAGMA busy_timeout = 5000")?;
    exec_stmt(conn, "PRAGMA foreign_keys = ON")?;
    exec_stmt(conn, "PRAGMA temp_store = MEMORY")?;
    Ok(())
}

/// Creates every table and index if missing.
pub fn init_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL UNIQUE,
            mtime INTEGER NOT NULL DEFAULT 0,
            indexed_at TEXT
        );

        -- One compile command per translation unit
        CREATE TABLE IF NOT EXISTS commands (
            file_id INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
            directory TEXT NOT NULL,
            arguments TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS includes (
            source_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            included_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            PRIMARY KEY (source_id, included_id)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS defs (
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            usr TEXT NOT NULL,
            spelling TEXT NOT NULL,
            kind TEXT NOT NULL,
            offset1 INTEGER NOT NULL,
            offset2 INTEGER NOT NULL,
            line INTEGER NOT NULL,
            col INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_defs_usr ON defs(usr);
        CREATE INDEX IF NOT EXISTS idx_defs_spelling ON defs(spelling);
        CREATE INDEX IF NOT EXISTS idx_defs_file ON defs(file_id);

        CREATE TABLE IF NOT EXISTS refs (
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            usr TEXT NOT NULL,
            spelling TEXT NOT NULL,
            kind TEXT NOT NULL,
            offset1 INTEGER NOT NULL,
            offset2 INTEGER NOT NULL,
            line INTEGER NOT NULL,
            col INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_refs_usr ON refs(usr);
        CREATE INDEX IF NOT EXISTS idx_refs_position ON refs(file_id, offset1);

        -- Persisted configuration, values are JSON text
        CREATE TABLE IF NOT EXISTS options (
            name TEXT PRIMARY KEY,
            value TEXT NOT NULL
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        ) WITHOUT ROWID;
        "#,
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creation() {
        let conn = Connection::open_in_memory().unwrap();
        apply_pragmas(&conn).unwrap();
        init_schema(&conn).unwrap();
        // Idempotent
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(Result::ok)
            .collect();

        for table in ["files", "commands", "includes", "defs", "refs", "options"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }
}
