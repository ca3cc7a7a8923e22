//! Index storage — SQLite behind an r2d2 connection pool.
//!
//! Holds the compilation database, the per-file definition / reference
//! tables produced by the indexer, include edges, and persisted options.
//! The pool makes the store shareable between the query thread, the
//! update engine and the watcher.

mod schema;
mod types;

pub use schema::{apply_pragmas, init_schema, SCHEMA_VERSION};
pub use types::{Candidate, CompileCommand, FileIndex, FileRecord, Location, Span, SymbolRow};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Source of the files the watcher should track.
pub trait WatchSource: Send + Sync {
    fn list_watched_files(&self) -> StorageResult<Vec<PathBuf>>;
}

/// Options understood by `config`, with their defaults.
pub const OPTION_NAMES: &[&str] = &["index.exclude", "complete.limit"];

fn option_default(name: &str) -> Option<Value> {
    match name {
        "index.exclude" => Some(json!(["/usr/.*"])),
        "complete.limit" => Some(json!(50)),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Aggregate sizes, for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct IndexCounts {
    pub files: usize,
    pub commands: usize,
    pub definitions: usize,
    pub references: usize,
}

/// Pooled SQLite store. Send + Sync.
pub struct Storage {
    pool: Pool<SqliteConnectionManager>,
}

impl Storage {
    /// Opens or creates the database at `path`.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|c| apply_pragmas(c));
        let pool = Pool::builder().max_size(4).min_idle(Some(1)).build(manager)?;
        {
            let conn = pool.get()?;
            init_schema(&conn)?;
        }
        debug!(path = %path.display(), "storage opened");
        Ok(Self { pool })
    }

    /// In-memory database. A single pooled connection so every caller sees the same data.
    pub fn in_memory() -> StorageResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|c| apply_pragmas(c));
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let conn = pool.get()?;
            init_schema(&conn)?;
        }
        Ok(Self { pool })
    }

    pub fn conn(&self) -> StorageResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(StorageError::from)
    }

    // ─── Compilation database ─────────────────────────────────────

    /// Registers (or replaces) the compile command of a translation unit.
    pub fn set_compile_command(&self, cmd: &CompileCommand) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let file_id = ensure_file(&tx, &cmd.file)?;
        let arguments = serde_json::to_string(&cmd.arguments).map_err(|e| {
            StorageError::Corrupt {
                name: path_key(&cmd.file),
                reason: e.to_string(),
            }
        })?;
        tx.execute(
            r"
            INSERT INTO commands (file_id, directory, arguments)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(file_id) DO UPDATE SET
                directory = excluded.directory,
                arguments = excluded.arguments
            ",
            params![file_id, path_key(&cmd.directory), arguments],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn compile_commands(&self) -> StorageResult<Vec<CompileCommand>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            r"
            SELECT f.path, c.directory, c.arguments
            FROM commands c JOIN files f ON f.id = c.file_id
            ORDER BY f.path
            ",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(file, directory, args)| command_from_parts(file, directory, &args))
            .collect()
    }

    // ─── Files ────────────────────────────────────────────────────

    pub fn files(&self) -> StorageResult<Vec<FileRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT id, path, mtime, indexed_at FROM files ORDER BY path")?;
        let files = stmt
            .query_map([], file_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    pub fn file(&self, path: &Path) -> StorageResult<Option<FileRecord>> {
        let conn = self.conn()?;
        let file = conn
            .query_row(
                "SELECT id, path, mtime, indexed_at FROM files WHERE path = ?1",
                params![path_key(path)],
                file_from_row,
            )
            .optional()?;
        Ok(file)
    }

    /// Forgets a file and everything indexed from it.
    pub fn remove_file(&self, path: &Path) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM files WHERE path = ?1",
                params![path_key(path)],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = id {
            tx.execute("DELETE FROM defs WHERE file_id = ?1", params![id])?;
            tx.execute("DELETE FROM refs WHERE file_id = ?1", params![id])?;
            tx.execute(
                "DELETE FROM includes WHERE source_id = ?1 OR included_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM commands WHERE file_id = ?1", params![id])?;
            tx.execute("DELETE FROM files WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Atomically replaces the indexed content of `path`.
    ///
    /// Included files that are not yet known are added with `mtime = 0`
    /// so the next rebuild indexes them.
    pub fn store_file_index(&self, path: &Path, mtime: i64, index: &FileIndex) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let file_id = ensure_file(&tx, path)?;

        tx.execute(
            "UPDATE files SET mtime = ?1, indexed_at = ?2 WHERE id = ?3",
            params![mtime, chrono::Utc::now().to_rfc3339(), file_id],
        )?;
        tx.execute("DELETE FROM defs WHERE file_id = ?1", params![file_id])?;
        tx.execute("DELETE FROM refs WHERE file_id = ?1", params![file_id])?;
        tx.execute("DELETE FROM includes WHERE source_id = ?1", params![file_id])?;

        {
            let mut insert_def = tx.prepare_cached(
                r"
                INSERT INTO defs (file_id, usr, spelling, kind, offset1, offset2, line, col)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
            )?;
            for def in &index.definitions {
                insert_def.execute(params![
                    file_id,
                    def.usr,
                    def.spelling,
                    def.kind,
                    def.span.offset1 as i64,
                    def.span.offset2 as i64,
                    def.span.line as i64,
                    def.span.col as i64,
                ])?;
            }

            let mut insert_ref = tx.prepare_cached(
                r"
                INSERT INTO refs (file_id, usr, spelling, kind, offset1, offset2, line, col)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
            )?;
            for r in &index.references {
                insert_ref.execute(params![
                    file_id,
                    r.usr,
                    r.spelling,
                    r.kind,
                    r.span.offset1 as i64,
                    r.span.offset2 as i64,
                    r.span.line as i64,
                    r.span.col as i64,
                ])?;
            }
        }

        for included in &index.includes {
            let included_id = ensure_file(&tx, included)?;
            tx.execute(
                "INSERT OR IGNORE INTO includes (source_id, included_id) VALUES (?1, ?2)",
                params![file_id, included_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Every definition as `(spelling, usr, file)`, for name-based reference resolution.
    pub fn definition_names(&self) -> StorageResult<Vec<(String, String, PathBuf)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT d.spelling, d.usr, f.path FROM defs d JOIN files f ON f.id = d.file_id",
        )?;
        let names = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    PathBuf::from(row.get::<_, String>(2)?),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    // ─── Queries ──────────────────────────────────────────────────

    /// References in `file` whose range covers `offset`, innermost first.
    pub fn references_at(&self, file: &Path, offset: usize) -> StorageResult<Vec<Location>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            r"
            SELECT f.path, r.usr, r.spelling, r.kind, r.offset1, r.offset2, r.line, r.col
            FROM refs r JOIN files f ON f.id = r.file_id
            WHERE f.path = ?1 AND r.offset1 <= ?2 AND ?2 < r.offset2
            ORDER BY (r.offset2 - r.offset1), r.offset1
            ",
        )?;
        let refs = stmt
            .query_map(params![path_key(file), offset as i64], location_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(refs)
    }

    pub fn definitions_of(&self, usr: &str) -> StorageResult<Vec<Location>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            r"
            SELECT f.path, d.usr, d.spelling, d.kind, d.offset1, d.offset2, d.line, d.col
            FROM defs d JOIN files f ON f.id = d.file_id
            WHERE d.usr = ?1
            ORDER BY f.path, d.offset1
            ",
        )?;
        let defs = stmt
            .query_map(params![usr], location_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(defs)
    }

    pub fn references_to(&self, usr: &str) -> StorageResult<Vec<Location>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            r"
            SELECT f.path, r.usr, r.spelling, r.kind, r.offset1, r.offset2, r.line, r.col
            FROM refs r JOIN files f ON f.id = r.file_id
            WHERE r.usr = ?1
            ORDER BY f.path, r.offset1
            ",
        )?;
        let refs = stmt
            .query_map(params![usr], location_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(refs)
    }

    /// Definitions whose spelling starts with `prefix`.
    pub fn complete(&self, prefix: &str, limit: usize) -> StorageResult<Vec<Candidate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            r"
            SELECT spelling, kind, usr
            FROM defs
            WHERE substr(spelling, 1, length(?1)) = ?1
            GROUP BY usr
            ORDER BY spelling, usr
            LIMIT ?2
            ",
        )?;
        let candidates = stmt
            .query_map(params![prefix, limit as i64], |row| {
                Ok(Candidate {
                    spelling: row.get(0)?,
                    kind: row.get(1)?,
                    usr: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(candidates)
    }

    pub fn counts(&self) -> StorageResult<IndexCounts> {
        let conn = self.conn()?;
        let count = |sql: &str| -> StorageResult<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };
        Ok(IndexCounts {
            files: count("SELECT COUNT(*) FROM files")?,
            commands: count("SELECT COUNT(*) FROM commands")?,
            definitions: count("SELECT COUNT(*) FROM defs")?,
            references: count("SELECT COUNT(*) FROM refs")?,
        })
    }

    // ─── Options ──────────────────────────────────────────────────

    /// Stored value of a known option, or its default.
    pub fn option(&self, name: &str) -> StorageResult<Value> {
        let default =
            option_default(name).ok_or_else(|| StorageError::UnknownOption(name.to_string()))?;
        let conn = self.conn()?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM options WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            Some(text) => serde_json::from_str(&text).map_err(|e| StorageError::Corrupt {
                name: name.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    /// Persists a known option; the value must have the same JSON type as its default.
    pub fn set_option(&self, name: &str, value: &Value) -> StorageResult<()> {
        let default =
            option_default(name).ok_or_else(|| StorageError::UnknownOption(name.to_string()))?;
        let expected = json_kind(&default);
        if json_kind(value) != expected {
            return Err(StorageError::InvalidOptionValue {
                name: name.to_string(),
                expected,
            });
        }
        if let Value::Array(items) = value {
            if !items.iter().all(Value::is_string) {
                return Err(StorageError::InvalidOptionValue {
                    name: name.to_string(),
                    expected: "array of strings",
                });
            }
        }

        let conn = self.conn()?;
        conn.execute(
            r"
            INSERT INTO options (name, value) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value
            ",
            params![name, value.to_string()],
        )?;
        Ok(())
    }

    /// `index.exclude` as a list of pattern strings.
    pub fn exclude_patterns(&self) -> StorageResult<Vec<String>> {
        let value = self.option("index.exclude")?;
        Ok(value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl WatchSource for Storage {
    fn list_watched_files(&self) -> StorageResult<Vec<PathBuf>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT path FROM files ORDER BY path")?;
        let paths = stmt
            .query_map([], |row| Ok(PathBuf::from(row.get::<_, String>(0)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(paths)
    }
}

fn ensure_file(conn: &Connection, path: &Path) -> rusqlite::Result<i64> {
    let key = path_key(path);
    conn.execute(
        "INSERT OR IGNORE INTO files (path) VALUES (?1)",
        params![key],
    )?;
    conn.query_row("SELECT id FROM files WHERE path = ?1", params![key], |row| {
        row.get(0)
    })
}

fn command_from_parts(file: String, directory: String, args: &str) -> StorageResult<CompileCommand> {
    let arguments: Vec<String> = serde_json::from_str(args).map_err(|e| StorageError::Corrupt {
        name: file.clone(),
        reason: e.to_string(),
    })?;
    Ok(CompileCommand {
        file: PathBuf::from(file),
        directory: PathBuf::from(directory),
        arguments,
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        path: PathBuf::from(row.get::<_, String>(1)?),
        mtime: row.get(2)?,
        indexed_at: row.get(3)?,
    })
}

fn location_from_row(row: &Row<'_>) -> rusqlite::Result<Location> {
    Ok(Location {
        file: PathBuf::from(row.get::<_, String>(0)?),
        usr: row.get(1)?,
        spelling: row.get(2)?,
        kind: row.get(3)?,
        span: Span {
            offset1: row.get::<_, i64>(4)? as usize,
            offset2: row.get::<_, i64>(5)? as usize,
            line: row.get::<_, i64>(6)? as usize,
            col: row.get::<_, i64>(7)? as usize,
        },
    })
}
