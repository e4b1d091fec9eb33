//! Low-level `SQLite` backend: connection lifecycle, pragmas, transactions,
//! savepoints, the schema-version marker, dirty tracking, and child counters.
//!
//! Everything above this module speaks in terms of [`SqliteBackend`] or a
//! `rusqlite::Transaction` borrowed from it; nothing else touches the
//! connection directly.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};

use crate::error::{Result, StoneforgeError};
use crate::storage::schema::{apply_migrations, schema_version};

/// Result of a mutating statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    pub changes: usize,
    pub last_insert_rowid: i64,
}

/// SQLite-backed storage with WAL journaling.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Option<Connection>,
}

impl SqliteBackend {
    /// Open (or create) the database at `path` and bring the schema current.
    /// The special path `:memory:` opens an ephemeral store.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection, pragmas, or migrations fail.
    pub fn open(path: &Path) -> Result<Self> {
        if path.as_os_str() == ":memory:" {
            return Self::open_memory();
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (tests, ephemeral workspaces).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    /// Open read-only, without migrating. Fails on a missing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be opened.
    pub fn open_readonly(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self { conn: Some(conn) })
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        apply_pragmas(&conn)?;
        apply_migrations(&mut conn)?;
        Ok(Self { conn: Some(conn) })
    }

    /// Whether the backend still holds a live connection.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Close the connection. Further calls return `BackendClosed`.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite fails to close cleanly.
    pub fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| StoneforgeError::from(e))?;
        }
        Ok(())
    }

    /// Borrow the live connection.
    ///
    /// # Errors
    ///
    /// Returns `BackendClosed` after [`Self::close`].
    pub fn conn(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(StoneforgeError::BackendClosed)
    }

    /// Mutable borrow, needed to start transactions.
    ///
    /// # Errors
    ///
    /// Returns `BackendClosed` after [`Self::close`].
    pub fn conn_mut(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or(StoneforgeError::BackendClosed)
    }

    /// Execute one or more statements without parameters.
    ///
    /// # Errors
    ///
    /// Returns a storage error carrying the failing SQL.
    pub fn exec(&self, sql: &str) -> Result<()> {
        self.conn()?
            .execute_batch(sql)
            .map_err(|e| StoneforgeError::with_statement(e, sql))
    }

    /// Run a single parameterized statement.
    ///
    /// # Errors
    ///
    /// Returns a storage error carrying the failing SQL.
    pub fn run<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<RunResult> {
        let conn = self.conn()?;
        let changes = conn
            .execute(sql, params)
            .map_err(|e| StoneforgeError::with_statement(e, sql))?;
        Ok(RunResult {
            changes,
            last_insert_rowid: conn.last_insert_rowid(),
        })
    }

    /// Run a query and map every row.
    ///
    /// # Errors
    ///
    /// Returns a storage error carrying the failing SQL.
    pub fn query_rows<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| StoneforgeError::with_statement(e, sql))?;
        let rows = stmt
            .query_map(params, f)
            .map_err(|e| StoneforgeError::with_statement(e, sql))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StoneforgeError::with_statement(e, sql))?;
        Ok(rows)
    }

    /// Run a query expected to yield at most one row.
    ///
    /// # Errors
    ///
    /// Returns a storage error carrying the failing SQL.
    pub fn query_row_opt<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        use rusqlite::OptionalExtension;
        self.conn()?
            .query_row(sql, params, f)
            .optional()
            .map_err(|e| StoneforgeError::with_statement(e, sql))
    }

    /// Begin a transaction with the given behavior. Writers use
    /// [`TransactionBehavior::Immediate`] so lock acquisition fails fast
    /// instead of at commit.
    ///
    /// # Errors
    ///
    /// Returns `BackendClosed` or the underlying SQLite error.
    pub fn transaction(&mut self, behavior: TransactionBehavior) -> Result<Transaction<'_>> {
        let tx = self.conn_mut()?.transaction_with_behavior(behavior)?;
        Ok(tx)
    }

    /// Currently applied schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the pragma query fails.
    pub fn schema_version(&self) -> Result<i32> {
        schema_version(self.conn()?)
    }

    /// Overwrite the schema-version marker (migration machinery only).
    ///
    /// # Errors
    ///
    /// Returns an error if the pragma update fails.
    pub fn set_schema_version(&self, version: i32) -> Result<()> {
        self.conn()?.pragma_update(None, "user_version", version)?;
        Ok(())
    }

    /// Total element rows, including soft-deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count_elements(&self) -> Result<u64> {
        let count: i64 =
            self.conn()?
                .query_row("SELECT count(*) FROM elements", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Whether any element row (live or soft-deleted) has this id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn element_exists(&self, id: &str) -> Result<bool> {
        let mut stmt = self.conn()?.prepare("SELECT 1 FROM elements WHERE id = ?")?;
        Ok(stmt.exists([id])?)
    }

    /// Ids currently marked dirty for sync export.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn dirty_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()?
            .prepare("SELECT element_id FROM dirty_elements ORDER BY marked_at")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Clear dirty marks for the given ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn clear_dirty(&self, ids: &[String]) -> Result<usize> {
        let conn = self.conn()?;
        let mut cleared = 0;
        for id in ids {
            cleared += conn.execute("DELETE FROM dirty_elements WHERE element_id = ?", [id])?;
        }
        Ok(cleared)
    }

    /// Atomically increment and return the child counter for a parent.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails (e.g. unknown parent).
    pub fn next_child_number(&self, parent_id: &str) -> Result<i64> {
        next_child_number(self.conn()?, parent_id)
    }

    /// Fetch a config value.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;
        let value = self
            .conn()?
            .query_row("SELECT value FROM config WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Set a config value.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO config (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    /// Fetch all config values.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_all_config(&self) -> Result<HashMap<String, String>> {
        let mut stmt = self.conn()?.prepare("SELECT key, value FROM config")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut map = HashMap::new();
        for row in rows {
            let (key, value) = row?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    // WAL for concurrent readers alongside the single writer.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    // NORMAL synchronous is safe with WAL: committed data survives OS crash.
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5_000)?;
    // Negative cache_size is KiB: ~2 MiB page cache.
    conn.pragma_update(None, "cache_size", -2_048)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

/// Atomic upsert-increment of the per-parent child counter.
///
/// # Errors
///
/// Returns an error if the upsert fails.
pub fn next_child_number(conn: &Connection, parent_id: &str) -> Result<i64> {
    let next: i64 = conn.query_row(
        "INSERT INTO child_counters (parent_id, last_child) VALUES (?, 1)
         ON CONFLICT(parent_id) DO UPDATE SET last_child = last_child + 1
         RETURNING last_child",
        [parent_id],
        |row| row.get(0),
    )?;
    Ok(next)
}

/// Mark elements dirty for sync export, inside the caller's transaction.
///
/// # Errors
///
/// Returns an error if the upsert fails.
pub fn mark_dirty(conn: &Connection, ids: &[String]) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    for id in ids {
        conn.execute(
            "INSERT OR REPLACE INTO dirty_elements (element_id, marked_at) VALUES (?, ?)",
            rusqlite::params![id, now],
        )?;
    }
    Ok(())
}

fn validate_savepoint_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StoneforgeError::validation(format!(
            "invalid savepoint name: {name:?}"
        )));
    }
    Ok(())
}

/// Open a named savepoint inside `tx`.
///
/// # Errors
///
/// Returns a validation error for a bad name, or the SQLite error.
pub fn savepoint(tx: &Transaction<'_>, name: &str) -> Result<()> {
    validate_savepoint_name(name)?;
    tx.execute_batch(&format!("SAVEPOINT {name}"))?;
    Ok(())
}

/// Release (commit) a named savepoint.
///
/// # Errors
///
/// Returns a validation error for a bad name, or the SQLite error.
pub fn release(tx: &Transaction<'_>, name: &str) -> Result<()> {
    validate_savepoint_name(name)?;
    tx.execute_batch(&format!("RELEASE SAVEPOINT {name}"))?;
    Ok(())
}

/// Roll back to a named savepoint, keeping it open.
///
/// # Errors
///
/// Returns a validation error for a bad name, or the SQLite error.
pub fn rollback_to(tx: &Transaction<'_>, name: &str) -> Result<()> {
    validate_savepoint_name(name)?;
    tx.execute_batch(&format!("ROLLBACK TO SAVEPOINT {name}"))?;
    Ok(())
}
