//! Database schema definitions and migration logic.
//!
//! The schema is an ordered set of versioned migrations; the applied version
//! is tracked in `PRAGMA user_version` and bumped atomically with each
//! migration's DDL.

use rusqlite::Connection;

use crate::error::{Result, StoneforgeError};

pub const CURRENT_SCHEMA_VERSION: i32 = 4;

/// One schema step. `down` exists for the test-only reset path.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up: &'static str,
    pub down: Option<&'static str>,
}

/// Tables the full schema is expected to contain.
pub const EXPECTED_TABLES: &[&str] = &[
    "elements",
    "element_tags",
    "events",
    "dependencies",
    "blocked_cache",
    "dirty_elements",
    "child_counters",
    "config",
    "document_versions",
];

pub const MIGRATIONS: [Migration; 4] = [
    Migration {
        version: 1,
        description: "elements, tags, and the audit event log",
        up: r"
            CREATE TABLE elements (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL CHECK(kind IN (
                    'task','message','document','entity','plan',
                    'workflow','playbook','channel','library','team'
                )),
                -- Projections of the typed payload, for SQL filters and the
                -- blocked cache. NULL for kinds without the field.
                status TEXT,
                priority INTEGER CHECK(priority IS NULL OR (priority BETWEEN 1 AND 5)),
                complexity INTEGER CHECK(complexity IS NULL OR (complexity BETWEEN 1 AND 5)),
                assignee TEXT,
                payload TEXT NOT NULL DEFAULT '{}',
                content_hash TEXT,
                created_at TEXT NOT NULL,
                created_by TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            );

            CREATE INDEX idx_elements_kind ON elements(kind);
            CREATE INDEX idx_elements_status ON elements(status) WHERE status IS NOT NULL;
            CREATE INDEX idx_elements_assignee ON elements(assignee) WHERE assignee IS NOT NULL;
            CREATE INDEX idx_elements_created_at ON elements(created_at);
            CREATE INDEX idx_elements_updated_at ON elements(updated_at);
            CREATE INDEX idx_elements_content_hash ON elements(content_hash);
            CREATE INDEX idx_elements_deleted ON elements(deleted_at) WHERE deleted_at IS NOT NULL;

            CREATE TABLE element_tags (
                element_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (element_id, tag),
                FOREIGN KEY (element_id) REFERENCES elements(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_element_tags_tag ON element_tags(tag);
            CREATE INDEX idx_element_tags_element ON element_tags(element_id);

            CREATE TABLE events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                element_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                actor TEXT NOT NULL DEFAULT '',
                old_value TEXT,
                new_value TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (element_id) REFERENCES elements(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_events_element ON events(element_id);
            CREATE INDEX idx_events_type ON events(event_type);
            CREATE INDEX idx_events_created_at ON events(created_at);
            CREATE INDEX idx_events_actor ON events(actor) WHERE actor != '';
        ",
        down: Some(
            r"
            DROP TABLE IF EXISTS events;
            DROP TABLE IF EXISTS element_tags;
            DROP TABLE IF EXISTS elements;
        ",
        ),
    },
    Migration {
        version: 2,
        description: "typed dependency edges",
        up: r"
            CREATE TABLE dependencies (
                blocked_id TEXT NOT NULL,
                blocker_id TEXT NOT NULL,
                dep_type TEXT NOT NULL DEFAULT 'blocks',
                created_at TEXT NOT NULL,
                created_by TEXT NOT NULL DEFAULT '',
                metadata TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (blocked_id, blocker_id, dep_type),
                FOREIGN KEY (blocked_id) REFERENCES elements(id) ON DELETE CASCADE
                -- Note: blocker_id FK intentionally omitted to allow external references
            );
            CREATE INDEX idx_dependencies_blocked ON dependencies(blocked_id);
            CREATE INDEX idx_dependencies_blocker ON dependencies(blocker_id);
            CREATE INDEX idx_dependencies_type ON dependencies(dep_type);
            CREATE INDEX idx_dependencies_blocker_type ON dependencies(blocker_id, dep_type);
            -- Composite for blocking lookups
            CREATE INDEX idx_dependencies_blocking
                ON dependencies(blocker_id, blocked_id)
                WHERE dep_type IN ('blocks', 'parent-child', 'awaits');
        ",
        down: Some("DROP TABLE IF EXISTS dependencies;"),
    },
    Migration {
        version: 3,
        description: "blocked cache, dirty tracking, child counters, config",
        up: r"
            -- Derived materialization; rebuildable from the graph at any time.
            CREATE TABLE blocked_cache (
                element_id TEXT PRIMARY KEY,
                blocked_by TEXT NOT NULL,
                reason TEXT NOT NULL,
                previous_status TEXT,
                blocked_at TEXT NOT NULL,
                FOREIGN KEY (element_id) REFERENCES elements(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_blocked_cache_blocker ON blocked_cache(blocked_by);

            CREATE TABLE dirty_elements (
                element_id TEXT PRIMARY KEY,
                marked_at TEXT NOT NULL,
                FOREIGN KEY (element_id) REFERENCES elements(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_dirty_elements_marked_at ON dirty_elements(marked_at);

            -- Hierarchical child numbering (el-abc.1, el-abc.2, ...)
            CREATE TABLE child_counters (
                parent_id TEXT PRIMARY KEY,
                last_child INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (parent_id) REFERENCES elements(id) ON DELETE CASCADE
            );

            CREATE TABLE config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        ",
        down: Some(
            r"
            DROP TABLE IF EXISTS config;
            DROP TABLE IF EXISTS child_counters;
            DROP TABLE IF EXISTS dirty_elements;
            DROP TABLE IF EXISTS blocked_cache;
        ",
        ),
    },
    Migration {
        version: 4,
        description: "document version history",
        up: r"
            CREATE TABLE document_versions (
                document_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (document_id, version),
                FOREIGN KEY (document_id) REFERENCES elements(id) ON DELETE CASCADE
            );
        ",
        down: Some("DROP TABLE IF EXISTS document_versions;"),
    },
];

/// Result of an [`apply_migrations`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: i32,
    pub to_version: i32,
    pub applied: Vec<i32>,
    pub success: bool,
}

/// Result of a [`validate_schema`] pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaValidation {
    pub missing: Vec<String>,
    pub extra: Vec<String>,
}

impl SchemaValidation {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

/// Read the applied schema version (0 on a fresh database).
///
/// # Errors
///
/// Returns an error if the pragma query fails.
pub fn schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Check the migration set invariants: versions positive, strictly
/// ascending from 1, non-empty `up`, latest equals the declared current.
///
/// # Errors
///
/// Returns an integrity error describing the first violation.
pub fn validate_migration_set() -> Result<()> {
    let mut expected = 1;
    for migration in &MIGRATIONS {
        if migration.version != expected {
            return Err(StoneforgeError::Integrity {
                message: format!(
                    "migration versions must ascend from 1: found {} where {expected} was expected",
                    migration.version
                ),
            });
        }
        if migration.up.trim().is_empty() {
            return Err(StoneforgeError::Integrity {
                message: format!("migration {} has an empty up script", migration.version),
            });
        }
        expected += 1;
    }
    let latest = MIGRATIONS.last().map_or(0, |m| m.version);
    if latest != CURRENT_SCHEMA_VERSION {
        return Err(StoneforgeError::Integrity {
            message: format!(
                "latest migration is {latest} but CURRENT_SCHEMA_VERSION is {CURRENT_SCHEMA_VERSION}"
            ),
        });
    }
    Ok(())
}

/// Apply every pending migration. Each `up` runs in its own transaction
/// together with the version bump; re-running is idempotent.
///
/// # Errors
///
/// Returns an error if a migration fails; already-applied migrations stay
/// committed.
pub fn apply_migrations(conn: &mut Connection) -> Result<MigrationReport> {
    validate_migration_set()?;

    let from_version = schema_version(conn)?;
    let mut applied = Vec::new();

    for migration in &MIGRATIONS {
        if migration.version <= from_version {
            continue;
        }
        tracing::debug!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        let tx = conn.transaction()?;
        tx.execute_batch(migration.up)
            .map_err(|e| StoneforgeError::with_statement(e, migration.up))?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;
        applied.push(migration.version);
    }

    let to_version = schema_version(conn)?;
    Ok(MigrationReport {
        from_version,
        to_version,
        applied,
        success: true,
    })
}

/// Test-only: run every `down` in reverse order and zero the version marker.
///
/// # Errors
///
/// Returns an error if a down script fails.
pub fn reset_schema(conn: &mut Connection) -> Result<()> {
    for migration in MIGRATIONS.iter().rev() {
        if let Some(down) = migration.down {
            let tx = conn.transaction()?;
            tx.execute_batch(down)
                .map_err(|e| StoneforgeError::with_statement(e, down))?;
            tx.pragma_update(None, "user_version", migration.version - 1)?;
            tx.commit()?;
        }
    }
    conn.pragma_update(None, "user_version", 0)?;
    Ok(())
}

/// Compare existing tables against [`EXPECTED_TABLES`].
///
/// # Errors
///
/// Returns an error if the catalog query fails.
pub fn validate_schema(conn: &Connection) -> Result<SchemaValidation> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let missing = EXPECTED_TABLES
        .iter()
        .filter(|t| !existing.iter().any(|e| e == *t))
        .map(|t| (*t).to_string())
        .collect();
    let extra = existing
        .into_iter()
        .filter(|e| !EXPECTED_TABLES.contains(&e.as_str()))
        .collect();

    Ok(SchemaValidation { missing, extra })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn fresh() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn migration_set_is_well_formed() {
        validate_migration_set().unwrap();
    }

    #[test]
    fn apply_from_scratch_reports_all_versions() {
        let mut conn = fresh();
        let report = apply_migrations(&mut conn).unwrap();
        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(report.applied, vec![1, 2, 3, 4]);
        assert!(report.success);

        let validation = validate_schema(&conn).unwrap();
        assert!(validation.is_valid(), "{validation:?}");
    }

    #[test]
    fn reapply_is_idempotent() {
        let mut conn = fresh();
        apply_migrations(&mut conn).unwrap();
        let report = apply_migrations(&mut conn).unwrap();
        assert_eq!(report.from_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(report.to_version, CURRENT_SCHEMA_VERSION);
        assert!(report.applied.is_empty());
    }

    #[test]
    fn partial_upgrade_applies_only_pending() {
        let mut conn = fresh();
        // Apply just migration 1 by hand.
        let first = &MIGRATIONS[0];
        conn.execute_batch(first.up).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        let report = apply_migrations(&mut conn).unwrap();
        assert_eq!(report.from_version, 1);
        assert_eq!(report.applied, vec![2, 3, 4]);
    }

    #[test]
    fn reset_drops_everything() {
        let mut conn = fresh();
        apply_migrations(&mut conn).unwrap();
        reset_schema(&mut conn).unwrap();

        assert_eq!(schema_version(&conn).unwrap(), 0);
        let validation = validate_schema(&conn).unwrap();
        assert_eq!(validation.missing.len(), EXPECTED_TABLES.len());
    }

    #[test]
    fn validation_reports_extra_tables() {
        let mut conn = fresh();
        apply_migrations(&mut conn).unwrap();
        conn.execute_batch("CREATE TABLE stray (x INTEGER)").unwrap();

        let validation = validate_schema(&conn).unwrap();
        assert_eq!(validation.extra, vec!["stray".to_string()]);
        assert!(!validation.is_valid());
    }

    #[test]
    fn kind_check_constraint_enforced() {
        let mut conn = fresh();
        apply_migrations(&mut conn).unwrap();
        let result = conn.execute(
            "INSERT INTO elements (id, kind, payload, created_at, updated_at)
             VALUES ('el-bad', 'gadget', '{}', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err(), "unknown kind should violate CHECK");
    }
}
