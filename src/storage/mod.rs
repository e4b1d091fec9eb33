//! `SQLite` storage layer for the workspace engine.
//!
//! This module provides the persistence layer using `SQLite` with:
//! - WAL mode for concurrent reads
//! - Transaction discipline for atomic writes
//! - Versioned migrations with a `user_version` marker
//! - Dirty tracking for sync export
//!
//! # Submodules
//!
//! - [`backend`] - Connection lifecycle, pragmas, transactions, savepoints
//! - [`schema`] - Versioned migration set, validation, reset
//! - [`events`] - Audit event storage (insertion, retrieval)

pub mod backend;
pub mod events;
pub mod schema;

pub use backend::{RunResult, SqliteBackend};
pub use events::{EventFilter, NewEvent};
pub use schema::{CURRENT_SCHEMA_VERSION, MigrationReport, SchemaValidation};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Parse RFC 3339 with a fallback for SQLite's `CURRENT_TIMESTAMP` format.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Utc.from_utc_datetime(&naive);
    }

    Utc::now()
}
