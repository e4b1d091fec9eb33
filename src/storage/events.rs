//! Audit event storage: append inside mutation transactions, filtered reads.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::fmt::Write as _;

use crate::error::Result;
use crate::model::{Event, EventType};
use crate::storage::parse_datetime;

/// An event about to be appended; the database assigns the id.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub element_id: String,
    pub event_type: EventType,
    pub actor: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl NewEvent {
    #[must_use]
    pub fn new(element_id: &str, event_type: EventType, actor: &str) -> Self {
        Self {
            element_id: element_id.to_string(),
            event_type,
            actor: actor.to_string(),
            old_value: None,
            new_value: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_values(
        mut self,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
    ) -> Self {
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }
}

/// Append one audit row. Callers run this inside the transaction of the
/// mutation it describes; a failure here aborts that mutation.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn append_event(conn: &Connection, event: &NewEvent) -> Result<i64> {
    conn.execute(
        "INSERT INTO events (element_id, event_type, actor, old_value, new_value, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            event.element_id,
            event.event_type.as_str(),
            event.actor,
            event.old_value.as_ref().map(serde_json::Value::to_string),
            event.new_value.as_ref().map(serde_json::Value::to_string),
            event.created_at.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Filters for [`query_events`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub element_id: Option<String>,
    pub actor: Option<String>,
    pub event_type: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Events for one element, newest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn events_for(conn: &Connection, element_id: &str, limit: usize) -> Result<Vec<Event>> {
    query_events(
        conn,
        &EventFilter {
            element_id: Some(element_id.to_string()),
            limit: Some(limit),
            ..EventFilter::default()
        },
    )
}

/// Query the audit stream, newest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn query_events(conn: &Connection, filter: &EventFilter) -> Result<Vec<Event>> {
    let mut sql = String::from(
        "SELECT id, element_id, event_type, actor, old_value, new_value, created_at
         FROM events WHERE 1=1",
    );
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref element_id) = filter.element_id {
        sql.push_str(" AND element_id = ?");
        params.push(Box::new(element_id.clone()));
    }
    if let Some(ref actor) = filter.actor {
        sql.push_str(" AND actor = ?");
        params.push(Box::new(actor.clone()));
    }
    if let Some(event_type) = filter.event_type {
        sql.push_str(" AND event_type = ?");
        params.push(Box::new(event_type.as_str().to_string()));
    }
    if let Some(since) = filter.since {
        sql.push_str(" AND created_at >= ?");
        params.push(Box::new(since.to_rfc3339()));
    }
    if let Some(until) = filter.until {
        sql.push_str(" AND created_at <= ?");
        params.push(Box::new(until.to_rfc3339()));
    }

    sql.push_str(" ORDER BY id DESC");
    if let Some(limit) = filter.limit {
        if limit > 0 {
            let _ = write!(sql, " LIMIT {limit}");
        }
    }

    let mut stmt = conn.prepare(&sql)?;
    let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
    let events = stmt
        .query_map(params_refs.as_slice(), |row| {
            Ok(Event {
                id: row.get(0)?,
                element_id: row.get(1)?,
                event_type: row
                    .get::<_, String>(2)?
                    .parse()
                    .unwrap_or(EventType::Updated),
                actor: row.get(3)?,
                old_value: row
                    .get::<_, Option<String>>(4)?
                    .and_then(|s| serde_json::from_str(&s).ok()),
                new_value: row
                    .get::<_, Option<String>>(5)?
                    .and_then(|s| serde_json::from_str(&s).ok()),
                created_at: parse_datetime(&row.get::<_, String>(6)?),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}
