//! Element CRUD, tags, status transitions, and document versioning.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;

use crate::engine::{CacheTouch, Workspace};
use crate::error::{Result, StoneforgeError};
use crate::hash::compute_content_hash;
use crate::id::mint_id;
use crate::model::{
    Complexity, Element, ElementKind, EventType, Payload, PlanStatus, Priority, TaskStatus,
};
use crate::storage::parse_datetime;

/// Filter options for listing elements.
#[derive(Debug, Clone, Default)]
pub struct ElementFilter {
    pub kinds: Option<Vec<ElementKind>>,
    pub statuses: Option<Vec<String>>,
    pub created_by: Option<String>,
    pub assignee: Option<String>,
    /// Any-of match against the tag relation.
    pub tags: Option<Vec<String>>,
    /// Only elements updated at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

const SELECT_COLUMNS: &str = "id, kind, payload, content_hash, created_at, created_by, \
                              updated_at, deleted_at";

pub(crate) fn element_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawElement> {
    Ok(RawElement {
        id: row.get(0)?,
        kind: row.get(1)?,
        payload: row.get(2)?,
        content_hash: row.get(3)?,
        created_at: row.get(4)?,
        created_by: row.get(5)?,
        updated_at: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

/// Row image before payload parsing.
pub(crate) struct RawElement {
    id: String,
    kind: String,
    payload: String,
    content_hash: Option<String>,
    created_at: String,
    created_by: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl RawElement {
    fn into_element(self) -> Result<Element> {
        let kind: ElementKind = self.kind.parse()?;
        Ok(Element {
            payload: Payload::from_json(kind, &self.payload)?,
            id: self.id,
            kind,
            content_hash: self.content_hash,
            created_at: parse_datetime(&self.created_at),
            created_by: self.created_by,
            updated_at: parse_datetime(&self.updated_at),
            deleted_at: self.deleted_at.as_deref().map(parse_datetime),
            tags: Vec::new(),
        })
    }
}

/// Load one element by id, soft-deleted rows included.
///
/// # Errors
///
/// Returns an error if the query or payload parse fails.
pub(crate) fn load_element(conn: &Connection, id: &str) -> Result<Option<Element>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM elements WHERE id = ?");
    let mut stmt = conn.prepare(&sql)?;
    let raw = match stmt.query_row([id], element_from_row) {
        Ok(raw) => raw,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    raw.into_element().map(Some)
}

/// Projected columns derived from the typed payload.
fn projections(payload: &Payload) -> (Option<&'static str>, Option<i32>, Option<i32>, Option<String>) {
    match payload {
        Payload::Task(t) => (
            Some(t.status.as_str()),
            Some(t.priority.0),
            Some(t.complexity.0),
            t.assignee.clone(),
        ),
        Payload::Plan(p) => (Some(p.status.as_str()), None, None, None),
        _ => (None, None, None, None),
    }
}

/// Write payload, projections, content hash, and `updated_at` for one row.
///
/// # Errors
///
/// Returns an error if serialization or the update fails.
pub(crate) fn write_payload(
    conn: &Connection,
    id: &str,
    payload: &Payload,
    content_hash: &str,
    updated_at: DateTime<Utc>,
) -> Result<()> {
    let (status, priority, complexity, assignee) = projections(payload);
    let payload_json = payload.to_value()?.to_string();
    conn.execute(
        "UPDATE elements
         SET payload = ?, status = ?, priority = ?, complexity = ?, assignee = ?,
             content_hash = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            payload_json,
            status,
            priority,
            complexity,
            assignee,
            content_hash,
            updated_at.to_rfc3339(),
            id
        ],
    )?;
    Ok(())
}

fn payload_identifier(payload: &Payload) -> String {
    match payload {
        Payload::Task(t) => t.title.clone(),
        Payload::Plan(p) => p.title.clone(),
        Payload::Document(d) => d.title.clone(),
        Payload::Message(m) => m.body.chars().take(64).collect(),
        Payload::Entity(e) => e.name.clone(),
        Payload::Workflow(g)
        | Payload::Playbook(g)
        | Payload::Channel(g)
        | Payload::Library(g)
        | Payload::Team(g) => g.title.clone().unwrap_or_else(|| payload.kind().to_string()),
    }
}

fn validate_payload(payload: &Payload, creating: bool) -> Result<()> {
    match payload {
        Payload::Task(t) => {
            Priority::validated(t.priority.0)?;
            Complexity::validated(t.complexity.0)?;
            if t.title.trim().is_empty() {
                return Err(StoneforgeError::validation("task title must not be empty"));
            }
            if creating && matches!(t.status, TaskStatus::Blocked | TaskStatus::Tombstone) {
                return Err(StoneforgeError::validation(format!(
                    "cannot create a task with derived status {}",
                    t.status
                )));
            }
        }
        Payload::Plan(p) => {
            if p.title.trim().is_empty() {
                return Err(StoneforgeError::validation("plan title must not be empty"));
            }
        }
        Payload::Document(d) => {
            if d.version < 1 {
                return Err(StoneforgeError::validation("document version must be >= 1"));
            }
        }
        _ => {}
    }
    Ok(())
}

fn append_document_version(
    conn: &Connection,
    document_id: &str,
    version: i64,
    payload: &Payload,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO document_versions (document_id, version, data, created_at)
         VALUES (?, ?, ?, ?)",
        rusqlite::params![document_id, version, payload.to_value()?.to_string(), at.to_rfc3339()],
    )?;
    Ok(())
}

impl Workspace {
    /// Create a new element from a typed payload. Mints an id, computes the
    /// content hash, writes tags, and appends a `created` event.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad payload, or a storage error.
    pub fn create_element(
        &mut self,
        payload: Payload,
        created_by: &str,
        tags: &[String],
    ) -> Result<Element> {
        validate_payload(&payload, true)?;

        let length = self.hash_length()?;
        let identifier = payload_identifier(&payload);
        let id = {
            let backend = self.backend();
            mint_id(
                payload.kind().id_prefix(),
                &identifier,
                created_by,
                length,
                |candidate| backend.element_exists(candidate),
            )?
        };

        let now = Utc::now();
        let mut element = Element {
            id: id.clone(),
            kind: payload.kind(),
            payload,
            content_hash: None,
            created_at: now,
            created_by: created_by.to_string(),
            updated_at: now,
            deleted_at: None,
            tags: tags.to_vec(),
        };
        element.content_hash = Some(compute_content_hash(&element)?);

        let insert = element.clone();
        self.mutate("create_element", created_by, move |tx, ctx| {
            let (status, priority, complexity, assignee) = projections(&insert.payload);
            tx.execute(
                "INSERT INTO elements (
                    id, kind, status, priority, complexity, assignee,
                    payload, content_hash, created_at, created_by, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    insert.id,
                    insert.kind.as_str(),
                    status,
                    priority,
                    complexity,
                    assignee,
                    insert.payload.to_value()?.to_string(),
                    insert.content_hash,
                    insert.created_at.to_rfc3339(),
                    insert.created_by,
                    insert.updated_at.to_rfc3339(),
                ],
            )?;

            for tag in &insert.tags {
                tx.execute(
                    "INSERT OR IGNORE INTO element_tags (element_id, tag) VALUES (?, ?)",
                    rusqlite::params![insert.id, tag],
                )?;
            }

            if let Payload::Document(doc) = &insert.payload {
                append_document_version(tx, &insert.id, doc.version, &insert.payload, insert.created_at)?;
            }

            ctx.record_event(
                EventType::Created,
                &insert.id,
                None,
                Some(insert.payload.to_value()?),
            );
            ctx.mark_dirty(&insert.id);
            // A pre-existing edge may reference this id as an external
            // blocker; it just became live.
            ctx.touch(CacheTouch::Dependents(insert.id.clone()));

            Ok(())
        })?;

        self.note_element_created()?;
        Ok(element)
    }

    /// Get a live element by id (soft-deleted rows excluded). Tags loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_element(&self, id: &str) -> Result<Option<Element>> {
        match self.get_element_any(id)? {
            Some(element) if element.is_deleted() => Ok(None),
            other => Ok(other),
        }
    }

    /// Get an element by id including soft-deleted rows. Tags loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_element_any(&self, id: &str) -> Result<Option<Element>> {
        let conn = self.backend().conn()?;
        let Some(mut element) = load_element(conn, id)? else {
            return Ok(None);
        };
        element.tags = load_tags(conn, id)?;
        Ok(Some(element))
    }

    /// List elements matching a filter. Tags are not loaded per row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_elements(&self, filter: &ElementFilter) -> Result<Vec<Element>> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM elements WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref kinds) = filter.kinds {
            if !kinds.is_empty() {
                let placeholders: Vec<&str> = kinds.iter().map(|_| "?").collect();
                let _ = write!(sql, " AND kind IN ({})", placeholders.join(","));
                for kind in kinds {
                    params.push(Box::new(kind.as_str().to_string()));
                }
            }
        }

        if let Some(ref statuses) = filter.statuses {
            if !statuses.is_empty() {
                let placeholders: Vec<&str> = statuses.iter().map(|_| "?").collect();
                let _ = write!(sql, " AND status IN ({})", placeholders.join(","));
                for status in statuses {
                    params.push(Box::new(status.clone()));
                }
            }
        }

        if let Some(ref created_by) = filter.created_by {
            sql.push_str(" AND created_by = ?");
            params.push(Box::new(created_by.clone()));
        }

        if let Some(ref assignee) = filter.assignee {
            sql.push_str(" AND assignee = ?");
            params.push(Box::new(assignee.clone()));
        }

        if let Some(ref tags) = filter.tags {
            if !tags.is_empty() {
                let placeholders: Vec<&str> = tags.iter().map(|_| "?").collect();
                let _ = write!(
                    sql,
                    " AND id IN (SELECT element_id FROM element_tags WHERE tag IN ({}))",
                    placeholders.join(",")
                );
                for tag in tags {
                    params.push(Box::new(tag.clone()));
                }
            }
        }

        if let Some(since) = filter.since {
            sql.push_str(" AND updated_at >= ?");
            params.push(Box::new(since.to_rfc3339()));
        }

        if !filter.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }

        sql.push_str(" ORDER BY created_at DESC, id");

        if let Some(limit) = filter.limit {
            if limit > 0 {
                let _ = write!(sql, " LIMIT {limit}");
                if let Some(offset) = filter.offset {
                    let _ = write!(sql, " OFFSET {offset}");
                }
            }
        }

        let conn = self.backend().conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
        let raws = stmt
            .query_map(params_refs.as_slice(), element_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raws.into_iter().map(RawElement::into_element).collect()
    }

    /// Replace an element's payload. Validates status transitions, bumps
    /// document versions, recomputes the content hash, and appends a
    /// `status_changed` or `updated` event.
    ///
    /// # Errors
    ///
    /// Returns `ElementNotFound`, `InvalidTransition`, a validation error,
    /// or a storage error.
    pub fn update_element(
        &mut self,
        id: &str,
        mut payload: Payload,
        actor: &str,
    ) -> Result<Element> {
        let existing = self
            .get_element(id)?
            .ok_or_else(|| StoneforgeError::ElementNotFound { id: id.to_string() })?;

        if payload.kind() != existing.kind {
            return Err(StoneforgeError::validation(format!(
                "cannot change element kind from {} to {}",
                existing.kind,
                payload.kind()
            )));
        }
        validate_payload(&payload, false)?;

        let now = Utc::now();
        let mut status_change: Option<(String, String)> = None;
        let mut completed_flipped = false;
        let mut document_version: Option<i64> = None;

        match (&existing.payload, &mut payload) {
            (Payload::Task(old), Payload::Task(new)) => {
                if old.status != new.status {
                    if !old.status.can_transition_to(new.status) {
                        return Err(StoneforgeError::InvalidTransition {
                            from: old.status.to_string(),
                            to: new.status.to_string(),
                        });
                    }
                    status_change = Some((old.status.to_string(), new.status.to_string()));
                    completed_flipped = old.status.is_completed() != new.status.is_completed();
                }
            }
            (Payload::Plan(old), Payload::Plan(new)) => {
                if old.status != new.status {
                    if !old.status.can_transition_to(new.status) {
                        return Err(StoneforgeError::InvalidTransition {
                            from: old.status.to_string(),
                            to: new.status.to_string(),
                        });
                    }
                    match new.status {
                        PlanStatus::Completed => new.completed_at = Some(now),
                        PlanStatus::Cancelled => new.cancelled_at = Some(now),
                        PlanStatus::Active | PlanStatus::Draft => {
                            new.completed_at = None;
                            new.cancelled_at = None;
                        }
                    }
                    status_change = Some((old.status.to_string(), new.status.to_string()));
                    completed_flipped = old.status.is_completed() != new.status.is_completed();
                }
            }
            (Payload::Document(old), Payload::Document(new)) => {
                new.version = old.version + 1;
                document_version = Some(new.version);
            }
            _ => {}
        }

        let mut updated = existing.clone();
        updated.payload = payload;
        updated.updated_at = now;
        let content_hash = compute_content_hash(&updated)?;
        updated.content_hash = Some(content_hash.clone());

        let old_payload = existing.payload.to_value()?;
        let new_payload = updated.payload.to_value()?;
        let payload_for_write = updated.payload.clone();
        let id_owned = id.to_string();

        self.mutate("update_element", actor, move |tx, ctx| {
            write_payload(tx, &id_owned, &payload_for_write, &content_hash, now)?;

            if let Some(version) = document_version {
                append_document_version(tx, &id_owned, version, &payload_for_write, now)?;
            }

            if let Some((ref from, ref to)) = status_change {
                ctx.record_event(
                    EventType::StatusChanged,
                    &id_owned,
                    Some(json!(from)),
                    Some(json!(to)),
                );
            } else {
                ctx.record_event(
                    EventType::Updated,
                    &id_owned,
                    Some(old_payload),
                    Some(new_payload),
                );
            }

            ctx.mark_dirty(&id_owned);
            ctx.touch(CacheTouch::Element(id_owned.clone()));
            if completed_flipped {
                ctx.touch(CacheTouch::Dependents(id_owned.clone()));
            }

            Ok(())
        })?;

        self.get_element(id)?
            .ok_or_else(|| StoneforgeError::ElementNotFound { id: id.to_string() })
    }

    /// Transition a task to a new status.
    ///
    /// # Errors
    ///
    /// Returns `ElementNotFound`, a validation error for non-tasks, or
    /// `InvalidTransition`.
    pub fn update_task_status(
        &mut self,
        id: &str,
        status: TaskStatus,
        actor: &str,
    ) -> Result<Element> {
        let existing = self
            .get_element(id)?
            .ok_or_else(|| StoneforgeError::ElementNotFound { id: id.to_string() })?;
        let Payload::Task(mut task) = existing.payload else {
            return Err(StoneforgeError::validation(format!(
                "{id} is not a task"
            )));
        };
        task.status = status;
        self.update_element(id, Payload::Task(task), actor)
    }

    /// Transition a plan to a new status.
    ///
    /// # Errors
    ///
    /// Returns `ElementNotFound`, a validation error for non-plans, or
    /// `InvalidTransition`.
    pub fn update_plan_status(
        &mut self,
        id: &str,
        status: PlanStatus,
        actor: &str,
    ) -> Result<Element> {
        let existing = self
            .get_element(id)?
            .ok_or_else(|| StoneforgeError::ElementNotFound { id: id.to_string() })?;
        let Payload::Plan(mut plan) = existing.payload else {
            return Err(StoneforgeError::validation(format!(
                "{id} is not a plan"
            )));
        };
        plan.status = status;
        self.update_element(id, Payload::Plan(plan), actor)
    }

    /// Soft-delete: set `deleted_at`, keep the row for audit.
    ///
    /// # Errors
    ///
    /// Returns `ElementNotFound` or a storage error.
    pub fn soft_delete_element(&mut self, id: &str, actor: &str) -> Result<()> {
        let existing = self
            .get_element(id)?
            .ok_or_else(|| StoneforgeError::ElementNotFound { id: id.to_string() })?;

        let now = Utc::now();
        let id_owned = id.to_string();
        let snapshot = existing.payload.to_value()?;
        self.mutate("soft_delete_element", actor, move |tx, ctx| {
            tx.execute(
                "UPDATE elements SET deleted_at = ?, updated_at = ? WHERE id = ?",
                rusqlite::params![now.to_rfc3339(), now.to_rfc3339(), id_owned],
            )?;

            ctx.record_event(EventType::Deleted, &id_owned, Some(snapshot), None);
            ctx.mark_dirty(&id_owned);
            ctx.touch(CacheTouch::Deleted(id_owned.clone()));

            Ok(())
        })
    }

    /// Hard delete: remove the row and everything it owns. Administrative;
    /// leaves no audit trail for the element.
    ///
    /// # Errors
    ///
    /// Returns `ElementNotFound` or a storage error.
    pub fn hard_delete_element(&mut self, id: &str) -> Result<()> {
        if !self.backend().element_exists(id)? {
            return Err(StoneforgeError::ElementNotFound { id: id.to_string() });
        }
        let id_owned = id.to_string();
        self.mutate("hard_delete_element", "admin", move |tx, ctx| {
            let mut stmt =
                tx.prepare("SELECT DISTINCT blocked_id FROM dependencies WHERE blocker_id = ?")?;
            let waiters: Vec<String> = stmt
                .query_map([&id_owned], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);

            // Edges pointing at this element have no FK; clean them up here.
            tx.execute("DELETE FROM dependencies WHERE blocker_id = ?", [&id_owned])?;
            tx.execute("DELETE FROM elements WHERE id = ?", [&id_owned])?;

            for waiter in waiters {
                ctx.touch(CacheTouch::Element(waiter));
            }
            Ok(())
        })
    }

    /// Attach a tag. Returns false if it was already present.
    ///
    /// # Errors
    ///
    /// Returns `ElementNotFound` or a storage error.
    pub fn add_tag(&mut self, id: &str, tag: &str, actor: &str) -> Result<bool> {
        if self.get_element(id)?.is_none() {
            return Err(StoneforgeError::ElementNotFound { id: id.to_string() });
        }
        let id_owned = id.to_string();
        let tag_owned = tag.to_string();
        self.mutate("add_tag", actor, move |tx, ctx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO element_tags (element_id, tag) VALUES (?, ?)",
                rusqlite::params![id_owned, tag_owned],
            )?;
            if inserted > 0 {
                ctx.record_event(EventType::TagAdded, &id_owned, None, Some(json!(tag_owned)));
                ctx.mark_dirty(&id_owned);
            }
            Ok(inserted > 0)
        })
    }

    /// Detach a tag. Returns false if it was not present.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn remove_tag(&mut self, id: &str, tag: &str, actor: &str) -> Result<bool> {
        let id_owned = id.to_string();
        let tag_owned = tag.to_string();
        self.mutate("remove_tag", actor, move |tx, ctx| {
            let removed = tx.execute(
                "DELETE FROM element_tags WHERE element_id = ? AND tag = ?",
                rusqlite::params![id_owned, tag_owned],
            )?;
            if removed > 0 {
                ctx.record_event(
                    EventType::TagRemoved,
                    &id_owned,
                    Some(json!(tag_owned)),
                    None,
                );
                ctx.mark_dirty(&id_owned);
            }
            Ok(removed > 0)
        })
    }

    /// Replace the full tag set.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn set_tags(&mut self, id: &str, tags: &[String], actor: &str) -> Result<()> {
        let id_owned = id.to_string();
        let tags_owned = tags.to_vec();
        self.mutate("set_tags", actor, move |tx, ctx| {
            let old_tags = load_tags(tx, &id_owned)?;
            tx.execute("DELETE FROM element_tags WHERE element_id = ?", [&id_owned])?;
            for tag in &tags_owned {
                tx.execute(
                    "INSERT OR IGNORE INTO element_tags (element_id, tag) VALUES (?, ?)",
                    rusqlite::params![id_owned, tag],
                )?;
            }
            if old_tags != tags_owned {
                ctx.record_event(
                    EventType::Updated,
                    &id_owned,
                    Some(json!(old_tags)),
                    Some(json!(tags_owned)),
                );
                ctx.mark_dirty(&id_owned);
            }
            Ok(())
        })
    }

    /// Tags for an element, sorted.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn tags(&self, id: &str) -> Result<Vec<String>> {
        load_tags(self.backend().conn()?, id)
    }

    /// Version history for a document, oldest first: (version, payload JSON).
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn document_versions(&self, document_id: &str) -> Result<Vec<(i64, String)>> {
        let conn = self.backend().conn()?;
        let mut stmt = conn.prepare(
            "SELECT version, data FROM document_versions
             WHERE document_id = ? ORDER BY version",
        )?;
        let versions = stmt
            .query_map([document_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    /// One historical document version's payload JSON.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn document_version(&self, document_id: &str, version: i64) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;
        let conn = self.backend().conn()?;
        let data = conn
            .query_row(
                "SELECT data FROM document_versions WHERE document_id = ? AND version = ?",
                rusqlite::params![document_id, version],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }
}

pub(crate) fn load_tags(conn: &Connection, id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT tag FROM element_tags WHERE element_id = ? ORDER BY tag")?;
    let tags = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tags)
}
