//! Blocked cache: the derived "which elements are blocked, by what, and why"
//! materialization, plus gate satisfaction.
//!
//! [`compute_blocking`] is the reference definition of blockedness; every
//! incremental handler delegates to it and cascades only when an element's
//! blocked state actually flips. [`rebuild`] recomputes the whole table from
//! scratch and must produce a set identical to any legal sequence of
//! incremental updates.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde_json::json;

use crate::engine::deps::{load_dependency, write_metadata};
use crate::engine::{CacheTouch, Workspace};
use crate::error::{Result, StoneforgeError};
use crate::hash::hash_kind_and_body;
use crate::model::{BlockedEntry, DependencyMetadata, DependencyType, EventType, GateType, TaskStatus};
use crate::storage::parse_datetime;

/// Statuses that count as completed for blocking purposes.
pub const COMPLETED_STATUSES: &[&str] = &["closed", "completed", "tombstone"];

/// Result of a full cache rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildReport {
    pub elements_checked: usize,
    pub elements_blocked: usize,
    pub duration_ms: u64,
}

/// Result of recording or removing an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalOutcome {
    pub success: bool,
    pub current_count: u32,
    pub required_count: u32,
    pub satisfied: bool,
}

/// Minimal element image for blocking decisions.
struct ElementLite {
    kind: String,
    status: Option<String>,
    deleted: bool,
}

fn load_lite(conn: &Connection, id: &str) -> Result<Option<ElementLite>> {
    let lite = conn
        .query_row(
            "SELECT kind, status, deleted_at IS NOT NULL FROM elements WHERE id = ?",
            [id],
            |row| {
                Ok(ElementLite {
                    kind: row.get(0)?,
                    status: row.get(1)?,
                    deleted: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(lite)
}

fn is_completed_status(status: Option<&str>) -> bool {
    status.is_some_and(|s| COMPLETED_STATUSES.contains(&s))
}

/// The reference definition: what, if anything, blocks this element right
/// now. Evaluation order is blocks, then parent-child, then awaits; the
/// first match supplies the cached reason.
///
/// # Errors
///
/// Returns a storage error.
pub fn compute_blocking(
    conn: &Connection,
    element_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<(String, String)>> {
    let Some(lite) = load_lite(conn, element_id)? else {
        return Ok(None);
    };
    if lite.deleted || is_completed_status(lite.status.as_deref()) {
        return Ok(None);
    }

    let mut stmt = conn.prepare(
        "SELECT blocker_id, dep_type, metadata FROM dependencies
         WHERE blocked_id = ? AND dep_type IN ('blocks', 'parent-child', 'awaits')
         ORDER BY CASE dep_type
             WHEN 'blocks' THEN 0
             WHEN 'parent-child' THEN 1
             ELSE 2
         END, blocker_id",
    )?;
    let edges: Vec<(String, String, String)> = stmt
        .query_map([element_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (blocker_id, dep_type, metadata_json) in edges {
        match dep_type.as_str() {
            "blocks" => {
                // Missing or soft-deleted blockers count as completed.
                if let Some(blocker) = load_lite(conn, &blocker_id)? {
                    if !blocker.deleted && !is_completed_status(blocker.status.as_deref()) {
                        return Ok(Some((blocker_id, "blocks dependency".to_string())));
                    }
                }
            }
            "parent-child" => {
                let Some(parent) = load_lite(conn, &blocker_id)? else {
                    continue;
                };
                if parent.deleted {
                    continue;
                }
                if cache_row_exists(conn, &blocker_id)? {
                    return Ok(Some((blocker_id, "parent is blocked".to_string())));
                }
                // Plans are never blocking parents by status alone.
                if parent.kind == "task" && !is_completed_status(parent.status.as_deref()) {
                    return Ok(Some((blocker_id, "parent not completed".to_string())));
                }
            }
            _ => {
                let metadata: DependencyMetadata =
                    serde_json::from_str(&metadata_json).unwrap_or_default();
                if let Some(gate) = metadata.gate {
                    if !gate.is_satisfied(now) {
                        return Ok(Some((
                            blocker_id,
                            format!("awaiting {} gate", gate.gate_type),
                        )));
                    }
                }
            }
        }
    }

    Ok(None)
}

fn cache_row_exists(conn: &Connection, element_id: &str) -> Result<bool> {
    let mut stmt = conn.prepare("SELECT 1 FROM blocked_cache WHERE element_id = ?")?;
    Ok(stmt.exists([element_id])?)
}

fn load_cache_row(conn: &Connection, element_id: &str) -> Result<Option<BlockedEntry>> {
    let entry = conn
        .query_row(
            "SELECT element_id, blocked_by, reason, previous_status, blocked_at
             FROM blocked_cache WHERE element_id = ?",
            [element_id],
            entry_from_row,
        )
        .optional()?;
    Ok(entry)
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockedEntry> {
    Ok(BlockedEntry {
        element_id: row.get(0)?,
        blocked_by: row.get(1)?,
        reason: row.get(2)?,
        previous_status: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| s.parse().ok()),
        blocked_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

fn upsert_cache_row(
    conn: &Connection,
    element_id: &str,
    blocked_by: &str,
    reason: &str,
    previous_status: Option<TaskStatus>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO blocked_cache (element_id, blocked_by, reason, previous_status, blocked_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(element_id) DO UPDATE SET
             blocked_by = excluded.blocked_by,
             reason = excluded.reason",
        rusqlite::params![
            element_id,
            blocked_by,
            reason,
            previous_status.map(TaskStatus::as_str),
            now.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn remove_cache_row(conn: &Connection, element_id: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM blocked_cache WHERE element_id = ?",
        [element_id],
    )?;
    Ok(removed > 0)
}

pub(crate) fn clear_cache(conn: &Connection) -> Result<usize> {
    Ok(conn.execute("DELETE FROM blocked_cache", [])?)
}

/// Rewrite an element's live status (column and payload) without touching
/// the audit log. Status mirroring is the only caller.
fn set_live_status(conn: &Connection, element_id: &str, status: TaskStatus) -> Result<()> {
    let (kind, payload_json): (String, String) = conn.query_row(
        "SELECT kind, payload FROM elements WHERE id = ?",
        [element_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let mut value: serde_json::Value = serde_json::from_str(&payload_json)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("status".to_string(), json!(status.as_str()));
    }
    let content_hash = hash_kind_and_body(&kind, &value);
    conn.execute(
        "UPDATE elements SET payload = ?, status = ?, content_hash = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            value.to_string(),
            status.as_str(),
            content_hash,
            Utc::now().to_rfc3339(),
            element_id
        ],
    )?;
    Ok(())
}

fn live_task_status(lite: &ElementLite) -> Option<TaskStatus> {
    if lite.kind == "task" {
        lite.status.as_deref().and_then(|s| s.parse().ok())
    } else {
        None
    }
}

/// Recompute one element's blocking state and reconcile the cache row and
/// status mirror. Returns true when the blocked state flipped.
///
/// # Errors
///
/// Returns a storage error.
pub fn invalidate_element(conn: &Connection, element_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let Some(lite) = load_lite(conn, element_id)? else {
        return remove_cache_row(conn, element_id);
    };

    let desired = compute_blocking(conn, element_id, now)?;
    let existing = load_cache_row(conn, element_id)?;

    match (existing, desired) {
        (None, None) => Ok(false),
        (None, Some((blocker, reason))) => {
            let live = live_task_status(&lite);
            let previous = live.filter(|s| *s != TaskStatus::Blocked);
            upsert_cache_row(conn, element_id, &blocker, &reason, previous, now)?;
            if previous.is_some() {
                set_live_status(conn, element_id, TaskStatus::Blocked)?;
            }
            Ok(true)
        }
        (Some(row), Some((blocker, reason))) => {
            if row.blocked_by != blocker || row.reason != reason {
                conn.execute(
                    "UPDATE blocked_cache SET blocked_by = ?, reason = ? WHERE element_id = ?",
                    rusqlite::params![blocker, reason, element_id],
                )?;
            }
            Ok(false)
        }
        (Some(row), None) => {
            remove_cache_row(conn, element_id)?;
            if live_task_status(&lite) == Some(TaskStatus::Blocked) {
                let restored = row.previous_status.unwrap_or(TaskStatus::Open);
                set_live_status(conn, element_id, restored)?;
            }
            Ok(true)
        }
    }
}

/// Recompute every element waiting on `element_id` through a blocking edge,
/// cascading further only where a waiter's blocked state flipped.
///
/// # Errors
///
/// Returns a storage error.
pub fn invalidate_dependents(conn: &Connection, element_id: &str, now: DateTime<Utc>) -> Result<usize> {
    let mut changed = 0;
    let mut queue: VecDeque<String> = VecDeque::from([element_id.to_string()]);

    // A waiter may be re-evaluated when several of its blockers flip in one
    // wave; evaluations that don't flip it enqueue nothing, so the walk
    // terminates even on re-visits.
    while let Some(current) = queue.pop_front() {
        let waiters = blocking_dependents(conn, &current)?;
        for waiter in waiters {
            if invalidate_element(conn, &waiter, now)? {
                changed += 1;
                queue.push_back(waiter);
            }
        }
    }

    Ok(changed)
}

/// Recompute one element, then cascade to its dependents if it flipped.
///
/// # Errors
///
/// Returns a storage error.
pub fn invalidate_element_cascading(conn: &Connection, element_id: &str) -> Result<()> {
    let now = Utc::now();
    if invalidate_element(conn, element_id, now)? {
        invalidate_dependents(conn, element_id, now)?;
    }
    Ok(())
}

/// Deletion handler: drop the element's own row, then recompute dependents.
///
/// # Errors
///
/// Returns a storage error.
pub fn on_element_deleted(conn: &Connection, element_id: &str) -> Result<()> {
    remove_cache_row(conn, element_id)?;
    invalidate_dependents(conn, element_id, Utc::now())?;
    Ok(())
}

fn blocking_dependents(conn: &Connection, element_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT blocked_id FROM dependencies
         WHERE blocker_id = ? AND dep_type IN ('blocks', 'parent-child', 'awaits')
         ORDER BY blocked_id",
    )?;
    let ids = stmt
        .query_map([element_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Recompute the whole cache from the graph, processing parents before
/// children so the "parent is blocked" cascade lands deterministically.
///
/// # Errors
///
/// Returns a storage error.
pub fn rebuild(conn: &Connection) -> Result<RebuildReport> {
    let start = Instant::now();
    let now = Utc::now();

    // Keep previous_status across the rebuild so restores stay possible.
    let mut stmt =
        conn.prepare("SELECT element_id, previous_status FROM blocked_cache")?;
    let old_previous: HashMap<String, Option<TaskStatus>> = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(id, status)| (id, status.and_then(|s| s.parse().ok())))
        .collect();
    drop(stmt);

    clear_cache(conn)?;

    let mut stmt = conn.prepare("SELECT id FROM elements WHERE deleted_at IS NULL ORDER BY id")?;
    let ids: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);
    let id_set: HashSet<&str> = ids.iter().map(String::as_str).collect();

    // Topological order over parent-child: parents first.
    let mut stmt = conn.prepare(
        "SELECT blocked_id, blocker_id FROM dependencies WHERE dep_type = 'parent-child'",
    )?;
    let parent_edges: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut indegree: HashMap<&str, usize> = ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for (child, parent) in &parent_edges {
        if id_set.contains(child.as_str()) && id_set.contains(parent.as_str()) {
            *indegree.entry(child.as_str()).or_default() += 1;
            children.entry(parent.as_str()).or_default().push(child.as_str());
        }
    }

    let mut queue: VecDeque<&str> = ids
        .iter()
        .map(String::as_str)
        .filter(|id| indegree[id] == 0)
        .collect();
    let mut order: Vec<&str> = Vec::with_capacity(ids.len());
    while let Some(id) = queue.pop_front() {
        order.push(id);
        for child in children.get(id).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(*child) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }
    // Any remainder sits on a parent-child cycle, which add_dependency
    // refuses to create; process it anyway so the scan is total.
    if order.len() < ids.len() {
        let placed: HashSet<&str> = order.iter().copied().collect();
        order.extend(
            ids.iter()
                .map(String::as_str)
                .filter(|id| !placed.contains(id)),
        );
    }

    let mut blocked = 0;
    for id in &order {
        let Some(lite) = load_lite(conn, id)? else {
            continue;
        };
        let live = live_task_status(&lite);
        match compute_blocking(conn, id, now)? {
            Some((blocker, reason)) => {
                let previous = live
                    .filter(|s| *s != TaskStatus::Blocked)
                    .or_else(|| old_previous.get(*id).copied().flatten());
                upsert_cache_row(conn, id, &blocker, &reason, previous, now)?;
                if live.is_some_and(|s| s != TaskStatus::Blocked) {
                    set_live_status(conn, id, TaskStatus::Blocked)?;
                }
                blocked += 1;
            }
            None => {
                if live == Some(TaskStatus::Blocked) {
                    let restored = old_previous
                        .get(*id)
                        .copied()
                        .flatten()
                        .unwrap_or(TaskStatus::Open);
                    set_live_status(conn, id, restored)?;
                }
            }
        }
    }

    Ok(RebuildReport {
        elements_checked: order.len(),
        elements_blocked: blocked,
        duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

impl Workspace {
    /// Point query: is this element currently blocked, and why.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn is_blocked(&self, element_id: &str) -> Result<Option<BlockedEntry>> {
        load_cache_row(self.backend().conn()?, element_id)
    }

    /// Every currently blocked element.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn all_blocked(&self) -> Result<Vec<BlockedEntry>> {
        let conn = self.backend().conn()?;
        let mut stmt = conn.prepare(
            "SELECT element_id, blocked_by, reason, previous_status, blocked_at
             FROM blocked_cache ORDER BY element_id",
        )?;
        let entries = stmt
            .query_map([], entry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Elements whose cached blocker is `blocker_id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn blocked_by(&self, blocker_id: &str) -> Result<Vec<String>> {
        let conn = self.backend().conn()?;
        let mut stmt = conn.prepare(
            "SELECT element_id FROM blocked_cache WHERE blocked_by = ? ORDER BY element_id",
        )?;
        let ids = stmt
            .query_map([blocker_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Number of currently blocked elements.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn blocked_count(&self) -> Result<usize> {
        let count: i64 =
            self.backend()
                .conn()?
                .query_row("SELECT count(*) FROM blocked_cache", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Rebuild the cache from scratch.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn rebuild_blocked_cache(&mut self) -> Result<RebuildReport> {
        let tx = self
            .backend_mut()
            .transaction(TransactionBehavior::Immediate)?;
        let report = rebuild(&tx)?;
        tx.commit()?;
        tracing::debug!(
            checked = report.elements_checked,
            blocked = report.elements_blocked,
            ms = report.duration_ms,
            "blocked cache rebuilt"
        );
        Ok(report)
    }

    /// Mark an external or webhook gate satisfied. Idempotent; returns
    /// false for missing edges and non-applicable gate types.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn satisfy_gate(&mut self, blocked_id: &str, blocker_id: &str, actor: &str) -> Result<bool> {
        let blocked_owned = blocked_id.to_string();
        let blocker_owned = blocker_id.to_string();
        self.mutate("satisfy_gate", actor, move |tx, ctx| {
            let Some(mut dep) =
                load_dependency(tx, &blocked_owned, &blocker_owned, DependencyType::Awaits)?
            else {
                return Ok(false);
            };
            let Some(gate) = dep.metadata.gate.as_mut() else {
                return Ok(false);
            };
            if !matches!(gate.gate_type, GateType::External | GateType::Webhook) {
                return Ok(false);
            }
            if gate.satisfied == Some(true) {
                return Ok(true);
            }

            gate.satisfied = Some(true);
            gate.satisfied_at = Some(Utc::now());
            gate.satisfied_by = Some(ctx.actor.clone());
            let gate_type = gate.gate_type;
            write_metadata(
                tx,
                &blocked_owned,
                &blocker_owned,
                DependencyType::Awaits,
                &dep.metadata,
            )?;

            ctx.record_event(
                EventType::GateSatisfied,
                &blocked_owned,
                None,
                Some(json!({
                    "blockerId": blocker_owned,
                    "gateType": gate_type.as_str(),
                })),
            );
            ctx.mark_dirty(&blocked_owned);
            ctx.touch(CacheTouch::Element(blocked_owned.clone()));
            Ok(true)
        })
    }

    /// Record one approval on an approval gate. Idempotent per approver.
    ///
    /// # Errors
    ///
    /// Returns `DependencyNotFound` for a missing edge, a validation error
    /// for non-approval gates, and a permission error for approvers outside
    /// `requiredApprovers`.
    pub fn record_approval(
        &mut self,
        blocked_id: &str,
        blocker_id: &str,
        approver: &str,
    ) -> Result<ApprovalOutcome> {
        let blocked_owned = blocked_id.to_string();
        let blocker_owned = blocker_id.to_string();
        let approver_owned = approver.to_string();
        self.mutate("record_approval", approver, move |tx, ctx| {
            let mut dep = load_dependency(tx, &blocked_owned, &blocker_owned, DependencyType::Awaits)?
                .ok_or_else(|| StoneforgeError::DependencyNotFound {
                    blocked_id: blocked_owned.clone(),
                    blocker_id: blocker_owned.clone(),
                })?;
            let Some(gate) = dep.metadata.gate.as_mut() else {
                return Err(StoneforgeError::validation("edge has no gate metadata"));
            };
            if gate.gate_type != GateType::Approval {
                return Err(StoneforgeError::validation(format!(
                    "cannot approve a {} gate",
                    gate.gate_type
                )));
            }
            if !gate.required_approvers.contains(&approver_owned) {
                return Err(StoneforgeError::Permission {
                    message: format!("{approver_owned} is not a required approver"),
                });
            }

            let already = gate.current_approvers.contains(&approver_owned);
            if !already {
                gate.current_approvers.push(approver_owned.clone());
            }
            let outcome = ApprovalOutcome {
                success: true,
                current_count: u32::try_from(
                    gate.current_approvers
                        .iter()
                        .filter(|a| gate.required_approvers.contains(a))
                        .count(),
                )
                .unwrap_or(u32::MAX),
                required_count: gate.needed_approvals(),
                satisfied: gate.is_satisfied(Utc::now()),
            };

            if !already {
                write_metadata(
                    tx,
                    &blocked_owned,
                    &blocker_owned,
                    DependencyType::Awaits,
                    &dep.metadata,
                )?;
                ctx.record_event(
                    EventType::ApprovalRecorded,
                    &blocked_owned,
                    None,
                    Some(json!({
                        "blockerId": blocker_owned,
                        "approver": approver_owned,
                        "currentCount": outcome.current_count,
                        "requiredCount": outcome.required_count,
                    })),
                );
                ctx.mark_dirty(&blocked_owned);
                ctx.touch(CacheTouch::Element(blocked_owned.clone()));
            }

            Ok(outcome)
        })
    }

    /// Withdraw one approval. If the gate drops back below its threshold,
    /// re-invalidation re-blocks the waiter.
    ///
    /// # Errors
    ///
    /// Returns `DependencyNotFound` for a missing edge and a validation
    /// error for non-approval gates.
    pub fn remove_approval(
        &mut self,
        blocked_id: &str,
        blocker_id: &str,
        approver: &str,
    ) -> Result<ApprovalOutcome> {
        let blocked_owned = blocked_id.to_string();
        let blocker_owned = blocker_id.to_string();
        let approver_owned = approver.to_string();
        self.mutate("remove_approval", approver, move |tx, ctx| {
            let mut dep = load_dependency(tx, &blocked_owned, &blocker_owned, DependencyType::Awaits)?
                .ok_or_else(|| StoneforgeError::DependencyNotFound {
                    blocked_id: blocked_owned.clone(),
                    blocker_id: blocker_owned.clone(),
                })?;
            let Some(gate) = dep.metadata.gate.as_mut() else {
                return Err(StoneforgeError::validation("edge has no gate metadata"));
            };
            if gate.gate_type != GateType::Approval {
                return Err(StoneforgeError::validation(format!(
                    "cannot withdraw approval from a {} gate",
                    gate.gate_type
                )));
            }

            let had = gate.current_approvers.iter().any(|a| a == &approver_owned);
            gate.current_approvers.retain(|a| a != &approver_owned);
            let outcome = ApprovalOutcome {
                success: had,
                current_count: u32::try_from(
                    gate.current_approvers
                        .iter()
                        .filter(|a| gate.required_approvers.contains(a))
                        .count(),
                )
                .unwrap_or(u32::MAX),
                required_count: gate.needed_approvals(),
                satisfied: gate.is_satisfied(Utc::now()),
            };

            if had {
                write_metadata(
                    tx,
                    &blocked_owned,
                    &blocker_owned,
                    DependencyType::Awaits,
                    &dep.metadata,
                )?;
                ctx.record_event(
                    EventType::ApprovalRemoved,
                    &blocked_owned,
                    Some(json!({
                        "blockerId": blocker_owned,
                        "approver": approver_owned,
                    })),
                    None,
                );
                ctx.mark_dirty(&blocked_owned);
                ctx.touch(CacheTouch::Element(blocked_owned.clone()));
            }

            Ok(outcome)
        })
    }
}
