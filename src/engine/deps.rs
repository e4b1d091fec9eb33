//! Dependency edges: schema enforcement, relates-to normalization, cycle
//! detection, and bulk graph queries.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;

use crate::engine::{CacheTouch, Workspace};
use crate::error::{Result, StoneforgeError};
use crate::model::{Dependency, DependencyMetadata, DependencyType, EventType};
use crate::storage::parse_datetime;

/// Default BFS depth cap for cycle detection.
pub const DEFAULT_MAX_CYCLE_DEPTH: usize = 100;

/// Outcome of a cycle probe. A depth-limited probe reports no cycle and
/// sets `depth_limit_reached`; callers treat that as "unknown, allow".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CycleCheck {
    pub has_cycle: bool,
    pub nodes_visited: usize,
    pub depth_limit_reached: bool,
    /// Full path from the proposed blocker through to the waiter, when a
    /// cycle was found.
    pub path: Vec<String>,
}

const BLOCKING_TYPES_SQL: &str = "('blocks', 'parent-child', 'awaits')";

fn dependency_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Dependency, String)> {
    Ok((
        Dependency {
            blocked_id: row.get(0)?,
            blocker_id: row.get(1)?,
            dep_type: row
                .get::<_, String>(2)?
                .parse()
                .unwrap_or(DependencyType::Blocks),
            created_at: parse_datetime(&row.get::<_, String>(3)?),
            created_by: row.get(4)?,
            metadata: DependencyMetadata::default(),
        },
        row.get(5)?,
    ))
}

fn finish(parsed: (Dependency, String)) -> Dependency {
    let (mut dep, metadata_json) = parsed;
    dep.metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
    dep
}

const DEP_COLUMNS: &str =
    "blocked_id, blocker_id, dep_type, created_at, created_by, metadata";

/// Canonical (blocked, blocker) order for a dependency key. Symmetric types
/// store the lexicographically smaller id as `blocked_id`.
fn normalize<'a>(
    blocked_id: &'a str,
    blocker_id: &'a str,
    dep_type: DependencyType,
) -> (&'a str, &'a str) {
    if dep_type.is_symmetric() && blocked_id > blocker_id {
        (blocker_id, blocked_id)
    } else {
        (blocked_id, blocker_id)
    }
}

/// Load one edge by its normalized composite key.
///
/// # Errors
///
/// Returns a storage error.
pub(crate) fn load_dependency(
    conn: &Connection,
    blocked_id: &str,
    blocker_id: &str,
    dep_type: DependencyType,
) -> Result<Option<Dependency>> {
    let (blocked_id, blocker_id) = normalize(blocked_id, blocker_id, dep_type);
    let sql = format!(
        "SELECT {DEP_COLUMNS} FROM dependencies
         WHERE blocked_id = ? AND blocker_id = ? AND dep_type = ?"
    );
    let mut stmt = conn.prepare(&sql)?;
    let result = stmt.query_row(
        rusqlite::params![blocked_id, blocker_id, dep_type.as_str()],
        dependency_from_row,
    );
    match result {
        Ok(parsed) => Ok(Some(finish(parsed))),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Persist updated metadata for one edge, inside the caller's transaction.
///
/// # Errors
///
/// Returns a storage error.
pub(crate) fn write_metadata(
    conn: &Connection,
    blocked_id: &str,
    blocker_id: &str,
    dep_type: DependencyType,
    metadata: &DependencyMetadata,
) -> Result<()> {
    conn.execute(
        "UPDATE dependencies SET metadata = ?
         WHERE blocked_id = ? AND blocker_id = ? AND dep_type = ?",
        rusqlite::params![
            serde_json::to_string(metadata)?,
            blocked_id,
            blocker_id,
            dep_type.as_str()
        ],
    )?;
    Ok(())
}

/// BFS from `blocker_id` across blocking edges, walking toward the things
/// each frontier node waits on; a cycle exists iff `blocked_id` is reached.
///
/// # Errors
///
/// Returns a storage error.
pub fn detect_cycle(
    conn: &Connection,
    blocked_id: &str,
    blocker_id: &str,
    dep_type: DependencyType,
    max_depth: usize,
) -> Result<CycleCheck> {
    if !dep_type.is_blocking() {
        return Ok(CycleCheck::default());
    }

    let sql = format!(
        "SELECT blocker_id FROM dependencies
         WHERE blocked_id = ? AND dep_type IN {BLOCKING_TYPES_SQL}
         ORDER BY blocker_id"
    );
    let mut stmt = conn.prepare(&sql)?;

    let mut check = CycleCheck::default();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut parents: HashMap<String, String> = HashMap::new();

    queue.push_back((blocker_id.to_string(), 0));
    visited.insert(blocker_id.to_string());

    while let Some((current, depth)) = queue.pop_front() {
        let nexts: Vec<String> = stmt
            .query_map([current.as_str()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for next in nexts {
            check.nodes_visited += 1;

            if next == blocked_id {
                let mut path = vec![current.clone()];
                let mut cursor = current.clone();
                while let Some(parent) = parents.get(&cursor) {
                    path.push(parent.clone());
                    cursor = parent.clone();
                }
                path.reverse();
                path.push(next);
                path.push(blocked_id.to_string());
                check.has_cycle = true;
                check.path = path;
                return Ok(check);
            }

            if depth + 1 > max_depth {
                check.depth_limit_reached = true;
                continue;
            }

            if visited.insert(next.clone()) {
                parents.insert(next.clone(), current.clone());
                queue.push_back((next, depth + 1));
            }
        }
    }

    Ok(check)
}

fn validate_metadata(dep_type: DependencyType, metadata: &DependencyMetadata) -> Result<()> {
    match dep_type {
        DependencyType::Awaits => {
            let Some(gate) = &metadata.gate else {
                return Err(StoneforgeError::validation(
                    "awaits dependency requires gate metadata",
                ));
            };
            gate.validate()
        }
        DependencyType::Validates => {
            if metadata.test_type.is_none() || metadata.result.is_none() {
                return Err(StoneforgeError::validation(
                    "validates dependency requires testType and result",
                ));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

impl Workspace {
    /// Add a typed dependency edge. Rejects self-references, duplicate edges
    /// (for relates-to, in either orientation), malformed gate metadata, and
    /// blocking edges that would close a cycle.
    ///
    /// # Errors
    ///
    /// Returns validation, conflict, `CycleDetected`, `ElementNotFound`, or
    /// storage errors.
    pub fn add_dependency(
        &mut self,
        blocked_id: &str,
        blocker_id: &str,
        dep_type: DependencyType,
        actor: &str,
        metadata: Option<DependencyMetadata>,
    ) -> Result<Dependency> {
        if blocked_id == blocker_id {
            return Err(StoneforgeError::validation(format!(
                "self-referential dependency on {blocked_id}"
            )));
        }

        let metadata = metadata.unwrap_or_default();
        validate_metadata(dep_type, &metadata)?;

        let (blocked_id, blocker_id) = normalize(blocked_id, blocker_id, dep_type);

        if !self.backend().element_exists(blocked_id)? {
            return Err(StoneforgeError::ElementNotFound {
                id: blocked_id.to_string(),
            });
        }

        let blocked_owned = blocked_id.to_string();
        let blocker_owned = blocker_id.to_string();
        self.mutate("add_dependency", actor, move |tx, ctx| {
            if load_dependency(tx, &blocked_owned, &blocker_owned, dep_type)?.is_some() {
                return Err(StoneforgeError::conflict(format!(
                    "dependency already exists: {blocked_owned} -> {blocker_owned} ({dep_type})"
                )));
            }

            if dep_type.is_blocking() {
                let check = detect_cycle(
                    tx,
                    &blocked_owned,
                    &blocker_owned,
                    dep_type,
                    DEFAULT_MAX_CYCLE_DEPTH,
                )?;
                if check.has_cycle {
                    return Err(StoneforgeError::CycleDetected { path: check.path });
                }
            }

            let dep = Dependency {
                blocked_id: blocked_owned.clone(),
                blocker_id: blocker_owned.clone(),
                dep_type,
                created_at: Utc::now(),
                created_by: ctx.actor.clone(),
                metadata,
            };

            tx.execute(
                "INSERT INTO dependencies
                 (blocked_id, blocker_id, dep_type, created_at, created_by, metadata)
                 VALUES (?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    dep.blocked_id,
                    dep.blocker_id,
                    dep.dep_type.as_str(),
                    dep.created_at.to_rfc3339(),
                    dep.created_by,
                    serde_json::to_string(&dep.metadata)?,
                ],
            )?;

            ctx.record_event(
                EventType::DependencyAdded,
                &dep.blocked_id,
                None,
                Some(json!({
                    "blockerId": dep.blocker_id,
                    "type": dep.dep_type.as_str(),
                })),
            );
            ctx.mark_dirty(&dep.blocked_id);
            if dep_type.is_blocking() {
                ctx.touch(CacheTouch::Element(dep.blocked_id.clone()));
            }

            Ok(dep)
        })
    }

    /// Remove a dependency edge. Symmetric types match either orientation.
    ///
    /// # Errors
    ///
    /// Returns `DependencyNotFound` if the edge does not exist.
    pub fn remove_dependency(
        &mut self,
        blocked_id: &str,
        blocker_id: &str,
        dep_type: DependencyType,
        actor: &str,
    ) -> Result<()> {
        let (blocked_id, blocker_id) = normalize(blocked_id, blocker_id, dep_type);
        let blocked_owned = blocked_id.to_string();
        let blocker_owned = blocker_id.to_string();

        self.mutate("remove_dependency", actor, move |tx, ctx| {
            let removed = tx.execute(
                "DELETE FROM dependencies
                 WHERE blocked_id = ? AND blocker_id = ? AND dep_type = ?",
                rusqlite::params![blocked_owned, blocker_owned, dep_type.as_str()],
            )?;

            if removed == 0 {
                return Err(StoneforgeError::DependencyNotFound {
                    blocked_id: blocked_owned.clone(),
                    blocker_id: blocker_owned.clone(),
                });
            }

            ctx.record_event(
                EventType::DependencyRemoved,
                &blocked_owned,
                Some(json!({
                    "blockerId": blocker_owned,
                    "type": dep_type.as_str(),
                })),
                None,
            );
            ctx.mark_dirty(&blocked_owned);
            if dep_type.is_blocking() {
                ctx.touch(CacheTouch::Element(blocked_owned.clone()));
            }

            Ok(())
        })
    }

    /// Probe whether adding an edge would close a cycle, without mutating.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn cycle_check(
        &self,
        blocked_id: &str,
        blocker_id: &str,
        dep_type: DependencyType,
        max_depth: Option<usize>,
    ) -> Result<CycleCheck> {
        detect_cycle(
            self.backend().conn()?,
            blocked_id,
            blocker_id,
            dep_type,
            max_depth.unwrap_or(DEFAULT_MAX_CYCLE_DEPTH),
        )
    }

    /// Edges where `id` is the waiter.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn dependencies_of(&self, id: &str) -> Result<Vec<Dependency>> {
        self.edges("blocked_id", id)
    }

    /// Edges where `id` is being waited on.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn dependents_of(&self, id: &str) -> Result<Vec<Dependency>> {
        self.edges("blocker_id", id)
    }

    fn edges(&self, column: &str, id: &str) -> Result<Vec<Dependency>> {
        let sql = format!(
            "SELECT {DEP_COLUMNS} FROM dependencies
             WHERE {column} = ? ORDER BY dep_type, blocked_id, blocker_id"
        );
        let conn = self.backend().conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let deps = stmt
            .query_map([id], dependency_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(deps.into_iter().map(finish).collect())
    }

    /// Relates-to edges touching `id`, regardless of stored orientation.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn related_to(&self, id: &str) -> Result<Vec<Dependency>> {
        let sql = format!(
            "SELECT {DEP_COLUMNS} FROM dependencies
             WHERE dep_type = 'relates-to' AND (blocked_id = ? OR blocker_id = ?)
             ORDER BY blocked_id, blocker_id"
        );
        let conn = self.backend().conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let deps = stmt
            .query_map([id, id], dependency_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(deps.into_iter().map(finish).collect())
    }

    /// One edge by key, normalized for symmetric types.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn get_dependency(
        &self,
        blocked_id: &str,
        blocker_id: &str,
        dep_type: DependencyType,
    ) -> Result<Option<Dependency>> {
        load_dependency(self.backend().conn()?, blocked_id, blocker_id, dep_type)
    }

    /// Whether an edge exists (either orientation for symmetric types).
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn dependency_exists(
        &self,
        blocked_id: &str,
        blocker_id: &str,
        dep_type: DependencyType,
    ) -> Result<bool> {
        Ok(self.get_dependency(blocked_id, blocker_id, dep_type)?.is_some())
    }

    /// How many edges `id` waits on.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn count_dependencies(&self, id: &str) -> Result<usize> {
        let count: i64 = self.backend().conn()?.query_row(
            "SELECT count(*) FROM dependencies WHERE blocked_id = ?",
            [id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// How many edges wait on `id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn count_dependents(&self, id: &str) -> Result<usize> {
        let count: i64 = self.backend().conn()?.query_row(
            "SELECT count(*) FROM dependencies WHERE blocker_id = ?",
            [id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Dependencies for many waiters in one query, keyed by waiter id.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn dependencies_for_many(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<Dependency>>> {
        let mut map: HashMap<String, Vec<Dependency>> = HashMap::new();
        if ids.is_empty() {
            return Ok(map);
        }
        let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
        let sql = format!(
            "SELECT {DEP_COLUMNS} FROM dependencies
             WHERE blocked_id IN ({}) ORDER BY blocked_id, dep_type, blocker_id",
            placeholders.join(",")
        );
        let conn = self.backend().conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let deps = stmt
            .query_map(params.as_slice(), dependency_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for dep in deps.into_iter().map(finish) {
            map.entry(dep.blocked_id.clone()).or_default().push(dep);
        }
        Ok(map)
    }

    /// Remove every edge where `id` is the waiter. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn remove_all_dependencies(&mut self, id: &str, actor: &str) -> Result<usize> {
        let id_owned = id.to_string();
        self.mutate("remove_all_dependencies", actor, move |tx, ctx| {
            let removed =
                tx.execute("DELETE FROM dependencies WHERE blocked_id = ?", [&id_owned])?;
            if removed > 0 {
                ctx.record_event(
                    EventType::DependencyRemoved,
                    &id_owned,
                    Some(json!({ "removed": removed })),
                    None,
                );
                ctx.mark_dirty(&id_owned);
                ctx.touch(CacheTouch::Element(id_owned.clone()));
            }
            Ok(removed)
        })
    }

    /// Remove every edge where `id` is being waited on. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn remove_all_dependents(&mut self, id: &str, actor: &str) -> Result<usize> {
        let id_owned = id.to_string();
        self.mutate("remove_all_dependents", actor, move |tx, ctx| {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT blocked_id FROM dependencies WHERE blocker_id = ?",
            )?;
            let waiters: Vec<String> = stmt
                .query_map([&id_owned], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);

            let removed =
                tx.execute("DELETE FROM dependencies WHERE blocker_id = ?", [&id_owned])?;
            if removed > 0 {
                ctx.record_event(
                    EventType::DependencyRemoved,
                    &id_owned,
                    Some(json!({ "removed": removed })),
                    None,
                );
                for waiter in waiters {
                    ctx.mark_dirty(&waiter);
                    ctx.touch(CacheTouch::Element(waiter));
                }
            }
            Ok(removed)
        })
    }
}
