//! Effective priority and aggregate complexity, derived from the blocking
//! sub-graph.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};

use rusqlite::Connection;

use crate::engine::Workspace;
use crate::error::{Result, StoneforgeError};
use crate::model::{ElementKind, Payload};

/// Traversal options shared by both derivations.
#[derive(Debug, Clone, Copy)]
pub struct PriorityOptions {
    pub max_depth: usize,
    pub include_complexity: bool,
}

impl Default for PriorityOptions {
    fn default() -> Self {
        Self {
            max_depth: 10,
            include_complexity: false,
        }
    }
}

/// A task's priority after urgency inherited from its dependents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePriority {
    pub element_id: String,
    pub base_priority: i32,
    pub effective_priority: i32,
    /// Transitively dependent tasks more urgent than the base, most urgent
    /// first.
    pub dependent_influencers: Vec<String>,
    pub is_influenced: bool,
}

/// One task's contribution to an aggregate-complexity total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexityContribution {
    pub element_id: String,
    pub complexity: i32,
}

/// A task's complexity plus everything it transitively waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateComplexity {
    pub element_id: String,
    pub base_complexity: i32,
    pub total_complexity: i32,
    pub contributors: Vec<ComplexityContribution>,
}

struct TaskLite {
    priority: i32,
    complexity: i32,
    completed: bool,
    deleted: bool,
}

fn load_task_lite(conn: &Connection, id: &str) -> Result<Option<TaskLite>> {
    use rusqlite::OptionalExtension;
    let lite = conn
        .query_row(
            "SELECT priority, complexity, status, deleted_at IS NOT NULL
             FROM elements WHERE id = ? AND kind = 'task'",
            [id],
            |row| {
                Ok(TaskLite {
                    priority: row.get::<_, Option<i32>>(0)?.unwrap_or(3),
                    complexity: row.get::<_, Option<i32>>(1)?.unwrap_or(1),
                    completed: matches!(
                        row.get::<_, Option<String>>(2)?.as_deref(),
                        Some("closed" | "tombstone")
                    ),
                    deleted: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(lite)
}

/// Walk `blocks` edges from `start`, one hop per depth level, yielding the
/// ids reached. `toward_dependents` walks waiters; otherwise prerequisites.
fn walk_blocks(
    conn: &Connection,
    start: &str,
    max_depth: usize,
    toward_dependents: bool,
) -> Result<Vec<String>> {
    let sql = if toward_dependents {
        "SELECT blocked_id FROM dependencies WHERE blocker_id = ? AND dep_type = 'blocks'
         ORDER BY blocked_id"
    } else {
        "SELECT blocker_id FROM dependencies WHERE blocked_id = ? AND dep_type = 'blocks'
         ORDER BY blocker_id"
    };
    let mut stmt = conn.prepare(sql)?;

    let mut reached = Vec::new();
    let mut visited: HashSet<String> = HashSet::from([start.to_string()]);
    let mut queue: VecDeque<(String, usize)> = VecDeque::from([(start.to_string(), 0)]);

    while let Some((current, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        let nexts: Vec<String> = stmt
            .query_map([current.as_str()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for next in nexts {
            if visited.insert(next.clone()) {
                reached.push(next.clone());
                queue.push_back((next, depth + 1));
            }
        }
    }

    Ok(reached)
}

impl Workspace {
    /// Effective priority of a task: the minimum of its own priority and
    /// the priority of every task transitively depending on it via `blocks`.
    ///
    /// # Errors
    ///
    /// Returns `ElementNotFound` for a missing id and a validation error
    /// for non-tasks.
    pub fn effective_priority(
        &self,
        id: &str,
        options: &PriorityOptions,
    ) -> Result<EffectivePriority> {
        let conn = self.backend().conn()?;
        let element = self
            .get_element(id)?
            .ok_or_else(|| StoneforgeError::ElementNotFound { id: id.to_string() })?;
        if element.kind != ElementKind::Task {
            return Err(StoneforgeError::validation(format!("{id} is not a task")));
        }
        let Payload::Task(task) = &element.payload else {
            return Err(StoneforgeError::validation(format!("{id} is not a task")));
        };

        let base = task.priority.0;
        let mut effective = base;
        let mut influencers: Vec<(i32, String)> = Vec::new();

        for dependent_id in walk_blocks(conn, id, options.max_depth, true)? {
            let Some(dependent) = load_task_lite(conn, &dependent_id)? else {
                continue;
            };
            if dependent.deleted || dependent.completed {
                continue;
            }
            effective = effective.min(dependent.priority);
            if dependent.priority < base {
                influencers.push((dependent.priority, dependent_id));
            }
        }

        influencers.sort();
        Ok(EffectivePriority {
            element_id: id.to_string(),
            base_priority: base,
            effective_priority: effective,
            is_influenced: effective < base,
            dependent_influencers: influencers.into_iter().map(|(_, id)| id).collect(),
        })
    }

    /// Bulk form of [`Self::effective_priority`]; unknown or non-task ids
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn effective_priorities(
        &self,
        ids: &[String],
        options: &PriorityOptions,
    ) -> Result<Vec<EffectivePriority>> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            match self.effective_priority(id, options) {
                Ok(result) => results.push(result),
                Err(
                    StoneforgeError::ElementNotFound { .. } | StoneforgeError::Validation { .. },
                ) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    /// Aggregate complexity: the task's own complexity plus the complexity
    /// of every task it transitively waits on via `blocks`.
    ///
    /// # Errors
    ///
    /// Returns `ElementNotFound` for a missing id and a validation error
    /// for non-tasks.
    pub fn aggregate_complexity(
        &self,
        id: &str,
        options: &PriorityOptions,
    ) -> Result<AggregateComplexity> {
        let conn = self.backend().conn()?;
        let base = load_task_lite(conn, id)?
            .ok_or_else(|| StoneforgeError::ElementNotFound { id: id.to_string() })?;
        if base.deleted {
            return Err(StoneforgeError::ElementNotFound { id: id.to_string() });
        }

        let mut total = base.complexity;
        let mut contributors = Vec::new();

        for blocker_id in walk_blocks(conn, id, options.max_depth, false)? {
            let Some(blocker) = load_task_lite(conn, &blocker_id)? else {
                continue;
            };
            if blocker.deleted || blocker.completed {
                continue;
            }
            total += blocker.complexity;
            contributors.push(ComplexityContribution {
                element_id: blocker_id,
                complexity: blocker.complexity,
            });
        }

        Ok(AggregateComplexity {
            element_id: id.to_string(),
            base_complexity: base.complexity,
            total_complexity: total,
            contributors,
        })
    }
}

/// Order by effective priority ascending, then base priority ascending,
/// then id for stability.
pub fn sort_by_effective_priority(results: &mut [EffectivePriority]) {
    results.sort_by(|a, b| {
        match a.effective_priority.cmp(&b.effective_priority) {
            Ordering::Equal => {}
            other => return other,
        }
        match a.base_priority.cmp(&b.base_priority) {
            Ordering::Equal => {}
            other => return other,
        }
        a.element_id.cmp(&b.element_id)
    });
}
