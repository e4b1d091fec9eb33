//! Data types for workspace elements, dependencies, gates, and events.
//!
//! Every stored entity shares the [`Element`] row shape; the type-specific
//! fields live in a [`Payload`] variant per element kind. Payloads are parsed
//! strictly at the store boundary and unknown fields are preserved for
//! forward compatibility.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoneforgeError};

/// Closed set of element discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Task,
    Message,
    Document,
    Entity,
    Plan,
    Workflow,
    Playbook,
    Channel,
    Library,
    Team,
}

impl ElementKind {
    pub const ALL: [Self; 10] = [
        Self::Task,
        Self::Message,
        Self::Document,
        Self::Entity,
        Self::Plan,
        Self::Workflow,
        Self::Playbook,
        Self::Channel,
        Self::Library,
        Self::Team,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Message => "message",
            Self::Document => "document",
            Self::Entity => "entity",
            Self::Plan => "plan",
            Self::Workflow => "workflow",
            Self::Playbook => "playbook",
            Self::Channel => "channel",
            Self::Library => "library",
            Self::Team => "team",
        }
    }

    /// Identifier prefix: `en-` for entities, `el-` for everything else.
    #[must_use]
    pub const fn id_prefix(self) -> &'static str {
        match self {
            Self::Entity => "en",
            _ => "el",
        }
    }
}

impl FromStr for ElementKind {
    type Err = StoneforgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StoneforgeError::validation(format!("unknown element kind: {s}")))
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle states. `Blocked` is derived: only the blocked cache
/// writes it, and transitions out of it restore the cached previous status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Deferred,
    Backlog,
    Review,
    Closed,
    Tombstone,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Deferred => "deferred",
            Self::Backlog => "backlog",
            Self::Review => "review",
            Self::Closed => "closed",
            Self::Tombstone => "tombstone",
        }
    }

    /// Whether this status counts as completed for blocking purposes.
    #[must_use]
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Closed | Self::Tombstone)
    }

    /// Explicit user transitions. `Blocked` is never a valid target here;
    /// out of `Blocked` only a direct close is permitted, everything else
    /// goes through the cache restoring the previous status.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        if matches!(to, Self::Blocked | Self::Tombstone) {
            return false;
        }
        match self {
            Self::Open => matches!(
                to,
                Self::Open | Self::InProgress | Self::Closed | Self::Deferred | Self::Backlog
            ),
            Self::InProgress => matches!(
                to,
                Self::Open | Self::InProgress | Self::Review | Self::Closed | Self::Deferred
            ),
            Self::Review => {
                matches!(to, Self::Open | Self::InProgress | Self::Review | Self::Closed)
            }
            Self::Closed => matches!(to, Self::Open | Self::Closed),
            Self::Deferred | Self::Backlog => {
                matches!(to, Self::Open | Self::Deferred | Self::Backlog)
            }
            Self::Blocked => matches!(to, Self::Closed),
            Self::Tombstone => false,
        }
    }
}

impl FromStr for TaskStatus {
    type Err = StoneforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "deferred" => Ok(Self::Deferred),
            "backlog" => Ok(Self::Backlog),
            "review" => Ok(Self::Review),
            "closed" => Ok(Self::Closed),
            "tombstone" => Ok(Self::Tombstone),
            _ => Err(StoneforgeError::validation(format!(
                "unknown task status: {s}"
            ))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan lifecycle states. Plans are task collections, not blocking parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    Active,
    Completed,
    Cancelled,
}

impl PlanStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// draft <-> active, active -> completed <-> active (reopen),
    /// * -> cancelled, cancelled -> draft (restart).
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        match self {
            Self::Draft => matches!(to, Self::Active | Self::Cancelled),
            Self::Active => matches!(to, Self::Draft | Self::Completed | Self::Cancelled),
            Self::Completed => matches!(to, Self::Active | Self::Cancelled),
            Self::Cancelled => matches!(to, Self::Draft),
        }
    }
}

impl FromStr for PlanStatus {
    type Err = StoneforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(StoneforgeError::validation(format!(
                "unknown plan status: {s}"
            ))),
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority, 1..=5 with 1 the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub i32);

impl Priority {
    pub const MIN: i32 = 1;
    pub const MAX: i32 = 5;
    pub const DEFAULT: Self = Self(3);

    /// # Errors
    ///
    /// Returns a validation error when outside 1..=5.
    pub fn validated(value: i32) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(StoneforgeError::validation(format!(
                "priority must be in {}..={}, got {value}",
                Self::MIN,
                Self::MAX
            )))
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Task complexity, 1..=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Complexity(pub i32);

impl Complexity {
    pub const MIN: i32 = 1;
    pub const MAX: i32 = 5;
    pub const DEFAULT: Self = Self(1);

    /// # Errors
    ///
    /// Returns a validation error when outside 1..=5.
    pub fn validated(value: i32) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(StoneforgeError::validation(format!(
                "complexity must be in {}..={}, got {value}",
                Self::MIN,
                Self::MAX
            )))
        }
    }
}

impl Default for Complexity {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Task-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskPayload {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Open,
            priority: Priority::DEFAULT,
            complexity: Complexity::DEFAULT,
            assignee: None,
            parent: None,
            extra: Map::new(),
        }
    }
}

/// Plan-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPayload {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PlanPayload {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            status: PlanStatus::Draft,
            completed_at: None,
            cancelled_at: None,
            extra: Map::new(),
        }
    }
}

/// Document: content-addressed text body with a monotonic version counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPayload {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_document_version")]
    pub version: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn default_document_version() -> i64 {
    1
}

impl DocumentPayload {
    #[must_use]
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            version: 1,
            extra: Map::new(),
        }
    }
}

/// Message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Entity payload (people, systems, external actors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Catch-all payload for kinds whose fields the engine does not interpret
/// (workflow, playbook, channel, library, team).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed payload, one variant per element kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Task(TaskPayload),
    Message(MessagePayload),
    Document(DocumentPayload),
    Entity(EntityPayload),
    Plan(PlanPayload),
    Workflow(GenericPayload),
    Playbook(GenericPayload),
    Channel(GenericPayload),
    Library(GenericPayload),
    Team(GenericPayload),
}

impl Payload {
    #[must_use]
    pub const fn kind(&self) -> ElementKind {
        match self {
            Self::Task(_) => ElementKind::Task,
            Self::Message(_) => ElementKind::Message,
            Self::Document(_) => ElementKind::Document,
            Self::Entity(_) => ElementKind::Entity,
            Self::Plan(_) => ElementKind::Plan,
            Self::Workflow(_) => ElementKind::Workflow,
            Self::Playbook(_) => ElementKind::Playbook,
            Self::Channel(_) => ElementKind::Channel,
            Self::Library(_) => ElementKind::Library,
            Self::Team(_) => ElementKind::Team,
        }
    }

    /// Parse the stored JSON for the given kind.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the JSON does not match the kind's
    /// payload shape.
    pub fn from_json(kind: ElementKind, json: &str) -> Result<Self> {
        let parse = |e: serde_json::Error| {
            StoneforgeError::validation(format!("invalid {kind} payload: {e}"))
        };
        Ok(match kind {
            ElementKind::Task => Self::Task(serde_json::from_str(json).map_err(parse)?),
            ElementKind::Message => Self::Message(serde_json::from_str(json).map_err(parse)?),
            ElementKind::Document => Self::Document(serde_json::from_str(json).map_err(parse)?),
            ElementKind::Entity => Self::Entity(serde_json::from_str(json).map_err(parse)?),
            ElementKind::Plan => Self::Plan(serde_json::from_str(json).map_err(parse)?),
            ElementKind::Workflow => Self::Workflow(serde_json::from_str(json).map_err(parse)?),
            ElementKind::Playbook => Self::Playbook(serde_json::from_str(json).map_err(parse)?),
            ElementKind::Channel => Self::Channel(serde_json::from_str(json).map_err(parse)?),
            ElementKind::Library => Self::Library(serde_json::from_str(json).map_err(parse)?),
            ElementKind::Team => Self::Team(serde_json::from_str(json).map_err(parse)?),
        })
    }

    /// Serialize to the stored JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            Self::Task(p) => serde_json::to_value(p),
            Self::Message(p) => serde_json::to_value(p),
            Self::Document(p) => serde_json::to_value(p),
            Self::Entity(p) => serde_json::to_value(p),
            Self::Plan(p) => serde_json::to_value(p),
            Self::Workflow(p)
            | Self::Playbook(p)
            | Self::Channel(p)
            | Self::Library(p)
            | Self::Team(p) => serde_json::to_value(p),
        }?;
        Ok(value)
    }

    #[must_use]
    pub const fn as_task(&self) -> Option<&TaskPayload> {
        match self {
            Self::Task(p) => Some(p),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_plan(&self) -> Option<&PlanPayload> {
        match self {
            Self::Plan(p) => Some(p),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_document(&self) -> Option<&DocumentPayload> {
        match self {
            Self::Document(p) => Some(p),
            _ => None,
        }
    }

    /// Status string projected into the `status` column, if this kind has one.
    #[must_use]
    pub const fn status_str(&self) -> Option<&'static str> {
        match self {
            Self::Task(p) => Some(p.status.as_str()),
            Self::Plan(p) => Some(p.status.as_str()),
            _ => None,
        }
    }
}

/// The universal stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub id: String,
    pub kind: ElementKind,
    pub payload: Payload,
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Loaded from the side relation; empty unless the caller asked for tags.
    pub tags: Vec<String>,
}

impl Element {
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    #[must_use]
    pub fn task_status(&self) -> Option<TaskStatus> {
        self.payload.as_task().map(|t| t.status)
    }

    #[must_use]
    pub fn plan_status(&self) -> Option<PlanStatus> {
        self.payload.as_plan().map(|p| p.status)
    }

    /// Whether this element counts as completed for blocking purposes.
    /// Soft-deleted elements and unknown kinds count as completed.
    #[must_use]
    pub fn is_completed_for_blocking(&self) -> bool {
        if self.is_deleted() {
            return true;
        }
        match &self.payload {
            Payload::Task(t) => t.status.is_completed(),
            Payload::Plan(p) => p.status.is_completed(),
            _ => false,
        }
    }
}

/// Directed dependency edge types. `blocked_id` is the waiter, `blocker_id`
/// the thing being waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyType {
    Blocks,
    ParentChild,
    Awaits,
    RelatesTo,
    References,
    Supersedes,
    Duplicates,
    CausedBy,
    Validates,
    AuthoredBy,
    AssignedTo,
    ApprovedBy,
    RepliesTo,
}

impl DependencyType {
    pub const ALL: [Self; 13] = [
        Self::Blocks,
        Self::ParentChild,
        Self::Awaits,
        Self::RelatesTo,
        Self::References,
        Self::Supersedes,
        Self::Duplicates,
        Self::CausedBy,
        Self::Validates,
        Self::AuthoredBy,
        Self::AssignedTo,
        Self::ApprovedBy,
        Self::RepliesTo,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::ParentChild => "parent-child",
            Self::Awaits => "awaits",
            Self::RelatesTo => "relates-to",
            Self::References => "references",
            Self::Supersedes => "supersedes",
            Self::Duplicates => "duplicates",
            Self::CausedBy => "caused-by",
            Self::Validates => "validates",
            Self::AuthoredBy => "authored-by",
            Self::AssignedTo => "assigned-to",
            Self::ApprovedBy => "approved-by",
            Self::RepliesTo => "replies-to",
        }
    }

    /// Blocking edges participate in cycle detection and the blocked cache.
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::Blocks | Self::ParentChild | Self::Awaits)
    }

    /// Only relates-to is stored canonically (smaller id as `blocked_id`).
    #[must_use]
    pub const fn is_symmetric(self) -> bool {
        matches!(self, Self::RelatesTo)
    }
}

impl FromStr for DependencyType {
    type Err = StoneforgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StoneforgeError::validation(format!("unknown dependency type: {s}")))
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate kinds attached to `awaits` edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateType {
    Timer,
    Approval,
    External,
    Webhook,
}

impl GateType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Approval => "approval",
            Self::External => "external",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Satisfaction rule for an `awaits` edge, stored in edge metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSpec {
    pub gate_type: GateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_approvers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub current_approvers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satisfied: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satisfied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satisfied_by: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GateSpec {
    #[must_use]
    pub fn timer(wait_until: DateTime<Utc>) -> Self {
        Self {
            gate_type: GateType::Timer,
            wait_until: Some(wait_until),
            required_approvers: Vec::new(),
            approval_count: None,
            current_approvers: Vec::new(),
            satisfied: None,
            satisfied_at: None,
            satisfied_by: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn approval(required_approvers: Vec<String>, approval_count: Option<u32>) -> Self {
        Self {
            gate_type: GateType::Approval,
            wait_until: None,
            required_approvers,
            approval_count,
            current_approvers: Vec::new(),
            satisfied: None,
            satisfied_at: None,
            satisfied_by: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn external(gate_type: GateType) -> Self {
        Self {
            gate_type,
            wait_until: None,
            required_approvers: Vec::new(),
            approval_count: None,
            current_approvers: Vec::new(),
            satisfied: None,
            satisfied_at: None,
            satisfied_by: None,
            extra: Map::new(),
        }
    }

    /// Validate type-appropriate fields at edge creation.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed gate.
    pub fn validate(&self) -> Result<()> {
        match self.gate_type {
            GateType::Timer => {
                if self.wait_until.is_none() {
                    return Err(StoneforgeError::validation(
                        "timer gate requires waitUntil",
                    ));
                }
            }
            GateType::Approval => {
                if self.required_approvers.is_empty() {
                    return Err(StoneforgeError::validation(
                        "approval gate requires requiredApprovers",
                    ));
                }
                let needed = self.needed_approvals();
                if needed == 0 || needed as usize > self.required_approvers.len() {
                    return Err(StoneforgeError::validation(format!(
                        "approvalCount {needed} out of range for {} approvers",
                        self.required_approvers.len()
                    )));
                }
            }
            GateType::External | GateType::Webhook => {}
        }
        Ok(())
    }

    /// Number of approvals needed to satisfy an approval gate.
    #[must_use]
    pub fn needed_approvals(&self) -> u32 {
        self.approval_count
            .unwrap_or(u32::try_from(self.required_approvers.len()).unwrap_or(u32::MAX))
    }

    /// Pure satisfaction check given the wall clock.
    #[must_use]
    pub fn is_satisfied(&self, now: DateTime<Utc>) -> bool {
        match self.gate_type {
            GateType::Timer => self.wait_until.is_some_and(|t| t <= now),
            GateType::Approval => {
                let valid = self
                    .current_approvers
                    .iter()
                    .filter(|a| self.required_approvers.contains(a))
                    .count();
                valid >= self.needed_approvals() as usize
            }
            GateType::External | GateType::Webhook => self.satisfied == Some(true),
        }
    }
}

/// Typed metadata bag carried on dependency edges.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyMetadata {
    /// Present on `awaits` edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSpec>,
    /// Present on `validates` edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DependencyMetadata {
    #[must_use]
    pub fn with_gate(gate: GateSpec) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gate.is_none()
            && self.test_type.is_none()
            && self.result.is_none()
            && self.extra.is_empty()
    }
}

/// A stored dependency edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub blocked_id: String,
    pub blocker_id: String,
    pub dep_type: DependencyType,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub metadata: DependencyMetadata,
}

/// Closed set of audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    StatusChanged,
    Deleted,
    DependencyAdded,
    DependencyRemoved,
    GateSatisfied,
    ApprovalRecorded,
    ApprovalRemoved,
    TagAdded,
    TagRemoved,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::StatusChanged => "status_changed",
            Self::Deleted => "deleted",
            Self::DependencyAdded => "dependency_added",
            Self::DependencyRemoved => "dependency_removed",
            Self::GateSatisfied => "gate_satisfied",
            Self::ApprovalRecorded => "approval_recorded",
            Self::ApprovalRemoved => "approval_removed",
            Self::TagAdded => "tag_added",
            Self::TagRemoved => "tag_removed",
        }
    }
}

impl FromStr for EventType {
    type Err = StoneforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "status_changed" => Ok(Self::StatusChanged),
            "deleted" => Ok(Self::Deleted),
            "dependency_added" => Ok(Self::DependencyAdded),
            "dependency_removed" => Ok(Self::DependencyRemoved),
            "gate_satisfied" => Ok(Self::GateSatisfied),
            "approval_recorded" => Ok(Self::ApprovalRecorded),
            "approval_removed" => Ok(Self::ApprovalRemoved),
            "tag_added" => Ok(Self::TagAdded),
            "tag_removed" => Ok(Self::TagRemoved),
            _ => Err(StoneforgeError::validation(format!(
                "unknown event type: {s}"
            ))),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub element_id: String,
    pub event_type: EventType,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// One row of the derived blocked cache.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedEntry {
    pub element_id: String,
    pub blocked_by: String,
    pub reason: String,
    pub previous_status: Option<TaskStatus>,
    pub blocked_at: DateTime<Utc>,
}
