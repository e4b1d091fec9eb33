//! `stoneforge` - local-first workspace engine
//!
//! This crate is the core engine of a local-first workspace for tasks,
//! plans, documents, messages, and playbooks, persisted in a single
//! embedded `SQLite` store. CLIs, servers, and sync providers build on it.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`model`] - Data types (elements, payloads, dependencies, gates, events)
//! - [`storage`] - `SQLite` backend, versioned migrations, event log
//! - [`engine`] - The [`Workspace`]: element CRUD, dependency graph,
//!   blocked cache, gates, priority derivations
//! - [`id`] - Deterministic hashed identifiers with adaptive length
//! - [`hash`] - Canonical-JSON content hashing
//! - [`sync`] - External task-sync adapter contract
//! - [`error`] - Error types and handling
//! - [`logging`] - tracing initialization

#![forbid(unsafe_code)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod engine;
pub mod error;
pub mod hash;
pub mod id;
pub mod logging;
pub mod model;
pub mod storage;
pub mod sync;

pub use engine::Workspace;
pub use engine::blocked::{ApprovalOutcome, RebuildReport};
pub use engine::deps::CycleCheck;
pub use engine::elements::ElementFilter;
pub use engine::priority::{AggregateComplexity, EffectivePriority, PriorityOptions};
pub use error::{ErrorCode, Result, StoneforgeError};
pub use model::{
    BlockedEntry, Complexity, Dependency, DependencyMetadata, DependencyType, Element,
    ElementKind, Event, EventType, GateSpec, GateType, Payload, PlanStatus, Priority, TaskStatus,
};
