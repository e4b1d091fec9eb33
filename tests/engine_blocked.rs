//! Blocked-cache tests: blocking semantics, gates, status mirroring,
//! incremental invalidation, and rebuild equivalence.
//!
//! Real `SQLite`, no mocks.

mod common;

use chrono::{Duration, Utc};
use common::{fixtures, test_db};
use stoneforge::model::{DependencyMetadata, EventType, GateSpec, GateType};
use stoneforge::{BlockedEntry, DependencyType, PlanStatus, StoneforgeError, TaskStatus};

fn blocks(ws: &mut stoneforge::Workspace, blocked: &str, blocker: &str) {
    ws.add_dependency(blocked, blocker, DependencyType::Blocks, "tester", None)
        .unwrap();
}

fn snapshot(ws: &stoneforge::Workspace) -> Vec<(String, String, String)> {
    ws.all_blocked()
        .unwrap()
        .into_iter()
        .map(|e| (e.element_id, e.blocked_by, e.reason))
        .collect()
}

// ============================================================================
// BLOCKS EDGE SEMANTICS
// ============================================================================

#[test]
fn open_blocker_blocks_waiter() {
    let mut ws = test_db();
    let blocker = fixtures::create_task(&mut ws, "blocker");
    let waiter = fixtures::create_task(&mut ws, "waiter");

    blocks(&mut ws, &waiter.id, &blocker.id);

    let entry = ws.is_blocked(&waiter.id).unwrap().expect("blocked");
    assert_eq!(entry.blocked_by, blocker.id);
    assert!(entry.reason.contains("blocks"));
    assert_eq!(ws.blocked_count().unwrap(), 1);
    assert_eq!(ws.blocked_by(&blocker.id).unwrap(), vec![waiter.id.clone()]);
}

#[test]
fn completed_blocker_does_not_block() {
    let mut ws = test_db();
    let blocker = fixtures::create_task(&mut ws, "done blocker");
    ws.update_task_status(&blocker.id, TaskStatus::Closed, "tester")
        .unwrap();
    let waiter = fixtures::create_task(&mut ws, "free waiter");

    blocks(&mut ws, &waiter.id, &blocker.id);
    assert!(ws.is_blocked(&waiter.id).unwrap().is_none());
}

#[test]
fn missing_or_deleted_blocker_counts_as_completed() {
    let mut ws = test_db();
    let waiter = fixtures::create_task(&mut ws, "external waiter");
    blocks(&mut ws, &waiter.id, "el-0ff0");
    assert!(ws.is_blocked(&waiter.id).unwrap().is_none());

    let blocker = fixtures::create_task(&mut ws, "to be deleted");
    let waiter2 = fixtures::create_task(&mut ws, "second waiter");
    blocks(&mut ws, &waiter2.id, &blocker.id);
    assert!(ws.is_blocked(&waiter2.id).unwrap().is_some());

    ws.soft_delete_element(&blocker.id, "tester").unwrap();
    assert!(ws.is_blocked(&waiter2.id).unwrap().is_none());
}

#[test]
fn closing_blocker_unblocks_waiter_and_restores_status() {
    let mut ws = test_db();
    let blocker = fixtures::create_task(&mut ws, "gate task");
    let waiter = fixtures::create_task(&mut ws, "patient task");
    ws.update_task_status(&waiter.id, TaskStatus::InProgress, "tester")
        .unwrap();

    blocks(&mut ws, &waiter.id, &blocker.id);

    // Status mirroring: the waiter's live status becomes blocked and the
    // previous status is retained in the cache row.
    let live = ws.get_element(&waiter.id).unwrap().unwrap();
    assert_eq!(live.task_status(), Some(TaskStatus::Blocked));
    let entry = ws.is_blocked(&waiter.id).unwrap().unwrap();
    assert_eq!(entry.previous_status, Some(TaskStatus::InProgress));

    ws.update_task_status(&blocker.id, TaskStatus::Closed, "tester")
        .unwrap();

    assert!(ws.is_blocked(&waiter.id).unwrap().is_none());
    let restored = ws.get_element(&waiter.id).unwrap().unwrap();
    assert_eq!(restored.task_status(), Some(TaskStatus::InProgress));
}

#[test]
fn reopening_blocker_reblocks_waiter() {
    let mut ws = test_db();
    let blocker = fixtures::create_task(&mut ws, "flapper");
    ws.update_task_status(&blocker.id, TaskStatus::Closed, "tester")
        .unwrap();
    let waiter = fixtures::create_task(&mut ws, "reblocked");
    blocks(&mut ws, &waiter.id, &blocker.id);
    assert!(ws.is_blocked(&waiter.id).unwrap().is_none());

    ws.update_task_status(&blocker.id, TaskStatus::Open, "tester")
        .unwrap();
    assert!(ws.is_blocked(&waiter.id).unwrap().is_some());
}

// ============================================================================
// PARENT-CHILD SEMANTICS
// ============================================================================

#[test]
fn child_blocked_while_task_parent_incomplete() {
    let mut ws = test_db();
    let parent = fixtures::create_task(&mut ws, "parent task");
    let child = fixtures::create_task(&mut ws, "child task");

    ws.add_dependency(&child.id, &parent.id, DependencyType::ParentChild, "tester", None)
        .unwrap();

    let entry = ws.is_blocked(&child.id).unwrap().expect("blocked by parent");
    assert_eq!(entry.blocked_by, parent.id);
    assert!(entry.reason.contains("parent not completed"));

    ws.update_task_status(&parent.id, TaskStatus::Closed, "tester")
        .unwrap();
    assert!(ws.is_blocked(&child.id).unwrap().is_none());
}

#[test]
fn plan_parent_status_alone_never_blocks() {
    let mut ws = test_db();
    let plan = fixtures::create(&mut ws, fixtures::plan("parent plan", PlanStatus::Draft));
    let child = fixtures::create_task(&mut ws, "plan member");

    ws.add_dependency(&child.id, &plan.id, DependencyType::ParentChild, "tester", None)
        .unwrap();
    assert!(
        ws.is_blocked(&child.id).unwrap().is_none(),
        "a draft plan parent does not block"
    );
}

#[test]
fn cascade_block_and_unblock_through_plan_chain() {
    // Scenario S1: Plan X waits on Plan Y; Task A lives under Plan X.
    let mut ws = test_db();
    let plan_x = fixtures::create(&mut ws, fixtures::plan("Plan X", PlanStatus::Active));
    let plan_y = fixtures::create(&mut ws, fixtures::plan("Plan Y", PlanStatus::Active));
    let task_a = fixtures::create_task(&mut ws, "Task A");

    ws.add_dependency(&task_a.id, &plan_x.id, DependencyType::ParentChild, "tester", None)
        .unwrap();
    blocks(&mut ws, &plan_x.id, &plan_y.id);

    let x_entry = ws.is_blocked(&plan_x.id).unwrap().expect("plan X blocked");
    assert_eq!(x_entry.blocked_by, plan_y.id);
    assert!(x_entry.reason.contains("blocks"));

    let a_entry = ws.is_blocked(&task_a.id).unwrap().expect("task A blocked");
    assert_eq!(a_entry.blocked_by, plan_x.id);
    assert!(a_entry.reason.contains("parent is blocked"));

    // Plan Y completes: the whole chain unblocks.
    ws.update_plan_status(&plan_y.id, PlanStatus::Completed, "tester")
        .unwrap();

    assert!(ws.is_blocked(&plan_x.id).unwrap().is_none());
    assert!(ws.is_blocked(&task_a.id).unwrap().is_none());
    let task_a_live = ws.get_element(&task_a.id).unwrap().unwrap();
    assert_eq!(task_a_live.task_status(), Some(TaskStatus::Open));
}

#[test]
fn grandchild_cascade_depth_two() {
    let mut ws = test_db();
    let blocker = fixtures::create_task(&mut ws, "root blocker");
    let parent = fixtures::create_task(&mut ws, "middle parent");
    let child = fixtures::create_task(&mut ws, "leaf child");

    ws.add_dependency(&child.id, &parent.id, DependencyType::ParentChild, "tester", None)
        .unwrap();
    // Child is already blocked: its parent task is not completed.
    assert!(
        ws.is_blocked(&child.id)
            .unwrap()
            .unwrap()
            .reason
            .contains("parent not completed")
    );

    blocks(&mut ws, &parent.id, &blocker.id);
    // Reason upgrades to the cascade.
    let entry = ws.is_blocked(&child.id).unwrap().unwrap();
    assert!(entry.reason.contains("parent is blocked"));

    ws.update_task_status(&blocker.id, TaskStatus::Closed, "tester")
        .unwrap();
    let entry = ws.is_blocked(&child.id).unwrap().unwrap();
    assert!(entry.reason.contains("parent not completed"));
}

// ============================================================================
// GATES
// ============================================================================

#[test]
fn timer_gate_blocks_until_the_deadline() {
    let mut ws = test_db();
    let waiter = fixtures::create_task(&mut ws, "timed");
    let clock = fixtures::create_task(&mut ws, "clock");

    let gate = GateSpec::timer(Utc::now() + Duration::hours(2));
    ws.add_dependency(
        &waiter.id,
        &clock.id,
        DependencyType::Awaits,
        "tester",
        Some(DependencyMetadata::with_gate(gate)),
    )
    .unwrap();

    let entry = ws.is_blocked(&waiter.id).unwrap().expect("timer blocks");
    assert!(entry.reason.contains("timer"));

    // An expired timer gate no longer blocks once re-evaluated.
    let expired = GateSpec::timer(Utc::now() - Duration::hours(1));
    ws.remove_dependency(&waiter.id, &clock.id, DependencyType::Awaits, "tester")
        .unwrap();
    ws.add_dependency(
        &waiter.id,
        &clock.id,
        DependencyType::Awaits,
        "tester",
        Some(DependencyMetadata::with_gate(expired)),
    )
    .unwrap();
    assert!(ws.is_blocked(&waiter.id).unwrap().is_none());
}

#[test]
fn approval_gate_lifecycle() {
    // Scenario S3: three possible approvers, two needed.
    let mut ws = test_db();
    let t = fixtures::create_task(&mut ws, "T");
    let g = fixtures::create_task(&mut ws, "G");

    let gate = GateSpec::approval(
        vec!["u1".to_string(), "u2".to_string(), "u3".to_string()],
        Some(2),
    );
    ws.add_dependency(
        &t.id,
        &g.id,
        DependencyType::Awaits,
        "tester",
        Some(DependencyMetadata::with_gate(gate)),
    )
    .unwrap();
    assert!(ws.is_blocked(&t.id).unwrap().is_some());

    let first = ws.record_approval(&t.id, &g.id, "u1").unwrap();
    assert!(first.success);
    assert_eq!(first.current_count, 1);
    assert_eq!(first.required_count, 2);
    assert!(!first.satisfied);
    assert!(ws.is_blocked(&t.id).unwrap().is_some(), "still blocked");

    let second = ws.record_approval(&t.id, &g.id, "u3").unwrap();
    assert_eq!(second.current_count, 2);
    assert!(second.satisfied);
    assert!(ws.is_blocked(&t.id).unwrap().is_none(), "threshold crossed");

    let removed = ws.remove_approval(&t.id, &g.id, "u3").unwrap();
    assert_eq!(removed.current_count, 1);
    assert!(!removed.satisfied);
    assert!(ws.is_blocked(&t.id).unwrap().is_some(), "re-blocked");
}

#[test]
fn approval_rejects_outsiders_and_is_idempotent() {
    let mut ws = test_db();
    let t = fixtures::create_task(&mut ws, "approve-t");
    let g = fixtures::create_task(&mut ws, "approve-g");
    let gate = GateSpec::approval(vec!["u1".to_string(), "u2".to_string()], Some(2));
    ws.add_dependency(
        &t.id,
        &g.id,
        DependencyType::Awaits,
        "tester",
        Some(DependencyMetadata::with_gate(gate)),
    )
    .unwrap();

    let err = ws.record_approval(&t.id, &g.id, "mallory").unwrap_err();
    assert!(matches!(err, StoneforgeError::Permission { .. }));

    ws.record_approval(&t.id, &g.id, "u1").unwrap();
    let before = ws.events_for(&t.id, 100).unwrap().len();
    let dup = ws.record_approval(&t.id, &g.id, "u1").unwrap();
    assert_eq!(dup.current_count, 1);
    assert_eq!(
        ws.events_for(&t.id, 100).unwrap().len(),
        before,
        "duplicate approval writes no event"
    );
}

#[test]
fn external_gate_satisfaction() {
    let mut ws = test_db();
    let waiter = fixtures::create_task(&mut ws, "external waiter");
    let hook = fixtures::create_task(&mut ws, "external hook");

    ws.add_dependency(
        &waiter.id,
        &hook.id,
        DependencyType::Awaits,
        "tester",
        Some(DependencyMetadata::with_gate(GateSpec::external(
            GateType::External,
        ))),
    )
    .unwrap();
    let entry = ws.is_blocked(&waiter.id).unwrap().expect("blocked by gate");
    assert!(entry.reason.contains("external"));

    assert!(ws.satisfy_gate(&waiter.id, &hook.id, "ci-bot").unwrap());
    assert!(ws.is_blocked(&waiter.id).unwrap().is_none());

    // Idempotent: second call reports success without another event.
    let before = ws.events_for(&waiter.id, 100).unwrap().len();
    assert!(ws.satisfy_gate(&waiter.id, &hook.id, "ci-bot").unwrap());
    assert_eq!(ws.events_for(&waiter.id, 100).unwrap().len(), before);

    let events = ws.events_for(&waiter.id, 100).unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.event_type == EventType::GateSatisfied)
    );
}

#[test]
fn satisfy_gate_rejects_non_applicable_gates() {
    let mut ws = test_db();
    let t = fixtures::create_task(&mut ws, "satisfied-t");
    let g = fixtures::create_task(&mut ws, "satisfied-g");
    let gate = GateSpec::approval(vec!["u1".to_string()], Some(1));
    ws.add_dependency(
        &t.id,
        &g.id,
        DependencyType::Awaits,
        "tester",
        Some(DependencyMetadata::with_gate(gate)),
    )
    .unwrap();

    assert!(!ws.satisfy_gate(&t.id, &g.id, "u1").unwrap(), "approval gate");
    assert!(!ws.satisfy_gate(&t.id, "el-abc", "u1").unwrap(), "missing edge");
}

// ============================================================================
// STATUS MIRRORING & DERIVED-STATUS RULES
// ============================================================================

#[test]
fn blocked_is_never_an_explicit_transition_target() {
    let mut ws = test_db();
    let task = fixtures::create_task(&mut ws, "no manual block");
    let err = ws
        .update_task_status(&task.id, TaskStatus::Blocked, "tester")
        .unwrap_err();
    assert!(matches!(err, StoneforgeError::InvalidTransition { .. }));
}

#[test]
fn blocked_task_can_be_closed_directly() {
    let mut ws = test_db();
    let blocker = fixtures::create_task(&mut ws, "still open");
    let waiter = fixtures::create_task(&mut ws, "abandoned");
    blocks(&mut ws, &waiter.id, &blocker.id);
    assert_eq!(
        ws.get_element(&waiter.id).unwrap().unwrap().task_status(),
        Some(TaskStatus::Blocked)
    );

    // Any other exit from blocked is rejected...
    assert!(
        ws.update_task_status(&waiter.id, TaskStatus::InProgress, "tester")
            .is_err()
    );
    // ...but closing an abandoned task is allowed and clears the cache row.
    ws.update_task_status(&waiter.id, TaskStatus::Closed, "tester")
        .unwrap();
    assert!(ws.is_blocked(&waiter.id).unwrap().is_none());
}

#[test]
fn add_remove_round_trip_restores_state() {
    let mut ws = test_db();
    let blocker = fixtures::create_task(&mut ws, "transient blocker");
    let waiter = fixtures::create_task(&mut ws, "transient waiter");

    let cache_before = snapshot(&ws);
    let events_before = ws.events_for(&waiter.id, 100).unwrap().len();

    blocks(&mut ws, &waiter.id, &blocker.id);
    ws.remove_dependency(&waiter.id, &blocker.id, DependencyType::Blocks, "tester")
        .unwrap();

    assert_eq!(snapshot(&ws), cache_before);
    let waiter_live = ws.get_element(&waiter.id).unwrap().unwrap();
    assert_eq!(waiter_live.task_status(), Some(TaskStatus::Open));
    // Exactly two audit rows were added: the add and the remove.
    assert_eq!(
        ws.events_for(&waiter.id, 100).unwrap().len(),
        events_before + 2
    );
}

// ============================================================================
// REBUILD
// ============================================================================

fn assert_rebuild_matches(ws: &mut stoneforge::Workspace) {
    let incremental = snapshot(ws);
    let report = ws.rebuild_blocked_cache().unwrap();
    let rebuilt = snapshot(ws);
    assert_eq!(
        incremental, rebuilt,
        "rebuild must reproduce the incrementally maintained cache"
    );
    assert_eq!(report.elements_blocked, rebuilt.len());
}

#[test]
fn rebuild_equals_incremental_for_mixed_graph() {
    let mut ws = test_db();
    let plan = fixtures::create(&mut ws, fixtures::plan("umbrella", PlanStatus::Active));
    let root = fixtures::create_task(&mut ws, "root blocker");
    let mid = fixtures::create_task(&mut ws, "mid");
    let leaf = fixtures::create_task(&mut ws, "leaf");
    let solo = fixtures::create_task(&mut ws, "solo");

    blocks(&mut ws, &plan.id, &root.id);
    ws.add_dependency(&mid.id, &plan.id, DependencyType::ParentChild, "tester", None)
        .unwrap();
    ws.add_dependency(&leaf.id, &mid.id, DependencyType::ParentChild, "tester", None)
        .unwrap();
    blocks(&mut ws, &solo.id, &root.id);

    assert_rebuild_matches(&mut ws);

    ws.update_task_status(&root.id, TaskStatus::Closed, "tester")
        .unwrap();
    assert_rebuild_matches(&mut ws);
}

#[test]
fn rebuild_is_idempotent() {
    let mut ws = test_db();
    let a = fixtures::create_task(&mut ws, "idem-a");
    let b = fixtures::create_task(&mut ws, "idem-b");
    blocks(&mut ws, &b.id, &a.id);

    let first = ws.rebuild_blocked_cache().unwrap();
    let after_first = snapshot(&ws);
    let second = ws.rebuild_blocked_cache().unwrap();
    let after_second = snapshot(&ws);

    assert_eq!(first.elements_checked, second.elements_checked);
    assert_eq!(first.elements_blocked, second.elements_blocked);
    assert_eq!(after_first, after_second);
}

#[test]
fn rebuild_preserves_previous_status_for_restore() {
    let mut ws = test_db();
    let blocker = fixtures::create_task(&mut ws, "hold");
    let waiter = fixtures::create_task(&mut ws, "held");
    ws.update_task_status(&waiter.id, TaskStatus::Review, "tester")
        .unwrap();
    blocks(&mut ws, &waiter.id, &blocker.id);

    ws.rebuild_blocked_cache().unwrap();
    let entry: BlockedEntry = ws.is_blocked(&waiter.id).unwrap().unwrap();
    assert_eq!(entry.previous_status, Some(TaskStatus::Review));

    ws.update_task_status(&blocker.id, TaskStatus::Closed, "tester")
        .unwrap();
    assert_eq!(
        ws.get_element(&waiter.id).unwrap().unwrap().task_status(),
        Some(TaskStatus::Review)
    );
}

// ============================================================================
// DIAMOND & MULTI-BLOCKER INVALIDATION
// ============================================================================

#[test]
fn waiter_stays_blocked_until_all_blockers_complete() {
    let mut ws = test_db();
    let x = fixtures::create_task(&mut ws, "blocker x");
    let y = fixtures::create_task(&mut ws, "blocker y");
    let w = fixtures::create_task(&mut ws, "double waiter");

    blocks(&mut ws, &w.id, &x.id);
    blocks(&mut ws, &w.id, &y.id);

    ws.update_task_status(&x.id, TaskStatus::Closed, "tester")
        .unwrap();
    let entry = ws.is_blocked(&w.id).unwrap().expect("y still blocks");
    assert_eq!(entry.blocked_by, y.id);

    ws.update_task_status(&y.id, TaskStatus::Closed, "tester")
        .unwrap();
    assert!(ws.is_blocked(&w.id).unwrap().is_none());
}

#[test]
fn unblocking_is_not_completion() {
    // w waits on x and y; x waits on y; y waits on a. Closing a unblocks
    // only y: x and w still wait for their blockers to actually complete.
    let mut ws = test_db();
    let a = fixtures::create_task(&mut ws, "wave root");
    let y = fixtures::create_task(&mut ws, "wave y");
    let x = fixtures::create_task(&mut ws, "wave x");
    let w = fixtures::create_task(&mut ws, "wave w");

    blocks(&mut ws, &y.id, &a.id);
    blocks(&mut ws, &x.id, &y.id);
    blocks(&mut ws, &w.id, &x.id);
    blocks(&mut ws, &w.id, &y.id);
    assert_eq!(ws.blocked_count().unwrap(), 3);

    ws.update_task_status(&a.id, TaskStatus::Closed, "tester")
        .unwrap();
    assert!(ws.is_blocked(&y.id).unwrap().is_none());
    assert!(ws.is_blocked(&x.id).unwrap().is_some());
    assert!(ws.is_blocked(&w.id).unwrap().is_some());
    assert_rebuild_matches(&mut ws);

    ws.update_task_status(&y.id, TaskStatus::Closed, "tester")
        .unwrap();
    assert!(ws.is_blocked(&x.id).unwrap().is_none());
    let w_entry = ws.is_blocked(&w.id).unwrap().expect("x still incomplete");
    assert_eq!(w_entry.blocked_by, x.id);
    assert_rebuild_matches(&mut ws);

    ws.update_task_status(&x.id, TaskStatus::Closed, "tester")
        .unwrap();
    assert_eq!(ws.blocked_count().unwrap(), 0);
    assert_rebuild_matches(&mut ws);
}
