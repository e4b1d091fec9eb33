//! Storage unit tests for dependency graph operations.
//!
//! Tests: `add_dependency`, `remove_dependency`, relates-to normalization,
//! cycle detection, depth caps, bulk helpers. Real `SQLite`, no mocks.

mod common;

use common::{fixtures, test_db};
use stoneforge::model::{DependencyMetadata, EventType, GateSpec};
use stoneforge::{DependencyType, StoneforgeError};

// ============================================================================
// ADD DEPENDENCY TESTS
// ============================================================================

#[test]
fn add_dependency_creates_edge_and_event() {
    let mut ws = test_db();
    let blocker = fixtures::create_task(&mut ws, "blocker");
    let blocked = fixtures::create_task(&mut ws, "blocked");

    let dep = ws
        .add_dependency(
            &blocked.id,
            &blocker.id,
            DependencyType::Blocks,
            "dep-actor",
            None,
        )
        .unwrap();
    assert_eq!(dep.blocked_id, blocked.id);
    assert_eq!(dep.blocker_id, blocker.id);

    let deps = ws.dependencies_of(&blocked.id).unwrap();
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].blocker_id, blocker.id);

    let events = ws.events_for(&blocked.id, 100).unwrap();
    assert_eq!(events[0].event_type, EventType::DependencyAdded);
    assert_eq!(events[0].actor, "dep-actor");
}

#[test]
fn add_dependency_rejects_self_reference() {
    let mut ws = test_db();
    let task = fixtures::create_task(&mut ws, "self");
    let err = ws
        .add_dependency(&task.id, &task.id, DependencyType::Blocks, "tester", None)
        .unwrap_err();
    assert!(matches!(err, StoneforgeError::Validation { .. }));
}

#[test]
fn add_dependency_rejects_duplicates() {
    let mut ws = test_db();
    let a = fixtures::create_task(&mut ws, "dup-a");
    let b = fixtures::create_task(&mut ws, "dup-b");

    ws.add_dependency(&a.id, &b.id, DependencyType::Blocks, "tester", None)
        .unwrap();
    let err = ws
        .add_dependency(&a.id, &b.id, DependencyType::Blocks, "tester", None)
        .unwrap_err();
    assert!(matches!(err, StoneforgeError::Conflict { .. }));

    // Same pair with a different type is a distinct edge.
    ws.add_dependency(&a.id, &b.id, DependencyType::References, "tester", None)
        .unwrap();
    assert_eq!(ws.count_dependencies(&a.id).unwrap(), 2);
}

#[test]
fn add_dependency_requires_existing_waiter() {
    let mut ws = test_db();
    let blocker = fixtures::create_task(&mut ws, "real");
    let err = ws
        .add_dependency("el-f00", &blocker.id, DependencyType::Blocks, "tester", None)
        .unwrap_err();
    assert!(matches!(err, StoneforgeError::ElementNotFound { .. }));
}

#[test]
fn add_dependency_allows_external_blocker() {
    let mut ws = test_db();
    let blocked = fixtures::create_task(&mut ws, "waits on external");

    // The blocker id has no row; edges to external references are legal.
    ws.add_dependency(&blocked.id, "el-ffff", DependencyType::Blocks, "tester", None)
        .unwrap();
    assert!(
        ws.dependency_exists(&blocked.id, "el-ffff", DependencyType::Blocks)
            .unwrap()
    );
}

#[test]
fn awaits_requires_gate_metadata() {
    let mut ws = test_db();
    let blocked = fixtures::create_task(&mut ws, "gated");
    let gatekeeper = fixtures::create_task(&mut ws, "gatekeeper");

    let err = ws
        .add_dependency(
            &blocked.id,
            &gatekeeper.id,
            DependencyType::Awaits,
            "tester",
            None,
        )
        .unwrap_err();
    assert!(matches!(err, StoneforgeError::Validation { .. }));

    let gate = GateSpec::approval(vec!["u1".to_string()], Some(1));
    ws.add_dependency(
        &blocked.id,
        &gatekeeper.id,
        DependencyType::Awaits,
        "tester",
        Some(DependencyMetadata::with_gate(gate)),
    )
    .unwrap();
}

#[test]
fn validates_requires_test_type_and_result() {
    let mut ws = test_db();
    let subject = fixtures::create_task(&mut ws, "subject");
    let test_run = fixtures::create_task(&mut ws, "test run");

    let err = ws
        .add_dependency(
            &subject.id,
            &test_run.id,
            DependencyType::Validates,
            "tester",
            None,
        )
        .unwrap_err();
    assert!(matches!(err, StoneforgeError::Validation { .. }));

    let metadata = DependencyMetadata {
        test_type: Some("integration".to_string()),
        result: Some("pass".to_string()),
        ..DependencyMetadata::default()
    };
    let dep = ws
        .add_dependency(
            &subject.id,
            &test_run.id,
            DependencyType::Validates,
            "tester",
            Some(metadata),
        )
        .unwrap();
    assert_eq!(dep.metadata.test_type.as_deref(), Some("integration"));
}

// ============================================================================
// RELATES-TO NORMALIZATION
// ============================================================================

#[test]
fn relates_to_is_stored_canonically() {
    let mut ws = test_db();
    let a = fixtures::create_task(&mut ws, "rel-a");
    let b = fixtures::create_task(&mut ws, "rel-b");
    let (small, large) = if a.id < b.id { (&a.id, &b.id) } else { (&b.id, &a.id) };

    // Insert in the non-canonical orientation.
    let dep = ws
        .add_dependency(large, small, DependencyType::RelatesTo, "tester", None)
        .unwrap();
    assert_eq!(&dep.blocked_id, small);
    assert_eq!(&dep.blocker_id, large);

    // Visible from both orientations.
    assert!(
        ws.dependency_exists(small, large, DependencyType::RelatesTo)
            .unwrap()
    );
    assert!(
        ws.dependency_exists(large, small, DependencyType::RelatesTo)
            .unwrap()
    );

    // Duplicate in either orientation is rejected.
    for (x, y) in [(small, large), (large, small)] {
        let err = ws
            .add_dependency(x, y, DependencyType::RelatesTo, "tester", None)
            .unwrap_err();
        assert!(matches!(err, StoneforgeError::Conflict { .. }));
    }

    assert_eq!(ws.related_to(&a.id).unwrap().len(), 1);
    assert_eq!(ws.related_to(&b.id).unwrap().len(), 1);
}

#[test]
fn duplicates_type_is_not_normalized() {
    let mut ws = test_db();
    let a = fixtures::create_task(&mut ws, "dupes-a");
    let b = fixtures::create_task(&mut ws, "dupes-b");
    let (small, large) = if a.id < b.id { (&a.id, &b.id) } else { (&b.id, &a.id) };

    let dep = ws
        .add_dependency(large, small, DependencyType::Duplicates, "tester", None)
        .unwrap();
    assert_eq!(&dep.blocked_id, large, "duplicates keeps caller orientation");
}

// ============================================================================
// REMOVE DEPENDENCY TESTS
// ============================================================================

#[test]
fn remove_dependency_deletes_edge_and_events() {
    let mut ws = test_db();
    let blocker = fixtures::create_task(&mut ws, "rm-blocker");
    let blocked = fixtures::create_task(&mut ws, "rm-blocked");

    ws.add_dependency(&blocked.id, &blocker.id, DependencyType::Blocks, "tester", None)
        .unwrap();
    ws.remove_dependency(&blocked.id, &blocker.id, DependencyType::Blocks, "tester")
        .unwrap();

    assert!(ws.dependencies_of(&blocked.id).unwrap().is_empty());
    let events = ws.events_for(&blocked.id, 100).unwrap();
    assert_eq!(events[0].event_type, EventType::DependencyRemoved);
}

#[test]
fn remove_missing_dependency_is_not_found() {
    let mut ws = test_db();
    let a = fixtures::create_task(&mut ws, "none-a");
    let b = fixtures::create_task(&mut ws, "none-b");
    let err = ws
        .remove_dependency(&a.id, &b.id, DependencyType::Blocks, "tester")
        .unwrap_err();
    assert!(matches!(err, StoneforgeError::DependencyNotFound { .. }));
}

#[test]
fn remove_relates_to_matches_either_orientation() {
    let mut ws = test_db();
    let a = fixtures::create_task(&mut ws, "sym-a");
    let b = fixtures::create_task(&mut ws, "sym-b");

    ws.add_dependency(&a.id, &b.id, DependencyType::RelatesTo, "tester", None)
        .unwrap();
    // Remove using the reverse orientation.
    ws.remove_dependency(&b.id, &a.id, DependencyType::RelatesTo, "tester")
        .unwrap();
    assert!(
        !ws.dependency_exists(&a.id, &b.id, DependencyType::RelatesTo)
            .unwrap()
    );
}

// ============================================================================
// CYCLE DETECTION
// ============================================================================

#[test]
fn cycle_rejection_carries_the_discovered_path() {
    let mut ws = test_db();
    let a = fixtures::create_task(&mut ws, "cyc-a");
    let b = fixtures::create_task(&mut ws, "cyc-b");
    let c = fixtures::create_task(&mut ws, "cyc-c");

    // B waits on A; C waits on B.
    ws.add_dependency(&b.id, &a.id, DependencyType::Blocks, "tester", None)
        .unwrap();
    ws.add_dependency(&c.id, &b.id, DependencyType::Blocks, "tester", None)
        .unwrap();

    // A waits on C would close the loop.
    let err = ws
        .add_dependency(&a.id, &c.id, DependencyType::Blocks, "tester", None)
        .unwrap_err();
    let StoneforgeError::CycleDetected { path } = err else {
        panic!("expected CycleDetected, got {err:?}");
    };
    assert_eq!(
        path,
        vec![c.id.clone(), b.id.clone(), a.id.clone(), a.id.clone()]
    );

    // Nothing was inserted and no event was emitted.
    assert!(ws.dependencies_of(&a.id).unwrap().is_empty());
    let events = ws.events_for(&a.id, 100).unwrap();
    assert_eq!(events.len(), 1, "only the create event");
}

#[test]
fn cycles_span_mixed_blocking_types() {
    let mut ws = test_db();
    let parent = fixtures::create_task(&mut ws, "mix-parent");
    let child = fixtures::create_task(&mut ws, "mix-child");

    ws.add_dependency(&child.id, &parent.id, DependencyType::ParentChild, "tester", None)
        .unwrap();
    // parent waits on child via blocks: cycle across types.
    let err = ws
        .add_dependency(&parent.id, &child.id, DependencyType::Blocks, "tester", None)
        .unwrap_err();
    assert!(matches!(err, StoneforgeError::CycleDetected { .. }));
}

#[test]
fn associative_edges_never_cycle_check() {
    let mut ws = test_db();
    let a = fixtures::create_task(&mut ws, "assoc-a");
    let b = fixtures::create_task(&mut ws, "assoc-b");

    ws.add_dependency(&a.id, &b.id, DependencyType::References, "tester", None)
        .unwrap();
    // Reverse associative edge is fine; no DAG constraint applies.
    ws.add_dependency(&b.id, &a.id, DependencyType::References, "tester", None)
        .unwrap();

    let check = ws
        .cycle_check(&a.id, &b.id, DependencyType::References, None)
        .unwrap();
    assert!(!check.has_cycle);
    assert_eq!(check.nodes_visited, 0);
}

#[test]
fn depth_limited_probe_is_conservative() {
    let mut ws = test_db();
    // Chain t0 <- t1 <- ... <- t5 (each waits on the previous).
    let tasks: Vec<_> = (0..6)
        .map(|i| fixtures::create_task(&mut ws, &format!("chain-{i}")))
        .collect();
    for pair in tasks.windows(2) {
        ws.add_dependency(&pair[1].id, &pair[0].id, DependencyType::Blocks, "tester", None)
            .unwrap();
    }

    // Closing the loop is a real cycle at full depth...
    let full = ws
        .cycle_check(&tasks[5].id, &tasks[0].id, DependencyType::Blocks, None)
        .unwrap();
    assert!(!full.has_cycle, "t5 -> t0 adds no cycle");
    let closing = ws
        .cycle_check(&tasks[0].id, &tasks[5].id, DependencyType::Blocks, None)
        .unwrap();
    assert!(closing.has_cycle);
    assert!(closing.nodes_visited > 0);

    // ...but a depth cap of 2 cannot see it and reports the limit.
    let capped = ws
        .cycle_check(&tasks[0].id, &tasks[5].id, DependencyType::Blocks, Some(2))
        .unwrap();
    assert!(!capped.has_cycle);
    assert!(capped.depth_limit_reached);
}

// ============================================================================
// BULK HELPERS
// ============================================================================

#[test]
fn counts_and_bulk_lookup() {
    let mut ws = test_db();
    let hub = fixtures::create_task(&mut ws, "hub");
    let spokes: Vec<_> = (0..3)
        .map(|i| fixtures::create_task(&mut ws, &format!("spoke-{i}")))
        .collect();

    for spoke in &spokes {
        ws.add_dependency(&spoke.id, &hub.id, DependencyType::Blocks, "tester", None)
            .unwrap();
    }

    assert_eq!(ws.count_dependents(&hub.id).unwrap(), 3);
    assert_eq!(ws.count_dependencies(&spokes[0].id).unwrap(), 1);
    assert_eq!(ws.dependents_of(&hub.id).unwrap().len(), 3);

    let ids: Vec<String> = spokes.iter().map(|s| s.id.clone()).collect();
    let map = ws.dependencies_for_many(&ids).unwrap();
    assert_eq!(map.len(), 3);
    for spoke in &spokes {
        assert_eq!(map[&spoke.id].len(), 1);
    }
}

#[test]
fn remove_all_dependencies_and_dependents() {
    let mut ws = test_db();
    let center = fixtures::create_task(&mut ws, "center");
    let upstream = fixtures::create_task(&mut ws, "upstream");
    let downstream = fixtures::create_task(&mut ws, "downstream");

    ws.add_dependency(&center.id, &upstream.id, DependencyType::Blocks, "tester", None)
        .unwrap();
    ws.add_dependency(&downstream.id, &center.id, DependencyType::Blocks, "tester", None)
        .unwrap();

    assert_eq!(ws.remove_all_dependencies(&center.id, "tester").unwrap(), 1);
    assert_eq!(ws.remove_all_dependents(&center.id, "tester").unwrap(), 1);
    assert_eq!(ws.count_dependencies(&center.id).unwrap(), 0);
    assert_eq!(ws.count_dependents(&center.id).unwrap(), 0);

    // The freed waiters are no longer blocked.
    assert!(ws.is_blocked(&downstream.id).unwrap().is_none());
}
