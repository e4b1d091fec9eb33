//! Priority-service tests: effective priority, aggregate complexity, sorting.

mod common;

use common::{fixtures, test_db};
use stoneforge::engine::priority::sort_by_effective_priority;
use stoneforge::{DependencyType, PriorityOptions, StoneforgeError, TaskStatus};

fn opts() -> PriorityOptions {
    PriorityOptions::default()
}

// ============================================================================
// EFFECTIVE PRIORITY
// ============================================================================

#[test]
fn urgent_dependent_raises_effective_priority() {
    // Scenario S6: U (priority 1) waits on T (priority 3).
    let mut ws = test_db();
    let t = fixtures::create(&mut ws, fixtures::TaskBuilder::new("T").priority(3).build());
    let u = fixtures::create(&mut ws, fixtures::TaskBuilder::new("U").priority(1).build());

    ws.add_dependency(&u.id, &t.id, DependencyType::Blocks, "tester", None)
        .unwrap();

    let result = ws.effective_priority(&t.id, &opts()).unwrap();
    assert_eq!(result.base_priority, 3);
    assert_eq!(result.effective_priority, 1);
    assert_eq!(result.dependent_influencers, vec![u.id.clone()]);
    assert!(result.is_influenced);
}

#[test]
fn uninfluenced_task_keeps_base_priority() {
    let mut ws = test_db();
    let t = fixtures::create(&mut ws, fixtures::TaskBuilder::new("lonely").priority(2).build());

    let result = ws.effective_priority(&t.id, &opts()).unwrap();
    assert_eq!(result.base_priority, 2);
    assert_eq!(result.effective_priority, 2);
    assert!(result.dependent_influencers.is_empty());
    assert!(!result.is_influenced);
}

#[test]
fn influence_propagates_transitively() {
    // c (p1) waits on b (p4) waits on a (p5): a inherits 1 through the chain.
    let mut ws = test_db();
    let a = fixtures::create(&mut ws, fixtures::TaskBuilder::new("a").priority(5).build());
    let b = fixtures::create(&mut ws, fixtures::TaskBuilder::new("b").priority(4).build());
    let c = fixtures::create(&mut ws, fixtures::TaskBuilder::new("c").priority(1).build());

    ws.add_dependency(&b.id, &a.id, DependencyType::Blocks, "tester", None)
        .unwrap();
    ws.add_dependency(&c.id, &b.id, DependencyType::Blocks, "tester", None)
        .unwrap();

    let result = ws.effective_priority(&a.id, &opts()).unwrap();
    assert_eq!(result.effective_priority, 1);
    assert!(result.dependent_influencers.contains(&b.id));
    assert!(result.dependent_influencers.contains(&c.id));
    // Most urgent first.
    assert_eq!(result.dependent_influencers[0], c.id);
}

#[test]
fn completed_dependents_do_not_influence() {
    let mut ws = test_db();
    let t = fixtures::create(&mut ws, fixtures::TaskBuilder::new("base").priority(3).build());
    let done = fixtures::create(&mut ws, fixtures::TaskBuilder::new("done").priority(1).build());
    ws.add_dependency(&done.id, &t.id, DependencyType::Blocks, "tester", None)
        .unwrap();
    ws.update_task_status(&done.id, TaskStatus::Closed, "tester")
        .unwrap();

    let result = ws.effective_priority(&t.id, &opts()).unwrap();
    assert_eq!(result.effective_priority, 3);
    assert!(!result.is_influenced);
}

#[test]
fn only_blocks_edges_carry_influence() {
    let mut ws = test_db();
    let t = fixtures::create(&mut ws, fixtures::TaskBuilder::new("plain").priority(4).build());
    let rel = fixtures::create(&mut ws, fixtures::TaskBuilder::new("related").priority(1).build());
    ws.add_dependency(&rel.id, &t.id, DependencyType::References, "tester", None)
        .unwrap();

    let result = ws.effective_priority(&t.id, &opts()).unwrap();
    assert_eq!(result.effective_priority, 4);
}

#[test]
fn depth_cap_bounds_the_walk() {
    let mut ws = test_db();
    let mut prev = fixtures::create(&mut ws, fixtures::TaskBuilder::new("d0").priority(5).build());
    let head = prev.id.clone();
    for i in 1..=4 {
        let next = fixtures::create(
            &mut ws,
            fixtures::TaskBuilder::new(&format!("d{i}"))
                .priority(if i == 4 { 1 } else { 5 })
                .build(),
        );
        ws.add_dependency(&next.id, &prev.id, DependencyType::Blocks, "tester", None)
            .unwrap();
        prev = next;
    }

    let shallow = ws
        .effective_priority(
            &head,
            &PriorityOptions {
                max_depth: 2,
                include_complexity: false,
            },
        )
        .unwrap();
    assert_eq!(shallow.effective_priority, 5, "urgent leaf is out of range");

    let deep = ws.effective_priority(&head, &opts()).unwrap();
    assert_eq!(deep.effective_priority, 1);
}

#[test]
fn effective_priority_rejects_non_tasks() {
    let mut ws = test_db();
    let plan = fixtures::create(
        &mut ws,
        fixtures::plan("not a task", stoneforge::PlanStatus::Active),
    );
    let err = ws.effective_priority(&plan.id, &opts()).unwrap_err();
    assert!(matches!(err, StoneforgeError::Validation { .. }));

    let err = ws.effective_priority("el-404", &opts()).unwrap_err();
    assert!(matches!(err, StoneforgeError::ElementNotFound { .. }));
}

#[test]
fn bulk_form_skips_unknown_ids() {
    let mut ws = test_db();
    let t = fixtures::create(&mut ws, fixtures::TaskBuilder::new("bulk").priority(2).build());
    let results = ws
        .effective_priorities(&[t.id.clone(), "el-404".to_string()], &opts())
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].element_id, t.id);
}

// ============================================================================
// AGGREGATE COMPLEXITY
// ============================================================================

#[test]
fn aggregate_complexity_sums_transitive_blockers() {
    let mut ws = test_db();
    let goal = fixtures::create(
        &mut ws,
        fixtures::TaskBuilder::new("goal").complexity(2).build(),
    );
    let step1 = fixtures::create(
        &mut ws,
        fixtures::TaskBuilder::new("step1").complexity(3).build(),
    );
    let step2 = fixtures::create(
        &mut ws,
        fixtures::TaskBuilder::new("step2").complexity(4).build(),
    );

    // goal waits on step1; step1 waits on step2.
    ws.add_dependency(&goal.id, &step1.id, DependencyType::Blocks, "tester", None)
        .unwrap();
    ws.add_dependency(&step1.id, &step2.id, DependencyType::Blocks, "tester", None)
        .unwrap();

    let result = ws.aggregate_complexity(&goal.id, &opts()).unwrap();
    assert_eq!(result.base_complexity, 2);
    assert_eq!(result.total_complexity, 9);
    assert_eq!(result.contributors.len(), 2);
    let by_id: Vec<_> = result
        .contributors
        .iter()
        .map(|c| (c.element_id.as_str(), c.complexity))
        .collect();
    assert!(by_id.contains(&(step1.id.as_str(), 3)));
    assert!(by_id.contains(&(step2.id.as_str(), 4)));
}

#[test]
fn completed_blockers_do_not_add_complexity() {
    let mut ws = test_db();
    let goal = fixtures::create(
        &mut ws,
        fixtures::TaskBuilder::new("lean goal").complexity(1).build(),
    );
    let done = fixtures::create(
        &mut ws,
        fixtures::TaskBuilder::new("done step").complexity(5).build(),
    );
    ws.add_dependency(&goal.id, &done.id, DependencyType::Blocks, "tester", None)
        .unwrap();
    ws.update_task_status(&done.id, TaskStatus::Closed, "tester")
        .unwrap();

    let result = ws.aggregate_complexity(&goal.id, &opts()).unwrap();
    assert_eq!(result.total_complexity, 1);
    assert!(result.contributors.is_empty());
}

// ============================================================================
// SORTING
// ============================================================================

#[test]
fn sort_orders_by_effective_then_base() {
    let mut ws = test_db();
    let calm = fixtures::create(&mut ws, fixtures::TaskBuilder::new("calm").priority(4).build());
    let boosted = fixtures::create(
        &mut ws,
        fixtures::TaskBuilder::new("boosted").priority(5).build(),
    );
    let urgent_dep = fixtures::create(
        &mut ws,
        fixtures::TaskBuilder::new("urgent dep").priority(1).build(),
    );
    let native = fixtures::create(
        &mut ws,
        fixtures::TaskBuilder::new("native").priority(2).build(),
    );
    ws.add_dependency(&urgent_dep.id, &boosted.id, DependencyType::Blocks, "tester", None)
        .unwrap();

    let ids = vec![calm.id.clone(), boosted.id.clone(), native.id.clone()];
    let mut results = ws.effective_priorities(&ids, &opts()).unwrap();
    sort_by_effective_priority(&mut results);

    let ordered: Vec<&str> = results.iter().map(|r| r.element_id.as_str()).collect();
    // boosted: effective 1; native: 2; calm: 4.
    assert_eq!(ordered, vec![boosted.id.as_str(), native.id.as_str(), calm.id.as_str()]);
}
