//! Replica-level behaviour: convergence, idempotence, tombstones, conflict
//! precedence and delete-history garbage collection.

use boardsync_core::{
    detect_conflicts, merge_states, resolve, ApplyError, ConflictKind, OpKind, Operation, Payload,
    Replica, Strategy, VectorClock,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

fn op(site: &str, clock: &[(&str, u64)], kind: OpKind, payload: Payload, ts: u64) -> Operation {
    let vector_clock: VectorClock = clock.iter().map(|&(s, c)| (s, c)).collect();
    Operation {
        id: Operation::make_id(site, vector_clock.get(site)),
        site_id: site.to_string(),
        kind,
        payload,
        timestamp: ts,
        vector_clock,
        parent_id: None,
    }
}

#[test]
fn disjoint_edits_converge_after_bidirectional_merge() {
    let mut a = Replica::new("A");
    let mut b = Replica::new("B");

    a.create_operation(OpKind::Add, Payload::new("a1").with("x", 1));
    a.create_operation(OpKind::Add, Payload::new("a2").with("x", 2));
    a.create_operation(OpKind::Update, Payload::new("a1").with("color", "red"));
    b.create_operation(OpKind::Add, Payload::new("b1").with("y", 3));
    b.create_operation(OpKind::Delete, Payload::new("b1"));
    b.create_operation(OpKind::Delete, Payload::new("a2"));

    let snapshot_a = a.state().clone();
    let snapshot_b = b.state().clone();
    a.merge_remote(&snapshot_b);
    b.merge_remote(&snapshot_a);

    assert_eq!(a.state().objects, b.state().objects);
    assert_eq!(a.state().tombstones, b.state().tombstones);
    assert_eq!(a.vector_clock(), b.vector_clock());
    assert!(a.state().get("a2").is_none());
    assert!(a.state().is_tombstoned("b1"));
}

#[test]
fn reapplying_an_operation_is_an_idempotent_duplicate() {
    let mut origin = Replica::new("A");
    let add = origin.create_operation(OpKind::Add, Payload::new("obj1").with("x", 1));

    let mut peer = Replica::new("B");
    assert!(peer.apply_remote_operation(add.clone()).is_ok());
    let before = peer.state().clone();

    let err = peer.apply_remote_operation(add).unwrap_err();
    assert_eq!(
        err,
        ApplyError::DuplicateOperation {
            id: "A-1".to_string()
        }
    );
    assert_eq!(peer.state(), &before);
    assert_eq!(peer.history().len(), 1);
}

#[test]
fn tombstoned_entity_never_reappears() {
    let mut replica = Replica::new("A");
    replica.create_operation(OpKind::Add, Payload::new("obj1").with("x", 1));
    replica.create_operation(OpKind::Delete, Payload::new("obj1"));

    let re_add = op("B", &[("B", 1)], OpKind::Add, Payload::new("obj1").with("x", 9), 10);
    let update = op("B", &[("B", 2)], OpKind::Update, Payload::new("obj1").with("x", 8), 11);
    replica.apply_remote_operation(re_add).unwrap();
    replica.apply_remote_operation(update).unwrap();
    assert!(replica.state().get("obj1").is_none());

    let mut stale = Replica::new("C");
    stale.create_operation(OpKind::Add, Payload::new("obj1").with("x", 7));
    replica.merge_remote(&stale.state().clone());
    assert!(replica.state().get("obj1").is_none());
    assert!(replica.state().is_tombstoned("obj1"));

    let merged = merge_states(stale.state(), replica.state());
    assert!(!merged.objects.contains_key("obj1"));
}

#[test]
fn delete_wins_regardless_of_input_order() {
    let update = op("A", &[("A", 1)], OpKind::Update, Payload::new("obj1").with("x", 1), 200);
    let delete = op("B", &[("B", 1)], OpKind::Delete, Payload::new("obj1"), 100);

    for ops in [[update.clone(), delete.clone()], [delete.clone(), update.clone()]] {
        let res = resolve(&ops);
        assert_eq!(res.strategy, Some(Strategy::DeleteWins));
        assert_eq!(res.winner.unwrap().kind, OpKind::Delete);
    }
}

#[test]
fn causal_successor_wins() {
    let op_a = op("site1", &[("site1", 1)], OpKind::Update, Payload::new("obj1"), 500);
    let op_b = op(
        "site2",
        &[("site1", 1), ("site2", 1)],
        OpKind::Update,
        Payload::new("obj1"),
        100,
    );

    let res = resolve(&[op_a, op_b.clone()]);
    assert_eq!(res.strategy, Some(Strategy::CausalOrdering));
    assert_eq!(res.winner.unwrap().id, op_b.id);
}

#[test]
fn disjoint_field_updates_are_merged() {
    let sizing = op(
        "A",
        &[("A", 1)],
        OpKind::Update,
        Payload::new("obj1").with("width", 200).with("height", 100),
        1,
    );
    let styling = op(
        "B",
        &[("B", 1)],
        OpKind::Update,
        Payload::new("obj1").with("color", "blue").with("opacity", 0.8),
        2,
    );

    let res = resolve(&[sizing, styling]);
    assert_eq!(res.strategy, Some(Strategy::MergeNonConflicting));
    let merged = serde_json::to_value(res.merged.unwrap().payload).unwrap();
    assert_eq!(
        merged,
        json!({"id": "obj1", "width": 200, "height": 100, "color": "blue", "opacity": 0.8})
    );
}

#[test]
fn field_merge_tie_is_broken_by_site_in_any_order() {
    let from_a = op(
        "A",
        &[("A", 1)],
        OpKind::Update,
        Payload::new("obj1").with("color", "red").with("width", 10),
        500,
    );
    let from_b = op(
        "B",
        &[("B", 1)],
        OpKind::Update,
        Payload::new("obj1").with("color", "blue").with("height", 4),
        500,
    );

    let ab = resolve(&[from_a.clone(), from_b.clone()]);
    let ba = resolve(&[from_b, from_a]);
    assert_eq!(ab.strategy, Some(Strategy::MergeNonConflicting));
    assert_eq!(ba.strategy, Some(Strategy::MergeNonConflicting));

    let merged_ab = ab.merged.unwrap();
    let merged_ba = ba.merged.unwrap();
    assert_eq!(merged_ab, merged_ba);
    assert_eq!(
        serde_json::to_value(&merged_ab.payload).unwrap(),
        json!({"id": "obj1", "color": "blue", "width": 10, "height": 4})
    );
    assert_eq!(merged_ab.id, "merged-B-1");
}

#[test]
fn concurrent_creates_are_reported_and_resolved_by_lww() {
    let mut a = Replica::new("A");
    let mut b = Replica::new("B");
    let op_a = a.create_operation(OpKind::Add, Payload::new("obj1").with("x", 100).with("y", 100));
    let op_b = b.create_operation(OpKind::Add, Payload::new("obj1").with("x", 200).with("y", 200));
    assert_eq!(op_a.vector_clock.get("A"), 1);
    assert_eq!(op_b.vector_clock.get("B"), 1);

    let found = detect_conflicts(&[op_a.clone(), op_b.clone()]);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].kind, ConflictKind::ConcurrentUpdate);
    assert_eq!(found[0].affected_users, vec!["A".to_string(), "B".to_string()]);
    let resolution = found[0].resolution.as_ref().unwrap();
    assert_eq!(resolution.strategy, Some(Strategy::LastWriteWins));

    // Delivering each other's create converges on the resolver's winner.
    a.apply_remote_operation(op_b).unwrap();
    b.apply_remote_operation(op_a).unwrap();
    assert_eq!(a.state().objects, b.state().objects);
    let winner = resolution.winner.as_ref().unwrap();
    assert_eq!(a.state().get("obj1"), Some(&winner.payload.fields));
    assert_eq!(a.take_notifications().len(), 1);
}

#[test]
fn out_of_order_delivery_is_dropped_until_resync() {
    let mut origin = Replica::new("A");
    let first = origin.create_operation(OpKind::Add, Payload::new("obj1").with("x", 1));
    let second = origin.create_operation(OpKind::Update, Payload::new("obj1").with("x", 2));

    let mut peer = Replica::new("B");
    let err = peer.apply_remote_operation(second.clone()).unwrap_err();
    assert!(matches!(err, ApplyError::NotCausallyReady { .. }));
    assert!(peer.state().objects.is_empty());

    peer.apply_remote_operation(first).unwrap();
    peer.apply_remote_operation(second).unwrap();
    assert_eq!(peer.state().get("obj1").unwrap()["x"], json!(2));

    let mut lagging = Replica::new("C");
    lagging.merge_remote(&origin.state().clone());
    assert_eq!(lagging.state().objects, origin.state().objects);
    assert_eq!(lagging.vector_clock().get("A"), 2);
}

#[test]
fn garbage_collection_only_prunes_old_deletes() {
    let mut replica = Replica::new("Z");
    let ops = [
        op("A", &[("A", 1)], OpKind::Add, Payload::new("obj1"), 1_000),
        op("A", &[("A", 2)], OpKind::Update, Payload::new("obj1").with("x", 1), 1_000),
        op("A", &[("A", 3)], OpKind::Delete, Payload::new("obj1"), 1_000),
        op("A", &[("A", 4)], OpKind::Add, Payload::new("obj2"), 1_000),
        op("A", &[("A", 5)], OpKind::Delete, Payload::new("obj2"), 9_500),
    ];
    for op in ops {
        replica.apply_remote_operation(op).unwrap();
    }

    let pruned = replica.garbage_collect_at(10_000, Duration::from_millis(1_000));
    assert_eq!(pruned, 1);

    let history = replica.history();
    assert!(!history.contains("A-3"));
    assert!(history.contains("A-1"));
    assert!(history.contains("A-2"));
    assert!(history.contains("A-4"));
    assert!(history.contains("A-5"));
    assert!(replica.state().is_tombstoned("obj1"));
    assert!(replica.state().is_tombstoned("obj2"));
}

mod properties {
    use super::{merge_states, ApplyError, OpKind, Operation, Payload, Replica};
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;

    #[derive(Debug, Clone)]
    enum Step {
        Add(u8, i64),
        Update(u8, i64),
        Move(u8, i64),
        Delete(u8),
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0u8..4, any::<i64>()).prop_map(|(e, v)| Step::Add(e, v)),
            (0u8..4, any::<i64>()).prop_map(|(e, v)| Step::Update(e, v)),
            (0u8..4, any::<i64>()).prop_map(|(e, v)| Step::Move(e, v)),
            (0u8..4).prop_map(Step::Delete),
        ]
    }

    fn edit(prefix: &str, step: &Step) -> (OpKind, Payload) {
        match *step {
            Step::Add(e, v) => (OpKind::Add, Payload::new(format!("{prefix}{e}")).with("v", v)),
            Step::Update(e, v) => (OpKind::Update, Payload::new(format!("{prefix}{e}")).with("w", v)),
            Step::Move(e, v) => (OpKind::Move, Payload::new(format!("{prefix}{e}")).with("x", v)),
            Step::Delete(e) => (OpKind::Delete, Payload::new(format!("{prefix}{e}"))),
        }
    }

    fn run(replica: &mut Replica, steps: &[Step]) -> Vec<Operation> {
        let prefix = replica.site_id().to_string();
        steps
            .iter()
            .map(|step| {
                let (kind, payload) = edit(&prefix, step);
                replica.create_operation(kind, payload)
            })
            .collect()
    }

    /// A site either edits a shared entity or pulls what another site has
    /// created so far.
    #[derive(Debug, Clone)]
    enum Action {
        Edit(Step),
        Pull(usize),
    }

    fn action_strategy() -> impl Strategy<Value = (usize, Action)> {
        (
            0usize..3,
            prop_oneof![
                3 => step_strategy().prop_map(Action::Edit),
                1 => (0usize..3).prop_map(Action::Pull),
            ],
        )
    }

    /// Play `actions` across three sites. Returns every operation in
    /// creation order, which is causally valid.
    fn simulate(actions: &[(usize, Action)]) -> Vec<Operation> {
        let mut sites: Vec<Replica> = ["A", "B", "C"].into_iter().map(Replica::new).collect();
        let mut outboxes: Vec<Vec<Operation>> = vec![Vec::new(); 3];
        let mut pulled = [[0usize; 3]; 3];
        let mut created = Vec::new();

        for (site, action) in actions {
            match action {
                Action::Edit(step) => {
                    let (kind, payload) = edit("obj", step);
                    let op = sites[*site].create_operation(kind, payload);
                    outboxes[*site].push(op.clone());
                    created.push(op);
                }
                Action::Pull(from) if from != site => {
                    while let Some(op) = outboxes[*from].get(pulled[*site][*from]) {
                        if sites[*site].apply_remote_operation(op.clone()).is_err() {
                            break;
                        }
                        pulled[*site][*from] += 1;
                    }
                }
                Action::Pull(_) => {}
            }
        }
        created
    }

    /// Deliver `ops` ranked by `order`, retrying operations that are not
    /// causally ready yet.
    fn deliver(receiver: &mut Replica, ops: &[Operation], order: &[u32]) -> Result<(), TestCaseError> {
        let mut pending: Vec<(u32, &Operation)> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| (order[i % order.len()], op))
            .collect();
        pending.sort_by_key(|&(rank, _)| rank);

        while !pending.is_empty() {
            let before = pending.len();
            let mut failure = None;
            pending.retain(|&(_, op)| match receiver.apply_remote_operation(op.clone()) {
                Ok(_) => false,
                Err(ApplyError::NotCausallyReady { .. }) => true,
                Err(err) => {
                    failure = Some(err);
                    false
                }
            });
            prop_assert!(failure.is_none(), "unexpected rejection: {:?}", failure);
            prop_assert!(pending.len() < before, "delivery made no progress");
        }
        Ok(())
    }

    proptest! {
        /// Replicas editing disjoint entities agree after merging both ways.
        #[test]
        fn merge_states_converges(
            steps_a in prop::collection::vec(step_strategy(), 0..20),
            steps_b in prop::collection::vec(step_strategy(), 0..20),
        ) {
            let mut a = Replica::new("A");
            let mut b = Replica::new("B");
            run(&mut a, &steps_a);
            run(&mut b, &steps_b);

            let merged_ab = merge_states(a.state(), b.state());
            let merged_ba = merge_states(b.state(), a.state());

            prop_assert_eq!(&merged_ab.objects, &merged_ba.objects);
            prop_assert_eq!(&merged_ab.tombstones, &merged_ba.tombstones);
            prop_assert_eq!(&merged_ab.vector_clock, &merged_ba.vector_clock);
        }

        /// Concurrent edits of shared entities from several sites, under
        /// skewed wall clocks, converge for any causally valid delivery order.
        #[test]
        fn any_causal_delivery_order_converges(
            actions in prop::collection::vec(action_strategy(), 1..40),
            stamps in prop::collection::vec(0u64..4, 1..8),
            order in prop::collection::vec(any::<u32>(), 1..64),
        ) {
            let mut ops = simulate(&actions);
            for (i, op) in ops.iter_mut().enumerate() {
                op.timestamp = stamps[i % stamps.len()];
            }

            let mut in_order = Replica::new("X");
            for op in &ops {
                prop_assert!(in_order.apply_remote_operation(op.clone()).is_ok());
            }
            let mut shuffled = Replica::new("Y");
            deliver(&mut shuffled, &ops, &order)?;

            prop_assert_eq!(&in_order.state().objects, &shuffled.state().objects);
            prop_assert_eq!(&in_order.state().tombstones, &shuffled.state().tombstones);
            prop_assert_eq!(in_order.vector_clock(), shuffled.vector_clock());
        }

        /// FIFO delivery of every operation matches the origin's state, and
        /// redelivery changes nothing.
        #[test]
        fn fifo_delivery_replays_origin(steps in prop::collection::vec(step_strategy(), 1..30)) {
            let mut origin = Replica::new("A");
            let ops = run(&mut origin, &steps);

            let mut peer = Replica::new("B");
            for op in &ops {
                prop_assert!(peer.apply_remote_operation(op.clone()).is_ok());
            }
            prop_assert_eq!(&peer.state().objects, &origin.state().objects);
            prop_assert_eq!(&peer.state().tombstones, &origin.state().tombstones);

            let settled = peer.state().clone();
            for op in ops {
                let is_duplicate = matches!(
                    peer.apply_remote_operation(op),
                    Err(ApplyError::DuplicateOperation { .. })
                );
                prop_assert!(is_duplicate);
            }
            prop_assert_eq!(peer.state(), &settled);
        }
    }
}
