//! Convergence tests for the merge engine.
//!
//! Replicas that observe the same multiset of writes must hold
//! byte-equal graphs, whatever the delivery order and however the writes
//! interleave. These tests replay fixed write sets through every
//! permutation (or a rotation sample, for larger sets) and assert the
//! final graphs are identical, including their state maps and signature
//! maps.

use std::collections::HashSet;

use mesh_crypto::{Keypair, Signer as _, Verifier};
use mesh_primitives::{Graph, Node, Soul, State, Value};

use super::{mix, MixOptions};

const NOW: State = 10_000_000.0;

struct AcceptAll;

impl Verifier for AcceptAll {
    fn verify(&self, _: &str, _: &Value, _: State, _: &str) -> bool {
        true
    }
}

/// Replay `writes` in the given order onto a fresh replica.
fn replay(writes: &[Graph]) -> Graph {
    let mut graph = Graph::new();
    let keep = HashSet::new();
    for write in writes {
        let _ = mix(write, &mut graph, &AcceptAll, &MixOptions::new(NOW, &keep));
    }
    graph
}

fn single(soul: &str, field: &str, value: Value, state: State) -> Graph {
    let soul = Soul::from(soul);
    let mut node = Node::new(soul.clone());
    node.set(field, value, state);
    Graph::single(soul, node)
}

/// All permutations of the write set must agree with the identity order.
fn assert_order_free(writes: Vec<Graph>) {
    let reference = replay(&writes);
    let mut order: Vec<usize> = (0..writes.len()).collect();

    permutations(&mut order, 0, &mut |order| {
        let shuffled: Vec<Graph> = order.iter().map(|&i| writes[i].clone()).collect();
        let replica = replay(&shuffled);
        assert_eq!(
            replica, reference,
            "replica diverged for delivery order {order:?}"
        );
    });
}

fn permutations(items: &mut Vec<usize>, k: usize, visit: &mut impl FnMut(&[usize])) {
    if k == items.len() {
        visit(items);
        return;
    }
    for i in k..items.len() {
        items.swap(k, i);
        permutations(items, k + 1, visit);
        items.swap(k, i);
    }
}

#[test]
fn single_field_history_is_order_free() {
    assert_order_free(vec![
        single("mark", "name", Value::from("M"), 1.0),
        single("mark", "name", Value::from("Ma"), 2.0),
        single("mark", "name", Value::from("Mark"), 3.0),
    ]);
}

#[test]
fn state_ties_are_order_free() {
    assert_order_free(vec![
        single("s", "x", Value::from("alpha"), 5.0),
        single("s", "x", Value::from("beta"), 5.0),
        single("s", "x", Value::from("gamma"), 5.0),
    ]);
}

#[test]
fn mixed_types_at_equal_state_are_order_free() {
    // The tie-break compares encodings, so cross-type conflicts must
    // still resolve identically everywhere.
    assert_order_free(vec![
        single("s", "x", Value::Null, 2.0),
        single("s", "x", Value::Bool(true), 2.0),
        single("s", "x", Value::Number(42.0), 2.0),
        single("s", "x", Value::from("42"), 2.0),
    ]);
}

#[test]
fn multi_soul_multi_field_traffic_is_order_free() {
    assert_order_free(vec![
        single("mark", "name", Value::from("Mark"), 1.0),
        single("mark", "age", Value::Number(23.0), 2.0),
        single("mark", "name", Value::from("M."), 2.0),
        single("amber", "name", Value::from("Amber"), 1.0),
        single("amber", "spouse", Value::Relation(Soul::from("mark")), 3.0),
        single("mark", "age", Value::Number(24.0), 1.0),
    ]);
}

#[test]
fn tombstones_converge_like_any_write() {
    assert_order_free(vec![
        single("mark", "name", Value::from("Mark"), 1.0),
        single("mark", "name", Value::Null, 2.0),
        single("mark", "name", Value::from("Impostor"), 1.5),
    ]);
}

#[test]
fn signed_writes_converge_with_signatures_intact() {
    let keypair = Keypair::generate();
    let soul = keypair.soul();

    let mut writes = Vec::new();
    for (state, value) in [(1.0, "first"), (2.0, "second")] {
        let value = Value::from(value);
        let soul = Soul::from(soul.clone());
        let mut node = Node::new(soul.clone());
        node.set("doc", value.clone(), state);
        node.sign(state, keypair.sign(&value, state));
        writes.push(Graph::single(soul, node));
    }

    let reference = replay(&writes);
    writes.reverse();
    let replica = replay(&writes);
    assert_eq!(replica, reference);

    let node = reference
        .get(&Soul::from(soul))
        .expect("soul should be held");
    assert_eq!(node.value("doc"), Some(&Value::from("second")));
    assert!(node.sig(2.0).is_some(), "winning signature is preserved");
}

#[test]
fn pairwise_merge_of_replicas_converges() {
    // Two replicas advance independently, then exchange their graphs as
    // ordinary change-sets. Both must land on the same state.
    let keep = HashSet::new();

    let mut left = Graph::new();
    let mut right = Graph::new();
    let opts = MixOptions::new(NOW, &keep);

    let _ = mix(
        &single("mark", "name", Value::from("Left"), 3.0),
        &mut left,
        &AcceptAll,
        &opts,
    );
    let _ = mix(
        &single("mark", "age", Value::Number(23.0), 1.0),
        &mut left,
        &AcceptAll,
        &opts,
    );
    let _ = mix(
        &single("mark", "name", Value::from("Right"), 2.0),
        &mut right,
        &AcceptAll,
        &opts,
    );
    let _ = mix(
        &single("amber", "name", Value::from("Amber"), 1.0),
        &mut right,
        &AcceptAll,
        &opts,
    );

    let left_snapshot = left.clone();
    let right_snapshot = right.clone();
    let _ = mix(&right_snapshot, &mut left, &AcceptAll, &opts);
    let _ = mix(&left_snapshot, &mut right, &AcceptAll, &opts);

    assert_eq!(left, right);
    let node = left.get(&Soul::from("mark")).expect("soul held");
    assert_eq!(node.value("name"), Some(&Value::from("Left")));
    assert_eq!(node.state("name"), Some(3.0));
}

#[test]
fn rotation_sample_of_a_larger_history_converges() {
    // 8 writes = 40320 permutations is more than a unit test should run;
    // rotations plus the reverse give a representative sample.
    let writes: Vec<Graph> = (0..8_u32)
        .map(|i| {
            single(
                if i % 2 == 0 { "a" } else { "b" },
                if i % 3 == 0 { "x" } else { "y" },
                Value::Number(f64::from(i)),
                f64::from(i % 4),
            )
        })
        .collect();

    let reference = replay(&writes);
    for rotation in 0..writes.len() {
        let mut sample = writes.clone();
        sample.rotate_left(rotation);
        assert_eq!(replay(&sample), reference, "rotation {rotation} diverged");

        sample.reverse();
        assert_eq!(
            replay(&sample),
            reference,
            "reversed rotation {rotation} diverged"
        );
    }
}
