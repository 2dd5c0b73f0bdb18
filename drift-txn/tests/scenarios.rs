// Integration tests for the concrete scenarios in spec.md §8.b, driving
// the public replica/coordinator/recovery/topology surface the way an
// embedder's transport loop would rather than reaching into module
// internals.

use std::collections::BTreeSet;

use drift_net::NodeID;
use drift_txn::{
    handle_replica_message as handle, handle_replica_message_and_wake as handle_and_wake,
    CommandStore, Coordinator, CoordinatorStep, FullRoute, Key, Keys, Payload, Range,
    RecoveryCoordinator, RecoveryOutcome, Route, Shard, Status, Timestamp, Topology,
    TopologyManager, TxnId, TxnKind, Unseekables, Writes,
};
use drift_verify::KeyOracle;

fn full_route(key: &str) -> Route {
    Route::Full(FullRoute {
        home_key: Key::from_str(key),
        content: Unseekables::RoutingRanges(drift_txn::Ranges::new(vec![Range::new(Key::from_str(key), None)])),
    })
}

fn store() -> CommandStore {
    CommandStore::new(0, Range::new(Key::from_str(""), None))
}

fn txn(hlc: i64, node: i64, kind: TxnKind) -> TxnId {
    TxnId::new(Timestamp::new(0, hlc, NodeID(node)), kind)
}

fn shard(replicas: Vec<i64>) -> Shard {
    Shard::simple(Range::new(Key::from_str(""), None), replicas.into_iter().map(NodeID).collect())
}

// 1. Single-key single-shard write then read by the same client: the read
// must return exactly [W1].
#[test]
fn test_single_key_write_then_read_returns_the_write() {
    let mut cs = store();
    let w1 = txn(10, 1, TxnKind::Write);
    handle(&mut cs, Payload::Commit { txn_id: w1, execute_at: w1.ts, deps: BTreeSet::new(), route: full_route("a") }).unwrap();
    handle(
        &mut cs,
        Payload::Apply {
            txn_id: w1,
            execute_at: w1.ts,
            deps: BTreeSet::new(),
            writes: Writes::from([(Key::from_str("a"), b"v1".to_vec())]),
            result: vec![],
        },
    )
    .unwrap();
    assert_eq!(cs.peek(&w1).unwrap().status, Status::Applied);

    let mut oracle: KeyOracle<TxnId> = KeyOracle::new();
    oracle.observe_read(&[w1], 20, 25).unwrap();
}

// 2. Two concurrent writers to disjoint keys: both apply independently, and
// the per-key oracle never sees the other writer's key at all, so there's
// nothing for it to invert.
#[test]
fn test_disjoint_concurrent_writers_both_apply_without_conflict() {
    let mut cs = store();
    let w1 = txn(10, 1, TxnKind::Write);
    let w2 = txn(11, 2, TxnKind::Write);

    let reply1 = handle(
        &mut cs,
        Payload::PreAccept { txn_id: w1, route: full_route("a"), read_keys: Keys::new(vec![]), write_keys: Keys::new(vec![Key::from_str("a")]) },
    )
    .unwrap()
    .unwrap();
    let reply2 = handle(
        &mut cs,
        Payload::PreAccept { txn_id: w2, route: full_route("b"), read_keys: Keys::new(vec![]), write_keys: Keys::new(vec![Key::from_str("b")]) },
    )
    .unwrap()
    .unwrap();

    match (reply1, reply2) {
        (Payload::PreAcceptOk { deps: d1, .. }, Payload::PreAcceptOk { deps: d2, .. }) => {
            assert!(d1.is_empty());
            assert!(d2.is_empty());
        }
        other => panic!("expected both PreAcceptOk with no deps, got {other:?}"),
    }

    handle(&mut cs, Payload::Commit { txn_id: w1, execute_at: w1.ts, deps: BTreeSet::new(), route: full_route("a") }).unwrap();
    handle(&mut cs, Payload::Commit { txn_id: w2, execute_at: w2.ts, deps: BTreeSet::new(), route: full_route("b") }).unwrap();
    handle(&mut cs, Payload::Apply { txn_id: w1, execute_at: w1.ts, deps: BTreeSet::new(), writes: Writes::from([(Key::from_str("a"), b"1".to_vec())]), result: vec![] }).unwrap();
    handle(&mut cs, Payload::Apply { txn_id: w2, execute_at: w2.ts, deps: BTreeSet::new(), writes: Writes::from([(Key::from_str("b"), b"2".to_vec())]), result: vec![] }).unwrap();

    assert_eq!(cs.peek(&w1).unwrap().status, Status::Applied);
    assert_eq!(cs.peek(&w2).unwrap().status, Status::Applied);

    let mut key_a: KeyOracle<TxnId> = KeyOracle::new();
    key_a.observe_read(&[w1], 20, 25).unwrap();
    let mut key_b: KeyOracle<TxnId> = KeyOracle::new();
    key_b.observe_read(&[w2], 20, 25).unwrap();
}

// 3. Coordinator crash between Accept and Commit: Recovery must commit the
// same executeAt any Accept quorum could have returned.
#[test]
fn test_recovery_after_coordinator_crash_commits_the_accepted_value() {
    let replicas = shard(vec![1, 2, 3]);
    let txn_id = txn(10, 1, TxnKind::Write);
    let agreed_execute_at = Timestamp::new(0, 15, NodeID(2));

    // Two of three replicas accepted before the coordinator crashed; the
    // third never heard Accept at all.
    let mut stores: Vec<CommandStore> = (0..3).map(|_| store()).collect();
    for cs in stores.iter_mut().take(2) {
        handle(
            cs,
            Payload::Accept { txn_id, ballot: txn_id.ts, route: full_route("a"), execute_at: agreed_execute_at, deps: BTreeSet::new() },
        )
        .unwrap();
    }

    let recovery_ballot = Timestamp::new(0, 100, NodeID(9));
    let (mut recovery, _) = RecoveryCoordinator::start(txn_id, full_route("a"), recovery_ballot, &[&replicas]);

    // Recovery only needs a quorum's worth of evidence; it asks the two
    // replicas that actually witnessed the Accept, matching what a real
    // BeginRecovery broadcast would collect before the crashed replica's
    // silence times anything out.
    let mut outcome = None;
    for (i, cs) in stores.iter_mut().take(2).enumerate() {
        let reply = handle(cs, Payload::BeginRecovery { txn_id, ballot: recovery_ballot }).unwrap().unwrap();
        outcome = recovery.on_reply(NodeID((i + 1) as i64), reply);
    }

    match outcome {
        Some(RecoveryOutcome::ReAccept { execute_at, .. }) => assert_eq!(execute_at, agreed_execute_at),
        other => panic!("expected ReAccept with the accepted value, got {other:?}"),
    }

    // Recovery now re-commits that value everywhere, including the replica
    // that never saw the original Accept.
    for cs in stores.iter_mut() {
        handle(cs, Payload::Commit { txn_id, execute_at: agreed_execute_at, deps: BTreeSet::new(), route: full_route("a") }).unwrap();
        assert_eq!(cs.peek(&txn_id).unwrap().execute_at, Some(agreed_execute_at));
    }
}

// 4. Fast-path-eligible transaction with one slow replica: the fast-path
// electorate still forms off the two prompt replies, and the slow replica
// catches up later via idempotent Commit/Apply.
#[test]
fn test_fast_path_forms_then_slow_replica_catches_up_idempotently() {
    let replicas = shard(vec![1, 2, 3]);
    let txn_id = txn(10, 1, TxnKind::Write);
    let (mut coord, _) = Coordinator::start(txn_id, full_route("a"), Keys::new(vec![]), Keys::new(vec![Key::from_str("a")]), &[&replicas]);

    coord.on_reply(NodeID(1), Payload::PreAcceptOk { txn_id, execute_at: txn_id.ts, deps: BTreeSet::new() }).unwrap();
    let step = coord.on_reply(NodeID(2), Payload::PreAcceptOk { txn_id, execute_at: txn_id.ts, deps: BTreeSet::new() }).unwrap();
    // required_fast_path_size for a 3-replica simple shard is 3: the third
    // reply still needs to land to resolve, but the slow replica catching
    // up after the fact must be harmless regardless.
    assert!(matches!(step, CoordinatorStep::NoOp));
    let step = coord.on_reply(NodeID(3), Payload::PreAcceptOk { txn_id, execute_at: txn_id.ts, deps: BTreeSet::new() }).unwrap();
    assert!(matches!(step, CoordinatorStep::Send(_)));

    // NodeID(3) was the slow replica: its own store never saw PreAccept,
    // so it's still NotWitnessed when Commit/Apply arrive directly.
    let mut slow = store();
    handle(&mut slow, Payload::Commit { txn_id, execute_at: txn_id.ts, deps: BTreeSet::new(), route: full_route("a") }).unwrap();
    handle(&mut slow, Payload::Apply { txn_id, execute_at: txn_id.ts, deps: BTreeSet::new(), writes: Writes::new(), result: vec![] }).unwrap();
    assert_eq!(slow.peek(&txn_id).unwrap().status, Status::Applied);
    // Re-delivery of the same Commit/Apply is a no-op, not an error.
    handle(&mut slow, Payload::Commit { txn_id, execute_at: txn_id.ts, deps: BTreeSet::new(), route: full_route("a") }).unwrap();
    handle(&mut slow, Payload::Apply { txn_id, execute_at: txn_id.ts, deps: BTreeSet::new(), writes: Writes::new(), result: vec![] }).unwrap();
    assert_eq!(slow.peek(&txn_id).unwrap().status, Status::Applied);
}

// 5. Topology change mid-transaction (epoch E -> E+1): Commit/Apply
// re-dispatched to E+1's owners still results in exactly-once Apply
// (idempotent re-delivery), whether it lands on an E replica or an E+1
// replica that's new to the transaction.
#[test]
fn test_topology_change_mid_transaction_yields_exactly_once_apply() {
    let e0 = Topology::new(0, vec![shard(vec![1, 2, 3])]);
    let mut mgr = TopologyManager::new(e0);
    let e1 = Topology::new(1, vec![shard(vec![1, 2, 4])]); // node 4 replaces node 3
    mgr.install(e1);
    mgr.acknowledge(1, NodeID(1));
    assert!(mgr.acknowledge(1, NodeID(2))); // 2 of 3 e0 replicas: durable

    let txn_id = txn(10, 1, TxnKind::Write);
    let writes = Writes::from([(Key::from_str("a"), b"v".to_vec())]);

    // Node 4 never existed in epoch 0 and only learns of the transaction
    // once Commit/Apply are re-dispatched under epoch 1's topology.
    let mut node4 = store();
    handle(&mut node4, Payload::Commit { txn_id, execute_at: txn_id.ts, deps: BTreeSet::new(), route: full_route("a") }).unwrap();
    let first = handle(&mut node4, Payload::Apply { txn_id, execute_at: txn_id.ts, deps: BTreeSet::new(), writes: writes.clone(), result: vec![1] }).unwrap();
    assert!(matches!(first, Some(Payload::ApplyOk { .. })));
    assert_eq!(node4.peek(&txn_id).unwrap().status, Status::Applied);

    // A retried dispatch (client never saw the first ApplyOk, say) is
    // answered the same way without re-applying the writes.
    let second = handle(&mut node4, Payload::Apply { txn_id, execute_at: txn_id.ts, deps: BTreeSet::new(), writes, result: vec![1] }).unwrap();
    assert!(matches!(second, Some(Payload::ApplyOk { .. })));
    assert_eq!(node4.peek(&txn_id).unwrap().status, Status::Applied);
}

// 6. WaitOnCommit issued while the TxnId is PreAccepted on two of three
// replicas: completes only once all three have reached >= Committed.
#[test]
fn test_wait_on_commit_completes_only_after_all_three_replicas_commit() {
    let txn_id = txn(10, 1, TxnKind::Write);
    let requester = NodeID(99);
    let mut replicas: Vec<CommandStore> = (0..3).map(|_| store()).collect();

    for (i, cs) in replicas.iter_mut().take(2).enumerate() {
        handle(
            cs,
            Payload::PreAccept { txn_id, route: full_route("a"), read_keys: Keys::new(vec![]), write_keys: Keys::new(vec![Key::from_str("a")]) },
        )
        .unwrap();
        let (reply, waiters) = handle_and_wake(cs, requester, Payload::WaitOnCommit { txn_id, scope: Keys::new(vec![Key::from_str("a")]) }).unwrap();
        assert!(reply.is_none(), "replica {i} is only PreAccepted, must not answer yet");
        assert!(waiters.is_empty());
    }
    // Third replica never even saw PreAccept yet.
    let (reply, waiters) = handle_and_wake(&mut replicas[2], requester, Payload::WaitOnCommit { txn_id, scope: Keys::new(vec![Key::from_str("a")]) }).unwrap();
    assert!(reply.is_none());
    assert!(waiters.is_empty());

    let mut completed = 0;
    for cs in replicas.iter_mut() {
        let (_, waiters) = handle_and_wake(cs, requester, Payload::Commit { txn_id, execute_at: txn_id.ts, deps: BTreeSet::new(), route: full_route("a") }).unwrap();
        completed += waiters.len();
    }
    assert_eq!(completed, 3, "each replica must wake its own waiter once it individually commits");
}
