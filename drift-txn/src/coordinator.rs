// Coordinator state machines (spec.md §4.2): one Coordinator instance per
// client transaction attempt, driving PreAccept -> Accept -> Commit ->
// Execute -> Apply across every shard the transaction's Route touches.
//
// The coordinator itself never blocks: it's fed replies via `on_reply` and
// returns a `CoordinatorStep` describing what to send next, mirroring the
// pull-based `Node`/`IOQueues` style the transport layer already uses
// rather than an async task per transaction.

use std::collections::{BTreeMap, BTreeSet};

use drift_net::NodeID;

use drift_base::Error;

use crate::command::Writes;
use crate::message::Payload;
use crate::routable::{Keys, Route};
use crate::timestamp::{Ballot, ExecuteAt, Timestamp, TxnId};
use crate::topology::Shard;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    PreAccept,
    Accept,
    AwaitingReads,
    AwaitingApply,
    Done,
}

#[derive(Debug)]
struct ShardState {
    replicas: Vec<NodeID>,
    fast_path_electorate: Vec<NodeID>,
    required_fast_path_size: usize,
    quorum_size: usize,
    pre_accept_replies: BTreeMap<NodeID, (ExecuteAt, BTreeSet<TxnId>)>,
    accept_oks: BTreeSet<NodeID>,
    accept_nacks: BTreeMap<NodeID, Ballot>,
    read_oks: BTreeSet<NodeID>,
    apply_oks: BTreeSet<NodeID>,
}

impl ShardState {
    fn new(shard: &Shard) -> Self {
        ShardState {
            replicas: shard.replicas.clone(),
            fast_path_electorate: shard.fast_path_electorate.clone(),
            required_fast_path_size: shard.required_fast_path_size,
            quorum_size: shard.quorum_size(),
            pre_accept_replies: BTreeMap::new(),
            accept_oks: BTreeSet::new(),
            accept_nacks: BTreeMap::new(),
            read_oks: BTreeSet::new(),
            apply_oks: BTreeSet::new(),
        }
    }

    fn owns(&self, node: NodeID) -> bool {
        self.replicas.contains(&node)
    }

    /// Some((executeAt, deps)) iff the fast-path electorate has reported a
    /// unanimous (executeAt == TxnId, deps) in sufficient number.
    fn fast_path_result(&self, txn_id: TxnId) -> Option<BTreeSet<TxnId>> {
        let votes: Vec<&(ExecuteAt, BTreeSet<TxnId>)> = self
            .fast_path_electorate
            .iter()
            .filter_map(|n| self.pre_accept_replies.get(n))
            .collect();
        if votes.len() < self.required_fast_path_size {
            return None;
        }
        let (first_at, first_deps) = votes[0];
        if *first_at != txn_id.ts {
            return None;
        }
        if votes.iter().all(|(at, deps)| *at == txn_id.ts && deps == first_deps) {
            Some(first_deps.clone())
        } else {
            None
        }
    }

    fn has_pre_accept_quorum(&self) -> bool {
        self.pre_accept_replies.len() >= self.quorum_size
    }

    fn slow_path_aggregate(&self, txn_id: TxnId) -> (ExecuteAt, BTreeSet<TxnId>) {
        let mut execute_at = txn_id.ts;
        let mut deps = BTreeSet::new();
        for (at, d) in self.pre_accept_replies.values() {
            if *at > execute_at {
                execute_at = *at;
            }
            deps.extend(d.iter().copied());
        }
        (execute_at, deps)
    }

    fn has_accept_quorum(&self) -> bool {
        self.accept_oks.len() >= self.quorum_size
    }

    fn accept_rejected_by_quorum(&self) -> bool {
        self.accept_nacks.len() >= self.quorum_size
    }

    fn has_read_quorum(&self) -> bool {
        self.read_oks.len() >= self.quorum_size
    }

    fn has_apply_quorum(&self) -> bool {
        self.apply_oks.len() >= self.quorum_size
    }
}

#[derive(Debug)]
pub enum CoordinatorStep {
    /// Send these messages; no phase change the caller needs to act on.
    Send(Vec<(NodeID, Payload)>),
    /// A read quorum has been reached in every read shard; the caller
    /// should compute writes/result against the embedder's data store and
    /// call `Coordinator::begin_apply`.
    ReadyForApply,
    /// A write quorum acknowledged Apply in every write shard.
    Applied(Vec<u8>),
    Invalidated,
    /// Three consecutive Accept-quorum rejections (spec.md §4.2): hand off
    /// to Recovery.
    EscalateToRecovery,
    NoOp,
}

pub struct Coordinator {
    pub txn_id: TxnId,
    pub route: Route,
    read_keys: Keys,
    write_keys: Keys,
    phase: Phase,
    shards: Vec<ShardState>,
    ballot: Ballot,
    consecutive_accept_rejections: u32,
    execute_at: Option<ExecuteAt>,
    deps: BTreeSet<TxnId>,
}

impl Coordinator {
    /// Starts a fresh attempt, returning the initial PreAccept broadcast to
    /// every replica of every shard the route touches.
    pub fn start(
        txn_id: TxnId,
        route: Route,
        read_keys: Keys,
        write_keys: Keys,
        touched_shards: &[&Shard],
    ) -> (Self, Vec<(NodeID, Payload)>) {
        let shards: Vec<ShardState> = touched_shards.iter().map(|s| ShardState::new(s)).collect();
        let mut outbound = Vec::new();
        for shard in &shards {
            for &node in &shard.replicas {
                outbound.push((
                    node,
                    Payload::PreAccept {
                        txn_id,
                        route: route.clone(),
                        read_keys: read_keys.clone(),
                        write_keys: write_keys.clone(),
                    },
                ));
            }
        }
        let coordinator = Coordinator {
            txn_id,
            route,
            read_keys,
            write_keys,
            phase: Phase::PreAccept,
            shards,
            ballot: txn_id.ts,
            consecutive_accept_rejections: 0,
            execute_at: None,
            deps: BTreeSet::new(),
        };
        (coordinator, outbound)
    }

    fn shard_mut(&mut self, node: NodeID) -> Option<&mut ShardState> {
        self.shards.iter_mut().find(|s| s.owns(node))
    }

    pub fn on_reply(&mut self, src: NodeID, payload: Payload) -> Result<CoordinatorStep, Error> {
        match (self.phase, payload) {
            (Phase::PreAccept, Payload::PreAcceptOk { execute_at, deps, .. }) => {
                if let Some(shard) = self.shard_mut(src) {
                    shard.pre_accept_replies.insert(src, (execute_at, deps));
                }
                self.try_resolve_pre_accept()
            }
            (Phase::PreAccept, Payload::PreAcceptNack { .. } | Payload::Nack { .. }) => {
                Ok(CoordinatorStep::NoOp)
            }
            (Phase::Accept, Payload::AcceptOk { .. }) => {
                if let Some(shard) = self.shard_mut(src) {
                    shard.accept_oks.insert(src);
                }
                self.try_resolve_accept()
            }
            (Phase::Accept, Payload::AcceptNack { max_promised, .. }) => {
                if let Some(shard) = self.shard_mut(src) {
                    shard.accept_nacks.insert(src, max_promised);
                }
                self.try_resolve_accept()
            }
            (Phase::AwaitingReads, Payload::ReadOk { .. }) => {
                if let Some(shard) = self.shard_mut(src) {
                    shard.read_oks.insert(src);
                }
                if self.shards.iter().all(ShardState::has_read_quorum) {
                    Ok(CoordinatorStep::ReadyForApply)
                } else {
                    Ok(CoordinatorStep::NoOp)
                }
            }
            (Phase::AwaitingReads, Payload::ReadNack { .. }) => Ok(CoordinatorStep::NoOp),
            (Phase::AwaitingApply, Payload::ApplyOk { .. }) => {
                if let Some(shard) = self.shard_mut(src) {
                    shard.apply_oks.insert(src);
                }
                if self.shards.iter().all(ShardState::has_apply_quorum) {
                    self.phase = Phase::Done;
                    Ok(CoordinatorStep::Applied(vec![]))
                } else {
                    Ok(CoordinatorStep::NoOp)
                }
            }
            _ => Ok(CoordinatorStep::NoOp),
        }
    }

    fn try_resolve_pre_accept(&mut self) -> Result<CoordinatorStep, Error> {
        let all_fast: Option<Vec<BTreeSet<TxnId>>> = self
            .shards
            .iter()
            .map(|s| s.fast_path_result(self.txn_id))
            .collect();
        if let Some(per_shard_deps) = all_fast {
            let deps: BTreeSet<TxnId> = per_shard_deps.into_iter().flatten().collect();
            return Ok(self.commit(self.txn_id.ts, deps));
        }
        if self.shards.iter().all(ShardState::has_pre_accept_quorum) {
            let mut execute_at = self.txn_id.ts;
            let mut deps = BTreeSet::new();
            for shard in &self.shards {
                let (at, d) = shard.slow_path_aggregate(self.txn_id);
                if at > execute_at {
                    execute_at = at;
                }
                deps.extend(d);
            }
            return Ok(self.begin_accept(execute_at, deps));
        }
        Ok(CoordinatorStep::NoOp)
    }

    fn begin_accept(&mut self, execute_at: ExecuteAt, deps: BTreeSet<TxnId>) -> CoordinatorStep {
        self.phase = Phase::Accept;
        self.execute_at = Some(execute_at);
        self.deps = deps.clone();
        let mut outbound = Vec::new();
        for shard in &self.shards {
            for &node in &shard.replicas {
                outbound.push((
                    node,
                    Payload::Accept {
                        txn_id: self.txn_id,
                        ballot: self.ballot,
                        route: self.route.clone(),
                        execute_at,
                        deps: deps.clone(),
                    },
                ));
            }
        }
        CoordinatorStep::Send(outbound)
    }

    fn try_resolve_accept(&mut self) -> Result<CoordinatorStep, Error> {
        if self.shards.iter().all(ShardState::has_accept_quorum) {
            self.consecutive_accept_rejections = 0;
            let execute_at = self.execute_at.unwrap_or(self.txn_id.ts);
            let deps = self.deps.clone();
            return Ok(self.commit(execute_at, deps));
        }
        if self.shards.iter().any(ShardState::accept_rejected_by_quorum) {
            self.consecutive_accept_rejections += 1;
            if self.consecutive_accept_rejections >= 3 {
                return Ok(CoordinatorStep::EscalateToRecovery);
            }
            let known_max = self
                .shards
                .iter()
                .flat_map(|s| s.accept_nacks.values().copied())
                .max()
                .unwrap_or(self.ballot);
            self.ballot = Timestamp::new(
                known_max.epoch,
                known_max.hlc + 1,
                self.ballot.node,
            );
            for shard in &mut self.shards {
                shard.accept_oks.clear();
                shard.accept_nacks.clear();
            }
            let execute_at = self.execute_at.unwrap_or(self.txn_id.ts);
            let deps = self.deps.clone();
            return Ok(self.begin_accept(execute_at, deps));
        }
        Ok(CoordinatorStep::NoOp)
    }

    fn commit(&mut self, execute_at: ExecuteAt, deps: BTreeSet<TxnId>) -> CoordinatorStep {
        self.phase = Phase::AwaitingReads;
        self.execute_at = Some(execute_at);
        self.deps = deps.clone();
        let mut outbound = Vec::new();
        for shard in &self.shards {
            for &node in &shard.replicas {
                outbound.push((
                    node,
                    Payload::Commit {
                        txn_id: self.txn_id,
                        execute_at,
                        deps: deps.clone(),
                        route: self.route.clone(),
                    },
                ));
                outbound.push((
                    node,
                    Payload::Read { txn_id: self.txn_id, keys: self.read_keys.clone() },
                ));
            }
        }
        CoordinatorStep::Send(outbound)
    }

    /// Called once `CoordinatorStep::ReadyForApply` has been observed and
    /// the embedder has computed the write set and result from the
    /// aggregated reads.
    pub fn begin_apply(&mut self, writes: Writes, result: Vec<u8>) -> Vec<(NodeID, Payload)> {
        self.phase = Phase::AwaitingApply;
        let execute_at = self.execute_at.unwrap_or(self.txn_id.ts);
        let deps = self.deps.clone();
        let mut outbound = Vec::new();
        for shard in &self.shards {
            for &node in &shard.replicas {
                outbound.push((
                    node,
                    Payload::Apply {
                        txn_id: self.txn_id,
                        execute_at,
                        deps: deps.clone(),
                        writes: writes.clone(),
                        result: result.clone(),
                    },
                ));
            }
        }
        outbound
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }
}
