// Recovery (spec.md §4.4): when the progress log observes a TxnId stalled
// below Committed past its deadline, the homeKey-owning replica runs this
// in place of the original coordinator. It picks a fresh ballot, collects
// the highest-ballot outcome known to a quorum of each touched shard, and
// either resumes Accept with that outcome or declares the transaction
// Invalidated if no replica ever witnessed it.
//
// This folds in what would otherwise be a generic reconfiguration-style
// Paxos module: recovery here only ever re-proposes a ballot for one
// TxnId's existing (executeAt, deps) -- there's no separate membership-
// change protocol in scope, so a standalone Paxos abstraction would add a
// layer of indirection with nothing on the other side of it.

use std::collections::{BTreeMap, BTreeSet};

use drift_net::NodeID;

use crate::command::Status;
use crate::message::Payload;
use crate::routable::Route;
use crate::timestamp::{Ballot, ExecuteAt, TxnId};
use crate::topology::Shard;

#[derive(Clone, Debug)]
struct RecoveryVote {
    status: Status,
    accepted_ballot: Ballot,
    execute_at: Option<ExecuteAt>,
    deps: BTreeSet<TxnId>,
}

struct RecoveryShardState {
    replicas: Vec<NodeID>,
    quorum_size: usize,
    votes: BTreeMap<NodeID, RecoveryVote>,
}

impl RecoveryShardState {
    fn new(shard: &Shard) -> Self {
        RecoveryShardState {
            replicas: shard.replicas.clone(),
            quorum_size: shard.quorum_size(),
            votes: BTreeMap::new(),
        }
    }

    fn owns(&self, node: NodeID) -> bool {
        self.replicas.contains(&node)
    }

    fn has_quorum(&self) -> bool {
        self.votes.len() >= self.quorum_size
    }

    fn highest_ballot_vote(&self) -> Option<&RecoveryVote> {
        self.votes.values().max_by_key(|v| v.accepted_ballot)
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum RecoveryOutcome {
    /// Evidence exists that a prior coordinator could have committed this
    /// value: re-run Accept with it (spec.md: "Recovery must commit V or
    /// prove V unreachable").
    ReAccept { execute_at: ExecuteAt, deps: BTreeSet<TxnId> },
    /// No replica ever witnessed the transaction as PreAccepted or later:
    /// safe to invalidate.
    Invalidate,
}

pub struct RecoveryCoordinator {
    pub txn_id: TxnId,
    pub route: Route,
    ballot: Ballot,
    shards: Vec<RecoveryShardState>,
}

impl RecoveryCoordinator {
    pub fn start(
        txn_id: TxnId,
        route: Route,
        ballot: Ballot,
        touched_shards: &[&Shard],
    ) -> (Self, Vec<(NodeID, Payload)>) {
        let shards: Vec<RecoveryShardState> =
            touched_shards.iter().map(|s| RecoveryShardState::new(s)).collect();
        let mut outbound = Vec::new();
        for shard in &shards {
            for &node in &shard.replicas {
                outbound.push((node, Payload::BeginRecovery { txn_id, ballot }));
            }
        }
        (RecoveryCoordinator { txn_id, route, ballot, shards }, outbound)
    }

    fn shard_mut(&mut self, node: NodeID) -> Option<&mut RecoveryShardState> {
        self.shards.iter_mut().find(|s| s.owns(node))
    }

    pub fn on_reply(&mut self, src: NodeID, payload: Payload) -> Option<RecoveryOutcome> {
        if let Payload::RecoveryReply { status, accepted_ballot, execute_at, deps, .. } = payload {
            if let Some(shard) = self.shard_mut(src) {
                shard.votes.insert(src, RecoveryVote { status, accepted_ballot, execute_at, deps });
            }
        }
        self.try_resolve()
    }

    fn try_resolve(&self) -> Option<RecoveryOutcome> {
        if !self.shards.iter().all(RecoveryShardState::has_quorum) {
            return None;
        }
        let mut any_witnessed = false;
        let mut execute_at = self.txn_id.ts;
        let mut deps = BTreeSet::new();
        for shard in &self.shards {
            let Some(best) = shard.highest_ballot_vote() else { continue };
            if best.status == Status::NotWitnessed {
                continue;
            }
            any_witnessed = true;
            if let Some(at) = best.execute_at {
                if at > execute_at {
                    execute_at = at;
                }
            }
            deps.extend(best.deps.iter().copied());
        }
        Some(if any_witnessed {
            RecoveryOutcome::ReAccept { execute_at, deps }
        } else {
            RecoveryOutcome::Invalidate
        })
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot
    }
}
