#![allow(dead_code)]

// A leaderless variant of the Accord/EPaxos family: any replica can
// coordinate any transaction, transactions are assigned a unique
// identity before any consensus runs, and agreement is reached on a
// per-transaction *execution timestamp* rather than on a slot in a
// shared log.
//
// The general sequence looks like this:
//
//  1. A transaction begins at whichever replica its client happened to
//     reach. That replica is the coordinator for this attempt only:
//     nothing about its identity is durable, and recovery may hand
//     coordination to a different replica entirely.
//
//  2. The coordinator mints a TxnId from its hybrid-logical clock and
//     sends PreAccept to every shard the transaction touches. Each
//     replica witnesses the transaction, proposes an executeAt (at
//     least the TxnId, usually higher if it has seen conflicting
//     transactions), and reports back its accumulated dependencies.
//
//  3. If every shard's fast-path electorate agrees on the same
//     executeAt, the coordinator commits directly off those replies
//     (the fast path). Otherwise it runs one round of Accept to fix an
//     executeAt >= every proposal it saw, then commits that.
//
//  4. Once committed, a transaction executes only after every one of
//     its dependencies (restricted to the executing shard) has
//     itself applied -- this is what makes execution order agree with
//     the committed executeAt order without requiring a single global
//     sequencer.
//
//  5. If a coordinator disappears mid-protocol, any other replica can
//     recover the transaction: it picks a higher ballot, re-collects
//     state from a quorum, and either resumes Accept with the
//     highest-ballot outcome it finds or proposes Invalidate if no
//     replica has witnessed enough to make progress safe.
//
// This module tree builds that protocol bottom-up: timestamps and
// ballots first, then the key/range routing algebra used to address
// shards, then topology (shard membership and quorum math), then the
// per-replica Command record and its CommandStore, and finally the
// coordinator/replica/recovery state machines that drive Commands
// through PreAccept -> Accept -> Commit -> Execute -> Apply.

mod timestamp;
mod routable;
mod topology;
mod command;
mod command_store;
mod coordinator;
mod message;
mod replica;
mod recovery;
mod progress;
mod wait_on_commit;
mod store;

pub use command::{Command, Status, Writes};
pub use command_store::{CommandStore, PreLoadContext, SafeCommandStore};
pub use coordinator::{Coordinator, CoordinatorStep};
pub use message::Payload;
pub use progress::{ProgressAction, ProgressLog};
pub use recovery::{RecoveryCoordinator, RecoveryOutcome};
pub use replica::{
    handle as handle_replica_message, handle_and_wake as handle_replica_message_and_wake,
    is_ready_to_read,
};
pub use routable::{
    FullRoute, Key, Keys, PartialRoute, Range, Ranges, Route, Seekables, Unseekables,
};
pub use store::Store;
pub use timestamp::{Ballot, Clock, ExecuteAt, Timestamp, TxnId, TxnKind};
pub use topology::{Shard, Topology, TopologyManager};
pub use wait_on_commit::{PendingCount, handle_wait_on_commit, drain_ready_waiters};

use std::collections::BTreeSet;

use drift_net::NodeID;

pub type NodeSet = BTreeSet<NodeID>;

