// Protocol payloads (spec §6.1), realized as one enum so `drift_net::Msg<Payload>`
// carries any phase's request or reply over the same wire envelope.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::command::{Status, Writes};
use crate::routable::{Keys, Route};
use crate::timestamp::{Ballot, ExecuteAt, TxnId};

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Payload {
    PreAccept {
        txn_id: TxnId,
        route: Route,
        read_keys: Keys,
        write_keys: Keys,
    },
    PreAcceptOk {
        txn_id: TxnId,
        execute_at: ExecuteAt,
        deps: BTreeSet<TxnId>,
    },
    PreAcceptNack {
        txn_id: TxnId,
    },

    Accept {
        txn_id: TxnId,
        ballot: Ballot,
        route: Route,
        execute_at: ExecuteAt,
        deps: BTreeSet<TxnId>,
    },
    AcceptOk {
        txn_id: TxnId,
        deps: BTreeSet<TxnId>,
    },
    AcceptNack {
        txn_id: TxnId,
        max_promised: Ballot,
    },

    /// No reply (spec.md §6.1): every replica transitions to Committed and
    /// registers dependency listeners, but the coordinator doesn't wait on
    /// an ack before moving to Execute.
    Commit {
        txn_id: TxnId,
        execute_at: ExecuteAt,
        deps: BTreeSet<TxnId>,
        route: Route,
    },

    Read {
        txn_id: TxnId,
        keys: Keys,
    },
    ReadOk {
        txn_id: TxnId,
        values: BTreeMap<Vec<u8>, Vec<u8>>,
    },
    ReadNack {
        txn_id: TxnId,
    },

    Apply {
        txn_id: TxnId,
        execute_at: ExecuteAt,
        deps: BTreeSet<TxnId>,
        writes: Writes,
        result: Vec<u8>,
    },
    ApplyOk {
        txn_id: TxnId,
    },

    BeginRecovery {
        txn_id: TxnId,
        ballot: Ballot,
    },
    RecoveryReply {
        txn_id: TxnId,
        status: Status,
        accepted_ballot: Ballot,
        execute_at: Option<ExecuteAt>,
        deps: BTreeSet<TxnId>,
    },

    WaitOnCommit {
        txn_id: TxnId,
        scope: Keys,
    },
    WaitOnCommitOk {
        txn_id: TxnId,
    },

    Invalidate {
        txn_id: TxnId,
        ballot: Ballot,
    },
    InvalidateOk {
        txn_id: TxnId,
    },

    /// A Nack carrying the replica's current status/ballot so the
    /// coordinator can catch up, per the "invalid transitions ... produce
    /// a Nack that includes the current status and ballot" rule (spec.md
    /// §4.3).
    Nack {
        txn_id: TxnId,
        status: Status,
        promised_ballot: Ballot,
    },
}

impl Payload {
    pub fn txn_id(&self) -> TxnId {
        match self {
            Payload::PreAccept { txn_id, .. }
            | Payload::PreAcceptOk { txn_id, .. }
            | Payload::PreAcceptNack { txn_id }
            | Payload::Accept { txn_id, .. }
            | Payload::AcceptOk { txn_id, .. }
            | Payload::AcceptNack { txn_id, .. }
            | Payload::Commit { txn_id, .. }
            | Payload::Read { txn_id, .. }
            | Payload::ReadOk { txn_id, .. }
            | Payload::ReadNack { txn_id }
            | Payload::Apply { txn_id, .. }
            | Payload::ApplyOk { txn_id }
            | Payload::BeginRecovery { txn_id, .. }
            | Payload::RecoveryReply { txn_id, .. }
            | Payload::WaitOnCommit { txn_id, .. }
            | Payload::WaitOnCommitOk { txn_id }
            | Payload::Invalidate { txn_id, .. }
            | Payload::InvalidateOk { txn_id }
            | Payload::Nack { txn_id, .. } => *txn_id,
        }
    }
}
