// Command: per-replica, per-TxnId state (spec §3.4).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use drift_base::{err, Error};

use crate::routable::{Key, Route};
use crate::timestamp::{Ballot, ExecuteAt, TxnId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Status {
    NotWitnessed,
    PreAccepted,
    Accepted,
    AcceptedInvalidate,
    Committed,
    ReadyToExecute,
    PreApplied,
    Applied,
    Invalidated,
}

impl Status {
    /// Position in the main linear path. `AcceptedInvalidate` and
    /// `Invalidated` are branch states and have no linear rank -- they're
    /// handled explicitly in `can_advance_to`.
    fn linear_rank(&self) -> Option<u8> {
        use Status::*;
        match self {
            NotWitnessed => Some(0),
            PreAccepted => Some(1),
            Accepted => Some(2),
            Committed => Some(3),
            ReadyToExecute => Some(4),
            PreApplied => Some(5),
            Applied => Some(6),
            AcceptedInvalidate | Invalidated => None,
        }
    }

    pub fn is_committed_or_later(&self) -> bool {
        matches!(
            self,
            Status::Committed | Status::ReadyToExecute | Status::PreApplied | Status::Applied
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Applied | Status::Invalidated)
    }

    /// spec.md §3.4: "status progresses monotonically along the partial
    /// order above; Invalidated is reachable only from Accepted or
    /// earlier." Same-status transitions are idempotent and always
    /// allowed (spec §4.3: "All transitions are idempotent on
    /// re-delivery").
    pub fn can_advance_to(&self, to: Status) -> bool {
        if *self == to {
            return true;
        }
        match to {
            Status::Invalidated => {
                matches!(self, Status::AcceptedInvalidate)
                    || self.linear_rank().is_some_and(|r| r <= 2)
            }
            Status::AcceptedInvalidate => self.linear_rank().is_some_and(|r| r <= 2),
            _ => matches!(
                (self.linear_rank(), to.linear_rank()),
                (Some(from_r), Some(to_r)) if to_r > from_r
            ),
        }
    }
}

pub type Writes = std::collections::BTreeMap<Key, Vec<u8>>;

/// Per-replica, per-TxnId record. `listeners` holds the TxnIds of other
/// commands on this store that are blocked on this command's status
/// (spec §9: "Listener graphs... represent commands by CommandStore-local
/// integer indices"). Because this store's commands are already keyed by
/// TxnId in a BTreeMap, the TxnId itself serves as that index -- no
/// separate arena is needed. The relation can be cyclic (A waits on B
/// which waits on A via a different dependency edge); traversal is always
/// an explicit BFS with a visited set (see `CommandStore::notify`), so
/// cycles are harmless.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Command {
    pub txn_id: TxnId,
    pub status: Status,
    pub accepted_ballot: Ballot,
    pub promised_ballot: Ballot,
    pub execute_at: Option<ExecuteAt>,
    pub dependencies: BTreeSet<TxnId>,
    pub route: Option<Route>,
    pub writes: Option<Writes>,
    pub result: Option<Vec<u8>>,
    pub listeners: BTreeSet<TxnId>,
}

impl Command {
    pub fn new(txn_id: TxnId) -> Self {
        Command {
            txn_id,
            status: Status::NotWitnessed,
            // "initial ballot equals the TxnId" (spec.md §3.1).
            accepted_ballot: txn_id.ts,
            promised_ballot: txn_id.ts,
            execute_at: None,
            dependencies: BTreeSet::new(),
            route: None,
            writes: None,
            result: None,
            listeners: BTreeSet::new(),
        }
    }

    fn check_promise(&self, ballot: Ballot) -> Result<(), Error> {
        if ballot < self.promised_ballot {
            return Err(err("ballot is below this command's promised ballot"));
        }
        Ok(())
    }

    /// PreAccept: witness the transaction at `execute_at`/`deps` for the
    /// first time, or idempotently re-witness it.
    pub fn witness_pre_accept(
        &mut self,
        route: Route,
        execute_at: ExecuteAt,
        deps: BTreeSet<TxnId>,
    ) -> Result<(), Error> {
        if !self.status.can_advance_to(Status::PreAccepted) {
            return Ok(()); // stale re-delivery after a later phase: ignored, not an error.
        }
        self.status = Status::PreAccepted;
        self.route = Some(route);
        self.execute_at = Some(execute_at);
        self.dependencies = deps;
        Ok(())
    }

    /// Accept: the replica promises not to accept any lower ballot.
    /// Returns Err only on an invariant violation; a rejected ballot is
    /// communicated by the caller reading `self.promised_ballot` back, per
    /// spec §4.3's Nack-carries-current-state design.
    pub fn accept(
        &mut self,
        ballot: Ballot,
        route: Route,
        execute_at: ExecuteAt,
        deps: BTreeSet<TxnId>,
    ) -> Result<bool, Error> {
        if ballot < self.promised_ballot {
            return Ok(false);
        }
        if !self.status.can_advance_to(Status::Accepted) {
            return Ok(false);
        }
        self.promised_ballot = ballot;
        self.accepted_ballot = ballot;
        self.status = Status::Accepted;
        self.route = Some(route);
        self.execute_at = Some(execute_at);
        self.dependencies = deps;
        Ok(true)
    }

    pub fn promise(&mut self, ballot: Ballot) -> Result<bool, Error> {
        if ballot < self.promised_ballot {
            return Ok(false);
        }
        self.promised_ballot = ballot;
        Ok(true)
    }

    /// Commit: executeAt and deps become immutable from here on (spec
    /// §3.4). A re-delivered Commit with different values is an invariant
    /// violation, not a protocol rejection.
    pub fn commit(
        &mut self,
        execute_at: ExecuteAt,
        deps: BTreeSet<TxnId>,
        route: Route,
    ) -> Result<(), Error> {
        if self.status.is_committed_or_later() {
            if self.execute_at != Some(execute_at) {
                return Err(err("executeAt changed after Commit"));
            }
            if self.dependencies != deps {
                return Err(err("dependencies changed after Commit"));
            }
            return Ok(());
        }
        if !self.status.can_advance_to(Status::Committed) {
            return Ok(());
        }
        self.status = Status::Committed;
        self.execute_at = Some(execute_at);
        self.dependencies = deps;
        self.route = Some(route);
        Ok(())
    }

    /// All local deps are Applied: the command may now run.
    pub fn mark_ready_to_execute(&mut self) -> Result<(), Error> {
        if self.status == Status::ReadyToExecute || self.status.linear_rank().unwrap_or(255) > 4 {
            return Ok(());
        }
        if !self.status.can_advance_to(Status::ReadyToExecute) {
            return Err(err("cannot become ready to execute before Committed"));
        }
        self.status = Status::ReadyToExecute;
        Ok(())
    }

    /// Apply is only reachable from Committed or later ("— (must Commit
    /// first)" in the transition table of spec.md §4.3); the generic rank
    /// comparison in `can_advance_to` isn't enough here since it would
    /// also (wrongly) allow NotWitnessed to "advance" to PreApplied.
    pub fn apply(&mut self, writes: Writes, result: Vec<u8>) -> Result<(), Error> {
        if self.status == Status::Applied {
            return Ok(());
        }
        if !self.status.is_committed_or_later() {
            return Err(err("cannot apply before Commit"));
        }
        self.status = Status::PreApplied;
        self.writes = Some(writes);
        self.result = Some(result);
        self.status = Status::Applied;
        Ok(())
    }

    pub fn invalidate(&mut self, ballot: Ballot) -> Result<bool, Error> {
        self.check_promise(ballot).ok();
        if ballot < self.promised_ballot {
            return Ok(false);
        }
        if !self.status.can_advance_to(Status::Invalidated) {
            return Ok(false);
        }
        self.promised_ballot = ballot;
        self.status = Status::Invalidated;
        Ok(true)
    }
}
