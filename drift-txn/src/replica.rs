// Replica-side transition table (spec §4.3): one incoming Payload maps to
// exactly one Command state transition, executed inside a PreLoadContext
// scoped to the TxnId (and, for Commit, its dependencies).

use std::collections::BTreeSet;

use drift_base::{err, Error};

use crate::command::Status;
use crate::command_store::{CommandStore, PreLoadContext};
use crate::message::Payload;
use crate::timestamp::{ExecuteAt, Timestamp, TxnId};

/// witnessedExecuteAt = max(TxnId, max(conflicting.executeAt) + 1) over
/// every conflicting command already known to this store (spec.md §4.2).
fn witness_execute_at(txn_id: TxnId, conflicts: &[(TxnId, Option<ExecuteAt>)]) -> ExecuteAt {
    let mut at = txn_id.ts;
    for (_, execute_at) in conflicts {
        if let Some(e) = execute_at {
            let bumped = Timestamp::new(e.epoch, e.hlc + 1, e.node);
            if bumped > at {
                at = bumped;
            }
        }
    }
    at
}

/// After a Commit or Apply, check whether `txn_id` now has every
/// dependency (known to this store) Applied, and if so mark it
/// ReadyToExecute. Reads via `peek` rather than a PreLoadContext scope
/// since this is an internal readiness check spanning potentially many
/// commands, mirroring how the progress log and recovery also read
/// across the store directly (spec.md §4.6).
fn try_advance_ready(store: &mut CommandStore, txn_id: TxnId) -> Result<(), Error> {
    let ready = match store.peek(&txn_id) {
        Some(cmd) if cmd.status == Status::Committed => cmd
            .dependencies
            .iter()
            .all(|d| store.peek(d).is_some_and(|c| c.status == Status::Applied)),
        _ => false,
    };
    if ready {
        store.with_commands(PreLoadContext::for_txn(txn_id), |safe| {
            safe.get_or_create(txn_id)?.mark_ready_to_execute()
        })?;
    }
    Ok(())
}

/// Like `handle`, but also drains any `WaitOnCommit` requesters that the
/// resulting transition just unblocked (spec.md §4.5). Commit, Accept (via
/// a coordinator that skipped straight to a quorum), and recovery's
/// re-commit are the transitions that can push a command to Committed or
/// later, so this is the entry point a dispatcher should prefer over the
/// bare `handle` whenever it also owns `WaitOnCommit` bookkeeping for this
/// store.
pub fn handle_and_wake(
    store: &mut CommandStore,
    src: drift_net::NodeID,
    msg: Payload,
) -> Result<(Option<Payload>, Vec<(drift_net::NodeID, Payload)>), Error> {
    if let Payload::WaitOnCommit { txn_id, .. } = msg {
        if let Some(reason) = store.poisoned() {
            return Err(err(format!("CommandStore {} halted: {reason}", store.id)));
        }
        let reply = crate::wait_on_commit::handle_wait_on_commit(store, txn_id, src);
        return Ok((reply, Vec::new()));
    }
    let txn_id = msg.txn_id();
    let reply = handle(store, msg)?;
    let waiters = crate::wait_on_commit::drain_ready_waiters(store, txn_id);
    Ok((reply, waiters))
}

/// Dispatches one message to the transition it drives. spec.md §7's
/// "invariant violation... fatal; the node halts its affected CommandStore"
/// is enforced here: any Err surfacing from a transition poisons the store,
/// and every later call is refused before it touches `store` at all.
pub fn handle(store: &mut CommandStore, msg: Payload) -> Result<Option<Payload>, Error> {
    if let Some(reason) = store.poisoned() {
        return Err(err(format!("CommandStore {} halted: {reason}", store.id)));
    }
    let result = dispatch(store, msg);
    if let Err(e) = &result {
        store.poison(format!("{e:?}"));
    }
    result
}

fn dispatch(store: &mut CommandStore, msg: Payload) -> Result<Option<Payload>, Error> {
    match msg {
        Payload::PreAccept { txn_id, route, .. } => Ok(Some(handle_pre_accept(store, txn_id, route)?)),
        Payload::Accept { txn_id, ballot, route, execute_at, deps } => {
            Ok(Some(handle_accept(store, txn_id, ballot, route, execute_at, deps)?))
        }
        Payload::Commit { txn_id, execute_at, deps, route } => {
            handle_commit(store, txn_id, execute_at, deps, route)?;
            Ok(None)
        }
        Payload::Apply { txn_id, execute_at, deps, writes, result } => {
            Ok(Some(handle_apply(store, txn_id, execute_at, deps, writes, result)?))
        }
        Payload::Invalidate { txn_id, ballot } => Ok(Some(handle_invalidate(store, txn_id, ballot)?)),
        Payload::BeginRecovery { txn_id, ballot } => Ok(Some(handle_begin_recovery(store, txn_id, ballot)?)),
        // WaitOnCommit needs the envelope's source node, which this
        // status-transition entry point doesn't see, and Read needs the
        // embedder's Store (spec.md §6.2), which this entry point never
        // touches -- the dispatcher handles both directly instead, using
        // `Msg::src` for the former and `is_ready_to_read`/`Store::read`
        // for the latter (spec.md §4.5, §4.2).
        other => Err(err(format!(
            "replica transition handler given a message it doesn't drive a transition for: {other:?}"
        ))),
    }
}

/// Read requests aren't a status transition (the table in spec.md §4.3
/// only covers PreAccept/Accept/Commit/Apply/Invalidate): a Read just asks
/// whether this replica's copy of `txn_id` has reached ReadyToExecute --
/// "When all local deps are Applied ... the command enters ReadyToExecute.
/// A Read(TxnId) request then collects the values" (spec.md §4.2). A
/// replica that has gone on to PreApplied/Applied can still answer (it
/// caught up past the point a Read would have been useful, but the data
/// is still there). Actually fetching the values is the caller's job,
/// since that requires the embedder's `Store`, which a `CommandStore`
/// never holds.
pub fn is_ready_to_read(store: &CommandStore, txn_id: TxnId) -> bool {
    store.peek(&txn_id).is_some_and(|c| {
        matches!(c.status, Status::ReadyToExecute | Status::PreApplied | Status::Applied)
    })
}

fn handle_pre_accept(
    store: &mut CommandStore,
    txn_id: TxnId,
    route: crate::routable::Route,
) -> Result<Payload, Error> {
    let conflicts: Vec<(TxnId, Option<ExecuteAt>)> = store
        .conflicting_with(&route, txn_id)
        .into_iter()
        .map(|id| (id, store.peek(&id).and_then(|c| c.execute_at)))
        .collect();
    let execute_at = witness_execute_at(txn_id, &conflicts);
    let mut deps = BTreeSet::new();
    for (other_id, other_execute_at) in &conflicts {
        let strictly_smaller = other_execute_at.is_some_and(|e| e < txn_id.ts);
        if !strictly_smaller {
            deps.insert(*other_id);
        }
    }

    let status = store.with_commands(PreLoadContext::for_txn(txn_id), |safe| {
        let cmd = safe.get_or_create(txn_id)?;
        cmd.witness_pre_accept(route, execute_at, deps.clone())?;
        Ok::<Status, Error>(cmd.status)
    })?;

    if status != Status::PreAccepted {
        let promised = store.peek(&txn_id).map(|c| c.promised_ballot).unwrap_or(txn_id.ts);
        return Ok(Payload::Nack { txn_id, status, promised_ballot: promised });
    }
    Ok(Payload::PreAcceptOk { txn_id, execute_at, deps })
}

fn handle_accept(
    store: &mut CommandStore,
    txn_id: TxnId,
    ballot: crate::timestamp::Ballot,
    route: crate::routable::Route,
    execute_at: ExecuteAt,
    deps: BTreeSet<TxnId>,
) -> Result<Payload, Error> {
    let (accepted, promised) = store.with_commands(PreLoadContext::for_txn(txn_id), |safe| {
        let cmd = safe.get_or_create(txn_id)?;
        let ok = cmd.accept(ballot, route, execute_at, deps.clone())?;
        Ok::<(bool, crate::timestamp::Ballot), Error>((ok, cmd.promised_ballot))
    })?;

    if accepted {
        Ok(Payload::AcceptOk { txn_id, deps })
    } else {
        Ok(Payload::AcceptNack { txn_id, max_promised: promised })
    }
}

fn handle_commit(
    store: &mut CommandStore,
    txn_id: TxnId,
    execute_at: ExecuteAt,
    deps: BTreeSet<TxnId>,
    route: crate::routable::Route,
) -> Result<(), Error> {
    let mut ctx = PreLoadContext::for_txn(txn_id);
    for d in &deps {
        ctx = ctx.with_txn(*d);
    }
    store.with_commands(ctx, |safe| -> Result<(), Error> {
        safe.get_or_create(txn_id)?.commit(execute_at, deps.clone(), route)?;
        for d in &deps {
            safe.register_listener(*d, txn_id)?;
        }
        Ok(())
    })?;
    try_advance_ready(store, txn_id)
}

fn handle_apply(
    store: &mut CommandStore,
    txn_id: TxnId,
    execute_at: ExecuteAt,
    deps: BTreeSet<TxnId>,
    writes: crate::command::Writes,
    result: Vec<u8>,
) -> Result<Payload, Error> {
    // Apply is only a valid transition from Committed or later (spec.md
    // §4.3: "— (must Commit first)" for every earlier row); anything else
    // is an ignored transition that Nacks with current state, not an Error.
    let (status, promised) = store.with_commands(PreLoadContext::for_txn(txn_id), |safe| {
        let cmd = safe.get_or_create(txn_id)?;
        Ok::<(Status, crate::timestamp::Ballot), Error>((cmd.status, cmd.promised_ballot))
    })?;
    if !status.is_committed_or_later() {
        return Ok(Payload::Nack { txn_id, status, promised_ballot: promised });
    }

    store.with_commands(PreLoadContext::for_txn(txn_id), |safe| -> Result<(), Error> {
        let cmd = safe.get_or_create(txn_id)?;
        if let Some(existing) = cmd.execute_at {
            if existing != execute_at {
                return Err(err("Apply executeAt disagrees with prior Commit"));
            }
        }
        if cmd.dependencies.is_empty() && !deps.is_empty() && cmd.status != Status::Applied {
            cmd.dependencies = deps.clone();
        }
        cmd.apply(writes, result)
    })?;

    let listeners = store.with_commands(PreLoadContext::default(), |safe| safe.notify(txn_id));
    for listener in listeners {
        try_advance_ready(store, listener)?;
    }

    Ok(Payload::ApplyOk { txn_id })
}

fn handle_invalidate(store: &mut CommandStore, txn_id: TxnId, ballot: crate::timestamp::Ballot) -> Result<Payload, Error> {
    let (invalidated, status, promised) = store.with_commands(PreLoadContext::for_txn(txn_id), |safe| {
        let cmd = safe.get_or_create(txn_id)?;
        let ok = cmd.invalidate(ballot)?;
        Ok::<(bool, Status, crate::timestamp::Ballot), Error>((ok, cmd.status, cmd.promised_ballot))
    })?;

    if invalidated {
        Ok(Payload::InvalidateOk { txn_id })
    } else {
        Ok(Payload::Nack { txn_id, status, promised_ballot: promised })
    }
}

fn handle_begin_recovery(store: &mut CommandStore, txn_id: TxnId, ballot: crate::timestamp::Ballot) -> Result<Payload, Error> {
    let (status, accepted_ballot, execute_at, deps) =
        store.with_commands(PreLoadContext::for_txn(txn_id), |safe| {
            let cmd = safe.get_or_create(txn_id)?;
            cmd.promise(ballot)?;
            Ok::<_, Error>((cmd.status, cmd.accepted_ballot, cmd.execute_at, cmd.dependencies.clone()))
        })?;
    Ok(Payload::RecoveryReply { txn_id, status, accepted_ballot, execute_at, deps })
}
