// CommandStore: the single-threaded, per-shard owner of every Command this
// replica knows about (spec §5).
//
// All mutation goes through `CommandStore::with_commands`, which takes a
// PreLoadContext naming the TxnIds/keys an operation needs and a closure
// that receives a SafeCommandStore scoped to exactly that context. There is
// no locking: a CommandStore is only ever touched from the single task that
// owns it, so "the scope I preloaded" is the only safety property that
// needs enforcing, and it's enforced by construction (SafeCommandStore
// simply doesn't expose a way to reach outside what it preloaded).

use std::collections::{BTreeMap, BTreeSet};

use drift_base::{err, Error};

use crate::command::Command;
use crate::routable::{Key, Keys, Range};
use crate::timestamp::TxnId;

/// Names the TxnIds and keys one `with_commands` call needs touched. The
/// CommandStore doesn't currently page anything to disk, so "preload" is a
/// scoping device rather than an I/O optimization -- but it's the seam
/// where that would be added without changing any caller.
#[derive(Clone, Debug, Default)]
pub struct PreLoadContext {
    pub txn_ids: BTreeSet<TxnId>,
    pub keys: Keys,
}

impl PreLoadContext {
    pub fn for_txn(txn_id: TxnId) -> Self {
        let mut txn_ids = BTreeSet::new();
        txn_ids.insert(txn_id);
        PreLoadContext { txn_ids, keys: Keys::new(vec![]) }
    }

    pub fn with_txn(mut self, txn_id: TxnId) -> Self {
        self.txn_ids.insert(txn_id);
        self
    }

    pub fn with_keys(mut self, keys: Keys) -> Self {
        self.keys = self.keys.union(&keys);
        self
    }
}

/// A scoped read-modify-write handle into a CommandStore, live only for the
/// duration of one `with_commands` closure.
pub struct SafeCommandStore<'a> {
    store: &'a mut CommandStore,
    ctx: PreLoadContext,
}

impl<'a> SafeCommandStore<'a> {
    fn check_in_scope(&self, txn_id: &TxnId) -> Result<(), Error> {
        if self.ctx.txn_ids.contains(txn_id) {
            Ok(())
        } else {
            Err(err("txn_id accessed outside its PreLoadContext"))
        }
    }

    pub fn get(&self, txn_id: &TxnId) -> Result<Option<&Command>, Error> {
        self.check_in_scope(txn_id)?;
        Ok(self.store.commands.get(txn_id))
    }

    /// Returns the Command for `txn_id`, creating a fresh NotWitnessed one
    /// if this store has never seen it before.
    pub fn get_or_create(&mut self, txn_id: TxnId) -> Result<&mut Command, Error> {
        self.check_in_scope(&txn_id)?;
        Ok(self
            .store
            .commands
            .entry(txn_id)
            .or_insert_with(|| Command::new(txn_id)))
    }

    /// Registers `listener` to be notified (via `notify`) whenever
    /// `depends_on`'s status changes.
    pub fn register_listener(&mut self, depends_on: TxnId, listener: TxnId) -> Result<(), Error> {
        self.check_in_scope(&depends_on)?;
        let cmd = self
            .store
            .commands
            .entry(depends_on)
            .or_insert_with(|| Command::new(depends_on));
        cmd.listeners.insert(listener);
        Ok(())
    }

    /// Every TxnId transitively reachable from `txn_id` via the listener
    /// relation, visited breadth-first with a visited set so a cycle in the
    /// listener graph (A listens on B which listens on A) terminates
    /// instead of looping.
    pub fn notify(&self, txn_id: TxnId) -> Vec<TxnId> {
        let mut visited = BTreeSet::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(txn_id);
        let mut out = Vec::new();
        while let Some(next) = queue.pop_front() {
            if !visited.insert(next) {
                continue;
            }
            if let Some(cmd) = self.store.commands.get(&next) {
                for &listener in &cmd.listeners {
                    if !visited.contains(&listener) {
                        out.push(listener);
                        queue.push_back(listener);
                    }
                }
            }
        }
        out
    }

    pub fn owned_range(&self) -> &Range {
        &self.store.owned_range
    }
}

/// Owns every Command this replica holds for one disjoint slice of the
/// keyspace -- a real deployment shards CommandStores so each runs on its
/// own single-threaded executor with no cross-store locking (spec §5:
/// "operations within one CommandStore never block on another").
#[derive(Clone, Debug)]
pub struct CommandStore {
    pub id: u64,
    pub owned_range: Range,
    commands: BTreeMap<TxnId, Command>,
    /// Requesters blocked in `WaitOnCommit` on a TxnId not yet Committed
    /// (spec §4.5). Keyed separately from `Command::listeners`, which
    /// tracks intra-store dependency listeners rather than external nodes.
    wait_on_commit: BTreeMap<TxnId, BTreeSet<drift_net::NodeID>>,
    /// Set once an invariant violation (spec §7: status regression,
    /// executeAt/deps changing post-Commit, ...) has been observed on this
    /// store. A poisoned store still answers reads (`peek`, `len`) but
    /// `replica::handle` refuses to drive any further transition through
    /// it, matching "the node halts its affected CommandStore and signals
    /// the operator" rather than silently continuing against state that
    /// may already be inconsistent.
    poisoned: Option<String>,
}

impl CommandStore {
    pub fn new(id: u64, owned_range: Range) -> Self {
        CommandStore {
            id,
            owned_range,
            commands: BTreeMap::new(),
            wait_on_commit: BTreeMap::new(),
            poisoned: None,
        }
    }

    pub fn poisoned(&self) -> Option<&str> {
        self.poisoned.as_deref()
    }

    /// Halts this store. Idempotent: the first invariant violation wins,
    /// later ones don't overwrite the recorded reason.
    pub fn poison(&mut self, reason: impl Into<String>) {
        if self.poisoned.is_none() {
            self.poisoned = Some(reason.into());
        }
    }

    /// Registers `requester` to be returned by `take_ready_waiters` once
    /// `txn_id` reaches Committed or later. Returns true if the command is
    /// already there, so the caller can reply immediately instead.
    pub fn register_wait_on_commit(&mut self, txn_id: TxnId, requester: drift_net::NodeID) -> bool {
        if self.peek(&txn_id).is_some_and(|c| c.status.is_committed_or_later() || c.status.is_terminal()) {
            return true;
        }
        self.wait_on_commit.entry(txn_id).or_default().insert(requester);
        false
    }

    /// Every requester waiting on `txn_id`, removed from the table, if
    /// `txn_id` has now reached Committed or later.
    pub fn take_ready_waiters(&mut self, txn_id: TxnId) -> Vec<drift_net::NodeID> {
        let ready = self
            .peek(&txn_id)
            .is_some_and(|c| c.status.is_committed_or_later() || c.status.is_terminal());
        if !ready {
            return Vec::new();
        }
        self.wait_on_commit
            .remove(&txn_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn contains(&self, txn_id: &TxnId) -> bool {
        self.commands.contains_key(txn_id)
    }

    /// The single mutation entry point: `ctx` names every TxnId the
    /// closure is allowed to touch, and `f` runs with exclusive,
    /// synchronous access to exactly that scope.
    pub fn with_commands<R>(
        &mut self,
        ctx: PreLoadContext,
        f: impl FnOnce(&mut SafeCommandStore) -> R,
    ) -> R {
        let mut safe = SafeCommandStore { store: self, ctx };
        f(&mut safe)
    }

    /// A read-only peek outside the PreLoadContext machinery, for callers
    /// (the progress log, recovery) that only need to inspect state rather
    /// than scope a read-modify-write.
    pub fn peek(&self, txn_id: &TxnId) -> Option<&Command> {
        self.commands.get(txn_id)
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.owned_range.contains_key(key)
    }

    /// Every command other than `exclude` whose route overlaps `route`'s
    /// touched range-set -- the candidate conflict set a PreAccept needs
    /// to fold into `witnessedExecuteAt`/`deps` (spec.md §4.2).
    pub fn conflicting_with(&self, route: &crate::routable::Route, exclude: TxnId) -> Vec<TxnId> {
        let target = route.to_maximal_unseekables();
        self.commands
            .iter()
            .filter(|(id, cmd)| {
                **id != exclude
                    && cmd
                        .route
                        .as_ref()
                        .is_some_and(|r| r.to_maximal_unseekables().intersects(&target))
            })
            .map(|(id, _)| *id)
            .collect()
    }
}
