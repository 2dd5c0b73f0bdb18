// WaitOnCommit (spec.md §4.5): a cross-replica blocking primitive. A
// requester sends WaitOnCommit(TxnId, scope) to every replica of `scope`;
// each replica replies immediately if the command is already at or beyond
// Committed, and otherwise defers the reply until it gets there.
//
// The requester side needs a way to tell "every dispatch has at least
// been sent" apart from "every reply is in", because a reply can arrive
// before the dispatch loop that sent it has finished iterating the rest
// of the shard list (a local, same-process replica answering instantly is
// the common case). `PendingCount` is the symmetric counter spec.md
// describes: it starts biased by one extra count representing "the
// dispatch loop itself hasn't finished", so the completion condition can
// never fire purely from fast replies outracing the loop.

pub use drift_net::NodeID;

use crate::command_store::CommandStore;
use crate::message::Payload;
use crate::timestamp::TxnId;

/// Replica-side handler for an incoming `WaitOnCommit`. Returns
/// `Some(WaitOnCommitOk)` if the command has already reached Committed (or
/// any later/terminal status); otherwise registers `requester` and
/// returns `None` -- the reply is produced later by `drain_ready_waiters`
/// once the command actually commits.
pub fn handle_wait_on_commit(store: &mut CommandStore, txn_id: TxnId, requester: NodeID) -> Option<Payload> {
    if store.register_wait_on_commit(txn_id, requester) {
        Some(Payload::WaitOnCommitOk { txn_id })
    } else {
        None
    }
}

/// Call after any transition that might have pushed `txn_id` to Committed
/// or later (handle_commit, recovery's re-commit, etc). Returns one
/// `(requester, WaitOnCommitOk)` per node that was waiting.
pub fn drain_ready_waiters(store: &mut CommandStore, txn_id: TxnId) -> Vec<(NodeID, Payload)> {
    store
        .take_ready_waiters(txn_id)
        .into_iter()
        .map(|requester| (requester, Payload::WaitOnCommitOk { txn_id }))
        .collect()
}

/// The requester-side pending counter for one outstanding WaitOnCommit
/// broadcast across however many replicas it was sent to. See the module
/// doc for the biasing trick.
#[derive(Clone, Copy, Debug)]
pub struct PendingCount(i64);

impl PendingCount {
    /// Call once before dispatching any requests.
    pub fn begin() -> Self {
        PendingCount(1)
    }

    /// Call once per outbound WaitOnCommit request sent.
    pub fn dispatch(&mut self) {
        self.0 += 1;
    }

    /// Call once the dispatch loop has sent every request it's going to
    /// send. Returns true if that alone completes the wait (every reply
    /// had already arrived).
    pub fn finish_dispatch_loop(&mut self) -> bool {
        self.0 -= 1;
        self.0 == 0
    }

    /// Call once per WaitOnCommitOk received. Returns true exactly once,
    /// the moment the last outstanding thing (a dispatch or the loop
    /// itself) completes.
    pub fn ack(&mut self) -> bool {
        self.0 -= 1;
        self.0 == 0
    }

    pub fn is_complete(&self) -> bool {
        self.0 <= 0
    }
}
