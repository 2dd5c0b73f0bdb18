// Progress log (spec.md §4.6): a per-CommandStore timer wheel keyed by
// TxnId. Every status change reschedules the command's deadline; when a
// deadline fires on a command still below Committed, the log escalates --
// to Recovery if this store owns the transaction's home shard, otherwise
// to a re-send of whatever phase the coordinator last drove.
//
// Time here is a caller-supplied logical tick count, not wall-clock --
// the same "take physical time as an explicit argument" approach
// `timestamp::Clock` uses, so the wheel stays deterministic for tests and
// the simulation harness.

use std::collections::{BTreeMap, BTreeSet};

use crate::command::Status;
use crate::timestamp::TxnId;

#[derive(Debug, Eq, PartialEq)]
pub enum ProgressAction {
    /// This store owns the TxnId's home shard: escalate to Recovery.
    EscalateToRecovery(TxnId),
    /// A non-home shard: nudge the coordinator by re-sending the current
    /// phase rather than taking over coordination.
    ResendCurrentPhase(TxnId),
}

/// Deadlines are stored doubly: `by_tick` for efficient "what's due by
/// now" sweeps, and `deadline_of` so a reschedule can find and remove a
/// command's old entry before inserting its new one.
#[derive(Clone, Debug, Default)]
pub struct ProgressLog {
    deadline_ticks: u64,
    by_tick: BTreeMap<u64, BTreeSet<TxnId>>,
    deadline_of: BTreeMap<TxnId, u64>,
}

impl ProgressLog {
    pub fn new(deadline_ticks: u64) -> Self {
        ProgressLog {
            deadline_ticks,
            by_tick: BTreeMap::new(),
            deadline_of: BTreeMap::new(),
        }
    }

    fn cancel(&mut self, txn_id: TxnId) {
        if let Some(old) = self.deadline_of.remove(&txn_id) {
            if let Some(set) = self.by_tick.get_mut(&old) {
                set.remove(&txn_id);
                if set.is_empty() {
                    self.by_tick.remove(&old);
                }
            }
        }
    }

    /// Called after every status transition a replica applies to
    /// `txn_id`. A command that has reached Committed or any terminal
    /// status no longer needs liveness-watching; anything still below
    /// Committed gets a fresh deadline `deadline_ticks` out from `now`.
    pub fn on_status_change(&mut self, txn_id: TxnId, now: u64, status: Status) {
        self.cancel(txn_id);
        if !status.is_committed_or_later() && !status.is_terminal() {
            let deadline = now + self.deadline_ticks;
            self.deadline_of.insert(txn_id, deadline);
            self.by_tick.entry(deadline).or_default().insert(txn_id);
        }
    }

    /// Every TxnId whose deadline is `<= now`, removed from the wheel --
    /// the caller re-arms via `on_status_change` after acting (escalating
    /// to recovery or re-sending a phase resets the clock on further
    /// stalling, same as the teacher's "reschedule on any activity"
    /// pattern).
    pub fn poll(&mut self, now: u64) -> Vec<TxnId> {
        let due_ticks: Vec<u64> = self.by_tick.range(..=now).map(|(&t, _)| t).collect();
        let mut due = Vec::new();
        for tick in due_ticks {
            if let Some(set) = self.by_tick.remove(&tick) {
                for txn_id in set {
                    self.deadline_of.remove(&txn_id);
                    due.push(txn_id);
                }
            }
        }
        due
    }

    pub fn is_tracked(&self, txn_id: &TxnId) -> bool {
        self.deadline_of.contains_key(txn_id)
    }

    /// Decides what a due TxnId should trigger, per spec.md §4.6.
    pub fn decide(txn_id: TxnId, is_home_shard: bool) -> ProgressAction {
        if is_home_shard {
            ProgressAction::EscalateToRecovery(txn_id)
        } else {
            ProgressAction::ResendCurrentPhase(txn_id)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::timestamp::{Timestamp, TxnKind};
    use drift_net::NodeID;
    use test_log::test;

    fn txn(hlc: i64) -> TxnId {
        TxnId::new(Timestamp::new(0, hlc, NodeID(1)), TxnKind::Write)
    }

    #[test]
    fn test_deadline_fires_after_the_configured_tick_budget() {
        let mut log = ProgressLog::new(10);
        let id = txn(1);
        log.on_status_change(id, 0, Status::PreAccepted);
        assert!(log.poll(5).is_empty());
        assert_eq!(log.poll(10), vec![id]);
        assert!(!log.is_tracked(&id));
    }

    #[test]
    fn test_committed_or_later_cancels_tracking() {
        let mut log = ProgressLog::new(10);
        let id = txn(1);
        log.on_status_change(id, 0, Status::PreAccepted);
        log.on_status_change(id, 1, Status::Committed);
        assert!(!log.is_tracked(&id));
        assert!(log.poll(100).is_empty());
    }

    #[test]
    fn test_repeated_activity_reschedules_rather_than_duplicates() {
        let mut log = ProgressLog::new(10);
        let id = txn(1);
        log.on_status_change(id, 0, Status::PreAccepted);
        log.on_status_change(id, 5, Status::Accepted);
        // the PreAccepted deadline at tick 10 must have been cancelled
        assert!(log.poll(10).is_empty());
        assert_eq!(log.poll(15), vec![id]);
    }

    #[test]
    fn test_home_shard_escalates_others_resend() {
        let id = txn(1);
        assert_eq!(ProgressLog::decide(id, true), ProgressAction::EscalateToRecovery(id));
        assert_eq!(ProgressLog::decide(id, false), ProgressAction::ResendCurrentPhase(id));
    }
}
