// Timestamps, TxnIds and Ballots (spec §3.1).
//
// A Timestamp is the triple (epoch, hlc, node), ordered lexicographically
// and totally over all timestamps -- the (hlc, node) pair alone would not
// be unique across an epoch boundary, and node alone breaks ties between
// two nodes that raced to the same hlc value.

use serde::{Deserialize, Serialize};

use drift_net::NodeID;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub epoch: u64,
    pub hlc: i64,
    pub node: NodeID,
}

impl Timestamp {
    pub fn new(epoch: u64, hlc: i64, node: NodeID) -> Self {
        Timestamp { epoch, hlc, node }
    }

    pub fn zero(node: NodeID) -> Self {
        Timestamp { epoch: 0, hlc: 0, node }
    }
}

/// A transaction reads and/or writes; ExclusiveSync additionally demands
/// that no lower-timestamped transaction may still be in flight when it
/// executes (used by reconfiguration-adjacent operations that must see a
/// fully quiesced prefix).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum TxnKind {
    Read,
    Write,
    ExclusiveSync,
}

/// A TxnId is a Timestamp additionally tagged with a transaction kind.
/// It is the globally unique identity of one client transaction attempt,
/// assigned once by the coordinator that first proposes it and never
/// reassigned -- recovery changes the *ballot* under which a TxnId is
/// proposed, never the TxnId itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TxnId {
    pub ts: Timestamp,
    pub kind: TxnKind,
}

impl TxnId {
    pub fn new(ts: Timestamp, kind: TxnKind) -> Self {
        TxnId { ts, kind }
    }

    pub fn epoch(&self) -> u64 {
        self.ts.epoch
    }
}

/// An ExecuteAt is a Timestamp >= the owning TxnId, chosen during Accept
/// (or confirmed equal to the TxnId on the fast path).
pub type ExecuteAt = Timestamp;

/// A Ballot is a Timestamp used to order recovery proposals. The initial
/// ballot of a transaction equals its TxnId's timestamp; each Recovery
/// attempt proposes a strictly higher ballot.
pub type Ballot = Timestamp;

/// A per-node hybrid-logical clock. `tick` mints a fresh local Timestamp;
/// `observe` folds in a Timestamp witnessed from another node's message so
/// that this node's clock never regresses behind something it has seen.
/// Both take the caller's notion of current physical time explicitly
/// (microseconds since an arbitrary fixed point) so the clock stays pure
/// and deterministic for tests and the simulation harness.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Clock {
    node: NodeID,
    epoch: u64,
    last_hlc: i64,
}

impl Clock {
    pub fn new(node: NodeID, epoch: u64) -> Self {
        Clock { node, epoch, last_hlc: 0 }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn tick(&mut self, physical_micros: i64) -> Timestamp {
        self.last_hlc = physical_micros.max(self.last_hlc + 1);
        Timestamp::new(self.epoch, self.last_hlc, self.node)
    }

    pub fn observe(&mut self, physical_micros: i64, other: Timestamp) -> Timestamp {
        self.last_hlc = physical_micros.max(self.last_hlc + 1).max(other.hlc + 1);
        Timestamp::new(self.epoch, self.last_hlc, self.node)
    }

    /// Mint a ballot strictly greater than `known_max`, used by Recovery
    /// (spec §4.4) to re-propose after a stalled attempt.
    pub fn next_ballot(&mut self, physical_micros: i64, known_max: Ballot) -> Ballot {
        self.observe(physical_micros, known_max)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    fn node(n: i64) -> NodeID {
        NodeID(n)
    }

    #[test]
    fn test_timestamp_ordering_is_lexicographic() {
        let a = Timestamp::new(0, 5, node(1));
        let b = Timestamp::new(0, 5, node(2));
        let c = Timestamp::new(0, 6, node(1));
        let d = Timestamp::new(1, 0, node(1));
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn test_clock_tick_is_monotonic() {
        let mut clock = Clock::new(node(1), 0);
        let t1 = clock.tick(100);
        let t2 = clock.tick(50); // physical time can stall or go backwards
        let t3 = clock.tick(200);
        assert!(t1 < t2);
        assert!(t2 < t3);
    }

    #[test]
    fn test_clock_observe_advances_past_witnessed_timestamp() {
        let mut clock = Clock::new(node(1), 0);
        let witnessed = Timestamp::new(0, 1_000, node(2));
        let t = clock.observe(10, witnessed);
        assert!(t > witnessed);
    }

    #[test]
    fn test_next_ballot_exceeds_known_max() {
        let mut clock = Clock::new(node(1), 0);
        let known_max = Timestamp::new(0, 500, node(3));
        let ballot = clock.next_ballot(1, known_max);
        assert!(ballot > known_max);
    }
}
