// Topology: epoch -> shards -> replicas mapping, and quorum computations
// (spec §3.3).
//
// Open question from spec.md §9 ("the exact fast-path electorate-size
// formula is topology-dependent and only partially visible in the sampled
// sources") is resolved here by making the electorate and its required
// size explicit fields of Shard rather than a formula baked into the
// protocol code -- the coordinator reads `fast_path_electorate` and
// `required_fast_path_size` off the Shard for the epoch it is running in,
// and never recomputes them. See DESIGN.md for the rationale.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use drift_net::NodeID;

use crate::routable::{Key, Range, Ranges};

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Shard {
    pub range: Range,
    pub replicas: Vec<NodeID>,
    /// The subset of `replicas` eligible to form a fast-path quorum. Often
    /// equal to `replicas`, but a topology may designate a smaller,
    /// lower-latency electorate.
    pub fast_path_electorate: Vec<NodeID>,
    /// How many identical PreAccept replies from `fast_path_electorate`
    /// are required to take the fast path.
    pub required_fast_path_size: usize,
}

impl Shard {
    /// A shard whose fast path requires agreement from every replica --
    /// the conservative default when a topology doesn't designate a
    /// smaller electorate.
    pub fn simple(range: Range, replicas: Vec<NodeID>) -> Self {
        let fast_path_electorate = replicas.clone();
        let required_fast_path_size = fast_path_electorate.len();
        Shard {
            range,
            replicas,
            fast_path_electorate,
            required_fast_path_size,
        }
    }

    /// Simple majority: floor(n/2) + 1.
    pub fn quorum_size(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.range.contains_key(key)
    }
}

/// A Topology for one epoch: an ordered set of Shards, sorted by range
/// start so shard lookups are a binary search.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Topology {
    pub epoch: u64,
    shards: Vec<Shard>,
}

impl Topology {
    pub fn new(epoch: u64, mut shards: Vec<Shard>) -> Self {
        shards.sort_by(|a, b| a.range.start.cmp(&b.range.start));
        Topology { epoch, shards }
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn shard_for_key(&self, key: &Key) -> Option<&Shard> {
        self.shards.iter().find(|s| s.contains_key(key))
    }

    /// All shards whose range intersects any range in `ranges`.
    pub fn shards_for_ranges(&self, ranges: &Ranges) -> Vec<&Shard> {
        self.shards
            .iter()
            .filter(|s| {
                let as_ranges = Ranges::new(vec![s.range.clone()]);
                !as_ranges.slice(ranges).is_empty()
            })
            .collect()
    }

    /// The union of every shard range assigning `node`, i.e. that
    /// replica's slice of the keyspace in this epoch.
    pub fn ranges_for_node(&self, node: NodeID) -> Ranges {
        let owned: Vec<Range> = self
            .shards
            .iter()
            .filter(|s| s.replicas.contains(&node))
            .map(|s| s.range.clone())
            .collect();
        Ranges::new(owned)
    }
}

/// Keeps the sequence of Topologies the node has learned about. Epoch E is
/// durable once acknowledged by a quorum of epoch E-1's replicas (spec
/// §3.3); until then, replicas in E-1 must still be consulted for ranges
/// not yet known-durable in E.
#[derive(Clone, Debug, Default)]
pub struct TopologyManager {
    topologies: BTreeMap<u64, Topology>,
    // epoch -> set of E-1 replicas that have acknowledged epoch `epoch`.
    acks: BTreeMap<u64, BTreeSet<NodeID>>,
    durable_epoch: u64,
}

impl TopologyManager {
    pub fn new(initial: Topology) -> Self {
        let mut mgr = TopologyManager {
            topologies: BTreeMap::new(),
            acks: BTreeMap::new(),
            durable_epoch: initial.epoch,
        };
        mgr.topologies.insert(initial.epoch, initial);
        mgr
    }

    /// A stable, owned snapshot of the topology at `epoch`, so a reader
    /// never observes a torn update (spec §5: "the topology table is a
    /// copy-on-write sequence; readers take a stable snapshot per
    /// operation").
    pub fn snapshot(&self, epoch: u64) -> Option<Topology> {
        self.topologies.get(&epoch).cloned()
    }

    pub fn current_epoch(&self) -> u64 {
        self.topologies.keys().next_back().copied().unwrap_or(0)
    }

    pub fn current(&self) -> Topology {
        self.snapshot(self.current_epoch())
            .expect("current_epoch always names a known topology")
    }

    pub fn durable_epoch(&self) -> u64 {
        self.durable_epoch
    }

    pub fn is_durable(&self, epoch: u64) -> bool {
        epoch <= self.durable_epoch
    }

    pub fn install(&mut self, topology: Topology) {
        self.topologies.insert(topology.epoch, topology);
    }

    /// Record that `node`, a replica of epoch `epoch - 1`, has acknowledged
    /// epoch `epoch`. Returns true iff this acknowledgement just made
    /// `epoch` durable.
    pub fn acknowledge(&mut self, epoch: u64, node: NodeID) -> bool {
        if epoch == 0 || self.is_durable(epoch) {
            return false;
        }
        let Some(previous) = self.topologies.get(&(epoch - 1)) else {
            return false;
        };
        let eligible: BTreeSet<NodeID> = previous
            .shards()
            .iter()
            .flat_map(|s| s.replicas.iter().copied())
            .collect();
        if !eligible.contains(&node) {
            return false;
        }
        let acked = self.acks.entry(epoch).or_default();
        acked.insert(node);
        let quorum = eligible.len() / 2 + 1;
        if acked.len() >= quorum {
            self.durable_epoch = self.durable_epoch.max(epoch);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::routable::Key;
    use test_log::test;

    fn k(s: &str) -> Key {
        Key::from_str(s)
    }

    fn node(n: i64) -> NodeID {
        NodeID(n)
    }

    fn one_shard_topology(epoch: u64, replicas: Vec<NodeID>) -> Topology {
        Topology::new(
            epoch,
            vec![Shard::simple(Range::new(k(""), None), replicas)],
        )
    }

    #[test]
    fn test_shard_for_key_finds_containing_shard() {
        let shards = vec![
            Shard::simple(Range::new(k("a"), Some(k("m"))), vec![node(1)]),
            Shard::simple(Range::new(k("m"), None), vec![node(2)]),
        ];
        let topo = Topology::new(0, shards);
        assert_eq!(topo.shard_for_key(&k("c")).unwrap().replicas, vec![node(1)]);
        assert_eq!(topo.shard_for_key(&k("z")).unwrap().replicas, vec![node(2)]);
    }

    #[test]
    fn test_ranges_for_node_unions_its_shards() {
        let shards = vec![
            Shard::simple(Range::new(k("a"), Some(k("m"))), vec![node(1), node(2)]),
            Shard::simple(Range::new(k("m"), None), vec![node(2), node(3)]),
        ];
        let topo = Topology::new(0, shards);
        let ranges = topo.ranges_for_node(node(2));
        assert_eq!(ranges.as_slice(), &[Range::new(k("a"), None)]);
        let ranges1 = topo.ranges_for_node(node(1));
        assert_eq!(ranges1.as_slice(), &[Range::new(k("a"), Some(k("m")))]);
    }

    #[test]
    fn test_quorum_size_is_simple_majority() {
        let shard = Shard::simple(Range::new(k(""), None), vec![node(1), node(2), node(3)]);
        assert_eq!(shard.quorum_size(), 2);
    }

    #[test]
    fn test_epoch_becomes_durable_after_quorum_ack() {
        let e0 = one_shard_topology(0, vec![node(1), node(2), node(3)]);
        let mut mgr = TopologyManager::new(e0);
        let e1 = one_shard_topology(1, vec![node(1), node(2), node(3), node(4)]);
        mgr.install(e1);

        assert!(!mgr.is_durable(1));
        assert!(!mgr.acknowledge(1, node(1)));
        assert!(mgr.acknowledge(1, node(2))); // 2 of 3 e0 replicas: quorum reached
        assert!(mgr.is_durable(1));
    }

    #[test]
    fn test_acknowledge_from_non_previous_epoch_replica_is_ignored() {
        let e0 = one_shard_topology(0, vec![node(1), node(2), node(3)]);
        let mut mgr = TopologyManager::new(e0);
        let e1 = one_shard_topology(1, vec![node(4), node(5), node(6)]);
        mgr.install(e1);
        assert!(!mgr.acknowledge(1, node(4))); // node(4) isn't an e0 replica
        assert!(!mgr.is_durable(1));
    }
}
