// A node collects together the resources necessary to run one replica:
// the wire transport, the command stores it hosts, the embedder store
// those commands apply their writes to, and the progress log watching
// them for stalls.
//
// Grounded on `submerge::{ServerState, ServerTrait}` -- the teacher's top
// crate sketches "a server collects together all resources necessary to
// function as a replica of realm's tables"; this is that sketch filled in
// for the protocol drift-txn actually implements. A node here only ever
// hosts one CommandStore (one shard); an embedder that wants to host
// several shards on one process runs several `NodeRuntime`s.

use std::collections::BTreeMap;

use tracing::{info, warn};

use drift_base::{err, Error, NodeConfig};
use drift_net::{Epoch, Msg, Node as NetNode, NodeID, NodeTime, RealmTime, RecvMsg};
use drift_store::InMemoryStore;
use drift_txn::{
    handle_replica_message_and_wake, is_ready_to_read, CommandStore, Payload, ProgressAction,
    ProgressLog, Range, Store,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    Idle,
    Running,
    Draining,
}

/// One replica's in-process resources. `tick` is the single entry point an
/// embedder's transport loop drives: feed bytes in via `recv_bytes`, call
/// `tick` to process at most one queued message and sweep the progress
/// log, then drain `send_bytes` for anything that needs to go out.
pub struct NodeRuntime {
    pub config: NodeConfig,
    state: NodeState,
    epoch: u64,
    sequence: i64,
    net: NetNode<Payload>,
    store: CommandStore,
    embedder: InMemoryStore,
    progress: ProgressLog,
}

impl NodeRuntime {
    pub fn new(config: NodeConfig, owned_range: Range) -> Self {
        let progress_deadline_ticks = config.progress_deadline_millis.max(1);
        NodeRuntime {
            store: CommandStore::new(config.node_id as u64, owned_range),
            config,
            state: NodeState::Idle,
            epoch: 0,
            sequence: 0,
            net: NetNode::new(),
            embedder: InMemoryStore::new(),
            progress: ProgressLog::new(progress_deadline_ticks),
        }
    }

    pub fn start(&mut self) {
        self.state = NodeState::Running;
        info!(node_id = self.config.node_id, "node started");
    }

    pub fn drain(&mut self) {
        self.state = NodeState::Draining;
        info!(node_id = self.config.node_id, "node draining");
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn embedder(&self) -> &InMemoryStore {
        &self.embedder
    }

    pub fn command_store(&self) -> &CommandStore {
        &self.store
    }

    /// Feed one inbound wire message's bytes into the node's transport.
    pub fn recv_bytes(&mut self, src: NodeID, buf: Box<[u8]>) -> Result<(), Error> {
        self.net.recv_bytes(src, buf)
    }

    /// Pop one outbound wire message's bytes, if any are queued.
    pub fn send_bytes(&mut self) -> Result<Option<(NodeID, Box<[u8]>)>, Error> {
        self.net.send_bytes()
    }

    /// Decode and dispatch at most one queued message, then sweep the
    /// progress log for deadlines due by `now`. `now` is a caller-supplied
    /// logical tick, matching every other deterministic clock in this
    /// workspace.
    pub fn tick(&mut self, now: u64) -> Result<(), Error> {
        if self.state != NodeState::Draining {
            match self.net.recv_msg()? {
                RecvMsg::NoMsgs => {}
                RecvMsg::Single(msg) => self.dispatch(*msg, now)?,
                RecvMsg::Paired { res, .. } => self.dispatch(*res, now)?,
            }
        }

        for txn_id in self.progress.poll(now) {
            let Some(command) = self.store.peek(&txn_id) else { continue };
            let is_home_shard = command
                .route
                .as_ref()
                .is_some_and(|r| self.store.owned_range.contains_key(r.home_key()));
            match ProgressAction::decide(txn_id, is_home_shard) {
                ProgressAction::EscalateToRecovery(id) => {
                    warn!(?id, "progress deadline elapsed on home shard, escalating to recovery")
                }
                ProgressAction::ResendCurrentPhase(id) => {
                    warn!(?id, "progress deadline elapsed, nudging coordinator")
                }
            }
        }

        Ok(())
    }

    fn dispatch(&mut self, msg: Msg<Payload>, now: u64) -> Result<(), Error> {
        let src = msg.src;
        let reply_sequence = msg.sequence;
        let payload = msg.payload;

        // Read isn't a CommandStore status transition (spec.md §4.2,
        // §6.2): it only needs to know whether this replica's copy of the
        // transaction has reached ReadyToExecute, then fetch the values
        // from the embedder's Store directly. Handled here, not by
        // `handle_replica_message_and_wake`, since that entry point never
        // touches the embedder.
        if let Payload::Read { txn_id, keys } = &payload {
            let reply = if is_ready_to_read(&self.store, *txn_id) {
                match self.embedder.read(keys) {
                    Ok(values) => Payload::ReadOk {
                        txn_id: *txn_id,
                        values: values.into_iter().map(|(k, v)| (k.0, v)).collect(),
                    },
                    Err(_) => Payload::ReadNack { txn_id: *txn_id },
                }
            } else {
                Payload::ReadNack { txn_id: *txn_id }
            };
            return self.send(src, reply, true, Some(reply_sequence));
        }

        let txn_id = payload.txn_id();
        let apply_writes = if let Payload::Apply { writes, .. } = &payload {
            Some(writes.clone())
        } else {
            None
        };

        let (reply, waiters) = handle_replica_message_and_wake(&mut self.store, src, payload)?;

        // Only write through to the embedder once the replica has actually
        // accepted the Apply (spec.md §4.2: a command "executes only after
        // every one of its dependencies... has itself applied"). An Apply
        // that races ahead of its own Commit is Nacked by `handle_apply`
        // without touching the command, so `writes` must stay unapplied.
        if matches!(reply, Some(Payload::ApplyOk { .. })) {
            if let Some(writes) = apply_writes {
                self.embedder.apply(&writes)?;
            }
        }

        if let Some(command) = self.store.peek(&txn_id) {
            self.progress.on_status_change(txn_id, now, command.status);
        }

        if let Some(reply_payload) = reply {
            self.send(src, reply_payload, true, Some(reply_sequence))?;
        }
        for (requester, waiter_payload) in waiters {
            self.send(requester, waiter_payload, false, None)?;
        }
        Ok(())
    }

    fn send(
        &mut self,
        dst: NodeID,
        payload: Payload,
        response: bool,
        reuse_sequence: Option<i64>,
    ) -> Result<(), Error> {
        let sequence = match reuse_sequence {
            Some(s) => s,
            None => {
                self.sequence += 1;
                self.sequence
            }
        };
        let msg = Msg {
            src: NodeID(self.config.node_id),
            dst,
            epoch: Epoch(self.epoch),
            msg_time: RealmTime { time: NodeTime(0), node: NodeID(self.config.node_id), event: sequence },
            sequence,
            response,
            payload,
        };
        self.net.send_msg(msg)
    }
}

/// A running process's complete set of node runtimes, keyed by the shard
/// id each one hosts. Most deployments run exactly one shard per process;
/// this exists for embedders (or the simulation harness) that colocate
/// several.
#[derive(Default)]
pub struct Nodes {
    runtimes: BTreeMap<u64, NodeRuntime>,
}

impl Nodes {
    pub fn new() -> Self {
        Nodes { runtimes: BTreeMap::new() }
    }

    pub fn insert(&mut self, shard_id: u64, runtime: NodeRuntime) {
        self.runtimes.insert(shard_id, runtime);
    }

    pub fn get_mut(&mut self, shard_id: u64) -> Result<&mut NodeRuntime, Error> {
        self.runtimes.get_mut(&shard_id).ok_or_else(|| err("no node runtime for that shard id"))
    }

    pub fn tick_all(&mut self, now: u64) -> Result<(), Error> {
        for runtime in self.runtimes.values_mut() {
            runtime.tick(now)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use drift_net::{Epoch, NodeTime, RealmTime};
    use drift_txn::{Key, TxnId};
    use test_log::test;

    fn config() -> NodeConfig {
        let mut c = NodeConfig::default();
        c.node_id = 1;
        c
    }

    fn full_range() -> Range {
        Range::new(Key::from_str(""), None)
    }

    fn commit_msg(txn_id: TxnId, seq: i64) -> Msg<Payload> {
        use drift_txn::{FullRoute, Range as TxnRange, Route, Unseekables};
        Msg {
            src: NodeID(2),
            dst: NodeID(1),
            epoch: Epoch(0),
            msg_time: RealmTime { time: NodeTime(0), node: NodeID(2), event: seq },
            sequence: seq,
            response: false,
            payload: Payload::Commit {
                txn_id,
                execute_at: txn_id.ts,
                deps: Default::default(),
                route: Route::Full(FullRoute {
                    home_key: Key::from_str("a"),
                    content: Unseekables::RoutingRanges(drift_txn::Ranges::new(vec![TxnRange::new(
                        Key::from_str("a"),
                        None,
                    )])),
                }),
            },
        }
    }

    #[test]
    fn test_node_runtime_starts_idle_and_starts_running() {
        let runtime = NodeRuntime::new(config(), full_range());
        assert_eq!(runtime.state(), NodeState::Idle);
    }

    #[test]
    fn test_tick_dispatches_a_queued_message_and_updates_progress() {
        use drift_txn::{Timestamp, TxnKind};

        let mut runtime = NodeRuntime::new(config(), full_range());
        runtime.start();

        let id = TxnId::new(Timestamp::new(0, 1, NodeID(2)), TxnKind::Write);
        let msg = commit_msg(id, 1);
        let bytes = rmp_serde::to_vec(&msg).unwrap().into_boxed_slice();
        runtime.recv_bytes(NodeID(2), bytes).unwrap();

        runtime.tick(0).unwrap();

        assert!(runtime.command_store().contains(&id));
    }

    #[test]
    fn test_read_nacks_before_ready_to_execute() {
        use drift_txn::{FullRoute, Range as TxnRange, Route, Timestamp, TxnKind, Unseekables};

        let mut runtime = NodeRuntime::new(config(), full_range());
        runtime.start();

        // An Accept (not Commit) never reaches ReadyToExecute.
        let id = TxnId::new(Timestamp::new(0, 1, NodeID(2)), TxnKind::Write);
        let accept = Msg {
            src: NodeID(2),
            dst: NodeID(1),
            epoch: Epoch(0),
            msg_time: RealmTime { time: NodeTime(0), node: NodeID(2), event: 1 },
            sequence: 1,
            response: false,
            payload: Payload::Accept {
                txn_id: id,
                ballot: id.ts,
                route: Route::Full(FullRoute {
                    home_key: Key::from_str("a"),
                    content: Unseekables::RoutingRanges(drift_txn::Ranges::new(vec![TxnRange::new(
                        Key::from_str("a"),
                        None,
                    )])),
                }),
                execute_at: id.ts,
                deps: Default::default(),
            },
        };
        runtime.recv_bytes(NodeID(2), rmp_serde::to_vec(&accept).unwrap().into_boxed_slice()).unwrap();
        runtime.tick(0).unwrap();
        // drain the AcceptOk reply
        runtime.send_bytes().unwrap();

        let read = Msg {
            src: NodeID(2),
            dst: NodeID(1),
            epoch: Epoch(0),
            msg_time: RealmTime { time: NodeTime(0), node: NodeID(2), event: 2 },
            sequence: 2,
            response: false,
            payload: Payload::Read { txn_id: id, keys: drift_txn::Keys::new(vec![Key::from_str("a")]) },
        };
        runtime.recv_bytes(NodeID(2), rmp_serde::to_vec(&read).unwrap().into_boxed_slice()).unwrap();
        runtime.tick(1).unwrap();

        let (_, reply_bytes) = runtime.send_bytes().unwrap().unwrap();
        let reply: Msg<Payload> = rmp_serde::from_slice(&reply_bytes).unwrap();
        assert!(matches!(reply.payload, Payload::ReadNack { .. }));
    }

    #[test]
    fn test_read_succeeds_once_committed_with_no_deps() {
        use drift_txn::{Timestamp, TxnKind};

        let mut runtime = NodeRuntime::new(config(), full_range());
        runtime.start();

        let id = TxnId::new(Timestamp::new(0, 1, NodeID(2)), TxnKind::Write);
        let msg = commit_msg(id, 1);
        runtime.recv_bytes(NodeID(2), rmp_serde::to_vec(&msg).unwrap().into_boxed_slice()).unwrap();
        runtime.tick(0).unwrap();

        let read = Msg {
            src: NodeID(2),
            dst: NodeID(1),
            epoch: Epoch(0),
            msg_time: RealmTime { time: NodeTime(0), node: NodeID(2), event: 2 },
            sequence: 2,
            response: false,
            payload: Payload::Read { txn_id: id, keys: drift_txn::Keys::new(vec![Key::from_str("a")]) },
        };
        runtime.recv_bytes(NodeID(2), rmp_serde::to_vec(&read).unwrap().into_boxed_slice()).unwrap();
        runtime.tick(1).unwrap();

        let (_, reply_bytes) = runtime.send_bytes().unwrap().unwrap();
        let reply: Msg<Payload> = rmp_serde::from_slice(&reply_bytes).unwrap();
        assert!(matches!(reply.payload, Payload::ReadOk { .. }));
    }

    #[test]
    fn test_draining_node_stops_processing_new_messages() {
        use drift_txn::{Timestamp, TxnKind};

        let mut runtime = NodeRuntime::new(config(), full_range());
        runtime.start();
        runtime.drain();

        let id = TxnId::new(Timestamp::new(0, 1, NodeID(2)), TxnKind::Write);
        let msg = commit_msg(id, 1);
        let bytes = rmp_serde::to_vec(&msg).unwrap().into_boxed_slice();
        runtime.recv_bytes(NodeID(2), bytes).unwrap();

        runtime.tick(0).unwrap();

        assert!(!runtime.command_store().contains(&id));
    }
}
