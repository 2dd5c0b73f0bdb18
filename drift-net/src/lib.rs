use core::fmt::Debug;
use core::hash::Hash;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use drift_base::{err, Error};

pub trait Data: Clone + Debug + Eq + PartialEq + Ord + Hash {}
impl<T> Data for T where T: Clone + Debug + Eq + PartialEq + Ord + Hash {}

// A given Realm is a single, coherent, distributed system. It is composed of
// a set of Nodes, each of which has a unique NodeID.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeID(pub i64);

// NodeTime is a virtual time-point in signed 64-bit microseconds
// since the epoch. This is sufficient to span 292,471 years.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeTime(pub i64);

// Duration is a time-span in signed 64-bit microseconds relative to
// some NodeTime or RealmTime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Duration(pub i64);

// RealmTimes are realm-local extended timestamps. The most
// significant (time) field stores a NodeTime (microsecond count), but
// this is then followed by both a NodeID and an event count allowing
// each node to label any event with a RealmTime without coordination
// with other Nodes, _and_ with essentially arbitrary numbers of
// sub-microsecond events without implying anything about real time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RealmTime {
    pub time: NodeTime,
    pub node: NodeID,
    pub event: i64,
}

// Every message carries the originating epoch. A replica at an earlier
// epoch buffers until it catches up; at a later epoch it rejects with its
// current epoch so the sender can re-route. Epoch semantics belong to the
// protocol layer above this one; this crate only threads the tag through.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Epoch(pub u64);

// All inter-node communication takes the form of Messages. A message has
// a set of common fields, followed by a generic payload specific to
// whatever protocol is layered on top (txn phases, gossip, etc).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Msg<P> {
    pub src: NodeID,
    pub dst: NodeID,
    pub epoch: Epoch,
    pub msg_time: RealmTime,
    pub sequence: i64,
    pub response: bool,
    pub payload: P,
}

// Each message sent or received turns into a single [u8] buffer added to
// the incoming or outgoing deque of the associated IOQueues. Transports
// then turn these into bytes-on-the-wire with whatever framing the transport
// finds necessary.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct IOQueues {
    outgoing: VecDeque<(NodeID, Box<[u8]>)>,
    incoming: VecDeque<(NodeID, Box<[u8]>)>,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct Request<P> {
    req: Box<Msg<P>>,
    res: Option<Box<Msg<P>>>,
}

// A Node organizes the communication for the process, in terms
// of sending and receiving messages with other nodes.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Node<P> {
    /// The set of decoded incoming one-way messages awaiting consumption. The
    /// [`Node::recv_msg`] function will alternate messages between returning
    /// these and complete requests.
    incoming: VecDeque<Box<Msg<P>>>,
    /// The set of request messages that have been sent but either not yet
    /// responded-to, or not yet consumed by [`Node::recv_msg`].
    requests: BTreeMap<i64, Request<P>>,
    /// The set of decoded incoming request/response pairs awaiting consumption.
    complete: VecDeque<i64>,
    /// The set of incoming and outgoing serialized byte buffers associated with
    /// each peer node. [`Node::recv_bytes`] and [`Node::send_bytes`] operate on
    /// these.
    ioqueues: IOQueues,
}

impl<P> Default for Node<P> {
    fn default() -> Self {
        Node {
            incoming: VecDeque::new(),
            requests: BTreeMap::new(),
            complete: VecDeque::new(),
            ioqueues: IOQueues::default(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum RecvMsg<P> {
    NoMsgs,
    Single(Box<Msg<P>>),
    Paired { req: Box<Msg<P>>, res: Box<Msg<P>> },
}

impl<P> Default for RecvMsg<P> {
    fn default() -> Self {
        RecvMsg::NoMsgs
    }
}

impl<P: Serialize + DeserializeOwned> Node<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_msg(&mut self, msg: Msg<P>) -> Result<(), Error> {
        let dst = msg.dst;
        let is_request = !msg.response;
        let sequence = msg.sequence;
        let buf = rmp_serde::to_vec(&msg)?;
        if is_request {
            self.requests.insert(
                sequence,
                Request {
                    req: Box::new(msg),
                    res: None,
                },
            );
        }
        self.ioqueues
            .outgoing
            .push_back((dst, buf.into_boxed_slice()));
        Ok(())
    }

    pub fn maybe_pop_incoming_msg(&mut self) -> Option<Box<Msg<P>>> {
        // When incoming and complete both have content, alternate
        // messages from one or the other so neither starves.
        if (self.incoming.len() + self.complete.len()) & 1 == 0 {
            self.incoming.pop_front()
        } else {
            None
        }
    }

    pub fn recv_msg(&mut self) -> Result<RecvMsg<P>, Error> {
        if self.incoming.is_empty() && self.complete.is_empty() {
            if let Some((src, buf)) = self.ioqueues.incoming.pop_front() {
                self.decode_msg(src, buf)?;
            }
        }

        if let Some(msg) = self.maybe_pop_incoming_msg() {
            Ok(RecvMsg::Single(msg))
        } else if let Some(id) = self.complete.pop_front() {
            if let Some(req) = self.requests.remove(&id) {
                if req.req.sequence != id {
                    return Err(err("Unexpected sequence"));
                }
                if req.req.response {
                    return Err(err("Request is a response"));
                }
                if let Some(res) = req.res {
                    if res.sequence != id {
                        return Err(err("Mismatched sequence"));
                    }
                    if !res.response {
                        return Err(err("Response is not a response"));
                    }
                    Ok(RecvMsg::Paired { req: req.req, res })
                } else {
                    Err(err("Missing response in complete request"))
                }
            } else {
                Err(err("Missing request"))
            }
        } else {
            Ok(RecvMsg::NoMsgs)
        }
    }

    pub fn recv_bytes(&mut self, src: NodeID, buf: Box<[u8]>) -> Result<(), Error> {
        self.ioqueues.incoming.push_back((src, buf));
        Ok(())
    }

    pub fn send_bytes(&mut self) -> Result<Option<(NodeID, Box<[u8]>)>, Error> {
        Ok(self.ioqueues.outgoing.pop_front())
    }

    fn decode_msg(&mut self, src: NodeID, buf: Box<[u8]>) -> Result<(), Error> {
        let msg: Box<Msg<P>> = Box::new(rmp_serde::from_slice(buf.as_ref())?);
        if msg.src != src {
            return Err(err("Mismatched source"));
        }
        if let Some(req) = self.requests.get_mut(&msg.sequence) {
            if req.res.is_none() {
                self.complete.push_back(msg.sequence);
                req.res = Some(msg);
            } else {
                return Err(err("Duplicate response"));
            }
        } else {
            self.incoming.push_back(msg);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
    enum Ping {
        Ping,
        Pong,
    }

    fn msg(src: i64, dst: i64, seq: i64, response: bool, payload: Ping) -> Msg<Ping> {
        Msg {
            src: NodeID(src),
            dst: NodeID(dst),
            epoch: Epoch(0),
            msg_time: RealmTime {
                time: NodeTime(0),
                node: NodeID(src),
                event: seq,
            },
            sequence: seq,
            response,
            payload,
        }
    }

    #[test]
    fn test_request_reply_round_trip() {
        let mut a = Node::<Ping>::new();
        let mut b = Node::<Ping>::new();

        a.send_msg(msg(1, 2, 0, false, Ping::Ping)).unwrap();
        let (_dst, buf) = a.send_bytes().unwrap().unwrap();
        b.recv_bytes(NodeID(1), buf).unwrap();

        let received = b.recv_msg().unwrap();
        let req = match received {
            RecvMsg::Single(m) => m,
            other => panic!("expected a single message, got {other:?}"),
        };
        assert_eq!(req.payload, Ping::Ping);

        b.send_msg(msg(2, 1, 0, true, Ping::Pong)).unwrap();
        let (_dst, buf) = b.send_bytes().unwrap().unwrap();
        a.recv_bytes(NodeID(2), buf).unwrap();

        let paired = a.recv_msg().unwrap();
        match paired {
            RecvMsg::Paired { req, res } => {
                assert_eq!(req.payload, Ping::Ping);
                assert_eq!(res.payload, Ping::Pong);
            }
            other => panic!("expected a paired request/response, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_response_is_rejected() {
        let mut a = Node::<Ping>::new();
        a.send_msg(msg(1, 2, 0, false, Ping::Ping)).unwrap();
        a.recv_bytes(
            NodeID(2),
            rmp_serde::to_vec(&msg(2, 1, 0, true, Ping::Pong))
                .unwrap()
                .into_boxed_slice(),
        )
        .unwrap();
        a.recv_bytes(
            NodeID(2),
            rmp_serde::to_vec(&msg(2, 1, 0, true, Ping::Pong))
                .unwrap()
                .into_boxed_slice(),
        )
        .unwrap();
        assert!(a.recv_msg().is_ok());
        assert!(a.recv_msg().is_err());
    }
}
