//! Push and pull transfers along graph edges.
//!
//! Every transfer moves one edge's overlap for one component range, and is
//! identified on the wire by a `TransferKey` and a sequence number. Both ends
//! of an edge count the invocations that used its key, so the producer and
//! the consumer agree on the sequence number without talking to each other.
//! Messages which arrive before the local rank has reached their invocation
//! are held in the runtime's ledger; a message for an invocation the local
//! rank already finished is stale, and is a fatal error.
//!
//! Under push, the producer sends as soon as it has staged its buffer. Under
//! pull, the consumer sends a request when it posts its receive, and the
//! producer replies once the request and the staged buffer have both shown
//! up, in whichever order.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use log::trace;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::graph::{Edge, EdgeId, RegionGraph};
use crate::message::{Communicator, Rank};
use crate::region::RegionId;
use crate::rg_iter::Progress;
use crate::runtime::Runtime;




/**
 * Which side of an edge initiates a transfer.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// The producer sends as soon as its buffer is staged.
    Push,
    /// The consumer requests, and the producer replies from its staged
    /// buffer.
    Pull,
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Protocol::Push),
            "pull" => Ok(Protocol::Pull),
            _ => Err(format!("unknown protocol '{}', expected push or pull", s)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Push => write!(f, "push"),
            Protocol::Pull => write!(f, "pull"),
        }
    }
}




/**
 * Identifies the data moved along one edge for one component range. The
 * edge number disambiguates periodic images, where two regions are joined by
 * more than one edge.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransferKey {
    pub src: RegionId,
    pub dst: RegionId,
    pub edge: EdgeId,
    pub scomp: usize,
    pub ncomp: usize,
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} (edge {}, components {}..{})",
            self.src,
            self.dst,
            self.edge,
            self.scomp,
            self.scomp + self.ncomp
        )
    }
}




/**
 * The envelope of every message exchanged by the transfer engine.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Data {
        key: TransferKey,
        seq: u64,
        protocol: Protocol,
        payload: Vec<f64>,
    },
    Request {
        key: TransferKey,
        seq: u64,
        reply_to: Rank,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        rmp_serde::to_vec(self).map_err(|e| TransferError::Encode {
            key: self.key(),
            reason: e.to_string(),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransferError> {
        rmp_serde::from_slice(bytes).map_err(|e| TransferError::Decode(e.to_string()))
    }

    pub fn key(&self) -> TransferKey {
        match self {
            Message::Data { key, .. } | Message::Request { key, .. } => *key,
        }
    }
}




/**
 * Counters reported by one invocation of a level-transfer operator.
 */
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Edges whose ends are both on this rank, copied directly.
    pub local_copies: usize,
    /// Data buffers handed to the transport (push) or staged (pull).
    pub sends: usize,
    /// Pull requests issued by this rank.
    pub requests: usize,
    /// Data buffers received from other ranks.
    pub receives: usize,
    /// Payload bytes this rank produced for other ranks.
    pub bytes_sent: usize,
    /// Regions yielded by the graph iterator.
    pub regions: usize,
}




/**
 * Per-rank bookkeeping shared by every transfer engine on a runtime, so
 * that an engine draining the transport never loses a message meant for
 * another invocation.
 */
#[derive(Default)]
pub(crate) struct Ledger {
    produced: HashMap<TransferKey, u64>,
    posted: HashMap<TransferKey, u64>,
    taken: HashMap<TransferKey, u64>,
    data: HashMap<TransferKey, BTreeMap<u64, (Protocol, Vec<f64>)>>,
    requests: HashMap<TransferKey, BTreeMap<u64, Rank>>,
    staged: HashMap<TransferKey, BTreeMap<u64, Vec<f64>>>,
}

impl Ledger {
    fn next(counter: &mut HashMap<TransferKey, u64>, key: TransferKey) -> u64 {
        let seq = counter.entry(key).or_insert(0);
        *seq += 1;
        *seq - 1
    }

    fn is_staged(&self, key: &TransferKey, seq: u64) -> bool {
        self.staged.get(key).map_or(false, |s| s.contains_key(&seq))
    }


    /**
     * File an inbound message. Data is held until the consumer takes it;
     * a request is answered at once if its buffer is already staged.
     */
    pub(crate) fn accept<C: Communicator>(&mut self, comm: &C, message: Message) -> Result<(), TransferError> {
        match message {
            Message::Data { key, seq, protocol, payload } => {
                let expected = self.taken.get(&key).copied().unwrap_or(0);

                if seq < expected {
                    return Err(TransferError::Stale { key, protocol, expected, received: seq });
                }
                if self.data.entry(key).or_default().insert(seq, (protocol, payload)).is_some() {
                    return Err(TransferError::Unexpected { key, protocol });
                }
                trace!("held data #{} for {}", seq, key);
                Ok(())
            }
            Message::Request { key, seq, reply_to } => {
                let produced = self.produced.get(&key).copied().unwrap_or(0);

                if seq < produced && !self.is_staged(&key, seq) {
                    return Err(TransferError::Stale {
                        key,
                        protocol: Protocol::Pull,
                        expected: produced,
                        received: seq,
                    });
                }
                if self.requests.entry(key).or_default().insert(seq, reply_to).is_some() {
                    return Err(TransferError::Unexpected { key, protocol: Protocol::Pull });
                }
                self.serve(comm, key, seq)
            }
        }
    }


    /**
     * Reply to a pull request if both the request and the staged buffer are
     * present.
     */
    fn serve<C: Communicator>(&mut self, comm: &C, key: TransferKey, seq: u64) -> Result<(), TransferError> {
        if !self.is_staged(&key, seq) || !self.requests.get(&key).map_or(false, |r| r.contains_key(&seq)) {
            return Ok(());
        }
        let reply_to = self.requests.get_mut(&key).and_then(|r| r.remove(&seq));
        let staged = self.staged.get_mut(&key).and_then(|s| s.remove(&seq));

        if let (Some(reply_to), Some(payload)) = (reply_to, staged) {
            trace!("serving #{} of {} to rank {}", seq, key, reply_to);
            let message = Message::Data { key, seq, protocol: Protocol::Pull, payload };
            comm.send(reply_to, message.encode()?)?;
        }
        Ok(())
    }
}




/**
 * A receive posted for a remote edge, and the payload length it expects.
 */
#[derive(Clone, Copy)]
struct Pending {
    key: TransferKey,
    seq: u64,
    len: usize,
}




/**
 * Moves edge buffers for one invocation of a level-transfer operator, on
 * one rank. Issuing operations never block; completion is learned by
 * polling through the `Progress` trait, usually from the graph iterator.
 */
pub struct TransferEngine<'r, C: Communicator> {
    runtime: &'r Runtime<C>,
    protocol: Protocol,
    pending: BTreeMap<EdgeId, Pending>,
    arrived: HashMap<EdgeId, Vec<f64>>,
    staged: Vec<(TransferKey, u64)>,
    stats: TransferStats,
}




// ============================================================================
impl<'r, C: Communicator> TransferEngine<'r, C> {

    pub fn new(runtime: &'r Runtime<C>, protocol: Protocol) -> Self {
        Self {
            runtime,
            protocol,
            pending: BTreeMap::new(),
            arrived: HashMap::new(),
            staged: Vec::new(),
            stats: TransferStats::default(),
        }
    }

    pub fn runtime(&self) -> &'r Runtime<C> {
        self.runtime
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn into_stats(self) -> TransferStats {
        self.stats
    }

    pub(crate) fn count_region(&mut self) {
        self.stats.regions += 1
    }


    /**
     * Register the receive for a remote edge ending on this rank. Under
     * pull this also sends the request to the edge's producer.
     */
    pub fn irecv<const D: usize>(&mut self, edge: &Edge<D>, scomp: usize, ncomp: usize) -> Result<(), TransferError> {
        let key = edge.key(scomp, ncomp);
        let seq = Ledger::next(&mut self.runtime.ledger().posted, key);
        let len = edge.target.len() * ncomp;
        self.pending.insert(edge.id, Pending { key, seq, len });

        if self.protocol == Protocol::Pull {
            let request = Message::Request { key, seq, reply_to: self.runtime.rank() };
            self.runtime.comm().send(edge.src_owner, request.encode()?)?;
            self.stats.requests += 1;
        }
        Ok(())
    }


    /**
     * Register the receives for every remote edge of a graph which ends on
     * this rank.
     */
    pub fn post_receives<const D: usize>(&mut self, graph: &RegionGraph<D>, scomp: usize, ncomp: usize) -> Result<(), TransferError> {
        let rank = self.runtime.rank();

        for edge in graph.edges().iter().filter(|e| e.dst_owner == rank && !e.is_local()) {
            self.irecv(edge, scomp, ncomp)?;
        }
        Ok(())
    }


    /**
     * Hand over the buffer of a remote edge leaving this rank. Under push it
     * is sent at once; under pull it is staged until the consumer's request
     * is matched.
     */
    pub fn isend<const D: usize>(&mut self, edge: &Edge<D>, scomp: usize, ncomp: usize, payload: Vec<f64>) -> Result<(), TransferError> {
        let key = edge.key(scomp, ncomp);
        let mut ledger = self.runtime.ledger();
        let seq = Ledger::next(&mut ledger.produced, key);

        self.stats.sends += 1;
        self.stats.bytes_sent += payload.len() * std::mem::size_of::<f64>();

        match self.protocol {
            Protocol::Push => {
                let message = Message::Data { key, seq, protocol: Protocol::Push, payload };
                self.runtime.comm().send(edge.dst_owner, message.encode()?)
            }
            Protocol::Pull => {
                ledger.staged.entry(key).or_default().insert(seq, payload);
                self.staged.push((key, seq));
                ledger.serve(self.runtime.comm(), key, seq)
            }
        }
    }


    /**
     * Deliver the buffer of an edge whose ends are both on this rank. The
     * caller marks the edge complete on its iterator.
     */
    pub fn deliver_local(&mut self, edge: EdgeId, payload: Vec<f64>) {
        self.stats.local_copies += 1;
        self.arrived.insert(edge, payload);
    }


    /**
     * Remove and return the buffer that arrived for an edge.
     */
    pub fn take(&mut self, edge: EdgeId) -> Option<Vec<f64>> {
        self.arrived.remove(&edge)
    }

    fn collect(&mut self, completed: &mut Vec<EdgeId>) -> Result<(), TransferError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut ledger = self.runtime.ledger();
        let protocol = self.protocol;
        let mut found = Vec::new();

        for (&edge, &Pending { key, seq, len }) in &self.pending {
            if let Some((sent_with, payload)) = ledger.data.get_mut(&key).and_then(|d| d.remove(&seq)) {
                if sent_with != protocol {
                    return Err(TransferError::Unexpected { key, protocol: sent_with });
                }
                if payload.len() != len {
                    return Err(TransferError::PayloadSize {
                        key,
                        protocol,
                        expected: len,
                        received: payload.len(),
                    });
                }
                ledger.taken.insert(key, seq + 1);
                found.push((edge, payload));
            }
        }
        drop(ledger);

        for (edge, payload) in found {
            self.pending.remove(&edge);
            self.arrived.insert(edge, payload);
            self.stats.receives += 1;
            completed.push(edge);
        }
        Ok(())
    }

    fn drain(&self, timeout: Duration) -> Result<(), TransferError> {
        let comm = self.runtime.comm();
        let mut wait = timeout;

        while let Some(bytes) = comm.recv_timeout(wait)? {
            let message = Message::decode(&bytes)?;
            self.runtime.ledger().accept(comm, message)?;
            wait = Duration::ZERO;
        }
        Ok(())
    }
}

impl<'r, C: Communicator> Progress for TransferEngine<'r, C> {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn progress(&mut self, timeout: Duration) -> Result<Vec<EdgeId>, TransferError> {
        let mut completed = Vec::new();
        self.collect(&mut completed)?;

        if completed.is_empty() {
            self.drain(timeout)?;
            self.collect(&mut completed)?;
        }
        Ok(completed)
    }

    fn is_quiescent(&self) -> bool {
        let ledger = self.runtime.ledger();
        self.pending.is_empty() && self.staged.iter().all(|(key, seq)| !ledger.is_staged(key, *seq))
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Message, Protocol, TransferEngine};
    use crate::error::TransferError;
    use crate::graph::{build_dependency_graph, RegionGraph};
    use crate::index_space::range2d;
    use crate::layout::BoxLayout;
    use crate::message::{Communicator, LocalCommunicator};
    use crate::rg_iter::Progress;
    use crate::runtime::Runtime;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(20);

    /// Fine box on rank 1 over a coarse box on rank 0.
    fn remote_graph() -> RegionGraph<2> {
        let fine = BoxLayout::new(1, vec![(range2d(0..4, 0..4), 1)]);
        let coarse = BoxLayout::new(0, vec![(range2d(0..2, 0..2), 0)]);
        build_dependency_graph(&fine, &coarse, 2).unwrap()
    }

    fn runtimes() -> (Runtime<LocalCommunicator>, Runtime<LocalCommunicator>) {
        let mut comms = LocalCommunicator::group(2).into_iter();
        let r0 = Runtime::new(comms.next().unwrap());
        let r1 = Runtime::new(comms.next().unwrap());
        (r0, r1)
    }

    #[test]
    fn protocols_parse_from_their_names() {
        assert_eq!("push".parse::<Protocol>(), Ok(Protocol::Push));
        assert_eq!(Protocol::Pull.to_string().parse::<Protocol>(), Ok(Protocol::Pull));
        assert!("poll".parse::<Protocol>().is_err());
    }

    #[test]
    fn messages_survive_encoding() {
        let graph = remote_graph();
        let message = Message::Data {
            key: graph.edges()[0].key(0, 1),
            seq: 3,
            protocol: Protocol::Push,
            payload: vec![1.0, 2.5],
        };
        assert_eq!(Message::decode(&message.encode().unwrap()).unwrap(), message);
        assert!(Message::decode(&[0xc1]).is_err());
    }

    #[test]
    fn pushed_buffer_is_taken_by_consumer() {
        let graph = remote_graph();
        let edge = &graph.edges()[0];
        let (r0, r1) = runtimes();

        let mut producer = TransferEngine::new(&r1, Protocol::Push);
        let mut consumer = TransferEngine::new(&r0, Protocol::Push);
        consumer.irecv(edge, 0, 1).unwrap();
        producer.isend(edge, 0, 1, vec![7.0; 4]).unwrap();

        assert_eq!(consumer.progress(WAIT).unwrap(), vec![edge.id]);
        assert_eq!(consumer.take(edge.id), Some(vec![7.0; 4]));
        assert!(consumer.is_quiescent());
        assert!(producer.is_quiescent());
    }

    #[test]
    fn pull_request_before_staging_is_answered_on_stage() {
        let graph = remote_graph();
        let edge = &graph.edges()[0];
        let (r0, r1) = runtimes();

        let mut consumer = TransferEngine::new(&r0, Protocol::Pull);
        let mut producer = TransferEngine::new(&r1, Protocol::Pull);
        consumer.irecv(edge, 0, 1).unwrap();

        // The request is now waiting in the producer's inbox.
        assert!(producer.progress(WAIT).unwrap().is_empty());
        producer.isend(edge, 0, 1, vec![3.0; 4]).unwrap();
        assert!(producer.is_quiescent());

        assert_eq!(consumer.progress(WAIT).unwrap(), vec![edge.id]);
        assert_eq!(consumer.take(edge.id), Some(vec![3.0; 4]));
        assert_eq!(consumer.stats().requests, 1);
    }

    #[test]
    fn staged_pull_buffer_waits_for_its_request() {
        let graph = remote_graph();
        let edge = &graph.edges()[0];
        let (r0, r1) = runtimes();

        let mut producer = TransferEngine::new(&r1, Protocol::Pull);
        producer.isend(edge, 0, 1, vec![5.0; 4]).unwrap();
        assert!(!producer.is_quiescent());

        let mut consumer = TransferEngine::new(&r0, Protocol::Pull);
        consumer.irecv(edge, 0, 1).unwrap();
        producer.progress(WAIT).unwrap();
        assert!(producer.is_quiescent());
        assert_eq!(consumer.progress(WAIT).unwrap(), vec![edge.id]);
    }

    #[test]
    fn replayed_message_is_stale() {
        let graph = remote_graph();
        let edge = &graph.edges()[0];
        let (r0, r1) = runtimes();

        let mut producer = TransferEngine::new(&r1, Protocol::Push);
        let mut consumer = TransferEngine::new(&r0, Protocol::Push);
        consumer.irecv(edge, 0, 1).unwrap();
        producer.isend(edge, 0, 1, vec![1.0; 4]).unwrap();
        assert_eq!(consumer.progress(WAIT).unwrap(), vec![edge.id]);

        let replay = Message::Data {
            key: edge.key(0, 1),
            seq: 0,
            protocol: Protocol::Push,
            payload: vec![1.0; 4],
        };
        r1.comm().send(0, replay.encode().unwrap()).unwrap();

        let mut next = TransferEngine::new(&r0, Protocol::Push);
        next.irecv(edge, 0, 1).unwrap();
        assert!(matches!(
            next.progress(WAIT),
            Err(TransferError::Stale { expected: 1, received: 0, protocol: Protocol::Push, .. })
        ));
    }

    #[test]
    fn protocol_disagreement_is_unexpected() {
        let graph = remote_graph();
        let edge = &graph.edges()[0];
        let (r0, r1) = runtimes();

        let mut producer = TransferEngine::new(&r1, Protocol::Push);
        let mut consumer = TransferEngine::new(&r0, Protocol::Pull);
        consumer.irecv(edge, 0, 1).unwrap();
        producer.isend(edge, 0, 1, vec![1.0; 4]).unwrap();

        assert!(matches!(
            consumer.progress(WAIT),
            Err(TransferError::Unexpected { protocol: Protocol::Push, .. })
        ));
    }

    #[test]
    fn early_message_is_held_for_the_next_invocation() {
        let graph = remote_graph();
        let edge = &graph.edges()[0];
        let (r0, r1) = runtimes();

        let mut producer = TransferEngine::new(&r1, Protocol::Push);
        producer.isend(edge, 0, 1, vec![1.0; 4]).unwrap();
        producer.isend(edge, 0, 1, vec![2.0; 4]).unwrap();

        for expected in [1.0, 2.0] {
            let mut consumer = TransferEngine::new(&r0, Protocol::Push);
            consumer.irecv(edge, 0, 1).unwrap();
            assert_eq!(consumer.progress(WAIT).unwrap(), vec![edge.id]);
            assert_eq!(consumer.take(edge.id), Some(vec![expected; 4]));
        }
    }

    #[test]
    fn payload_of_the_wrong_length_is_rejected() {
        let graph = remote_graph();
        let edge = &graph.edges()[0];
        let (r0, r1) = runtimes();

        let mut producer = TransferEngine::new(&r1, Protocol::Push);
        let mut consumer = TransferEngine::new(&r0, Protocol::Push);
        consumer.irecv(edge, 0, 1).unwrap();
        producer.isend(edge, 0, 1, vec![1.0; 5]).unwrap();

        assert!(matches!(
            consumer.progress(WAIT),
            Err(TransferError::PayloadSize { expected: 4, received: 5, .. })
        ));
        assert_eq!(consumer.take(edge.id), None);
    }
}
