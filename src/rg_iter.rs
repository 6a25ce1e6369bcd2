//! Traversal of a region graph in dependency order.
//!
//! `RGIter` walks the regions of a graph owned by one rank, yielding each one
//! once all of its inbound edges have completed. It learns about completions
//! by polling a `Progress` source, normally a transfer engine, and suspends
//! only inside that poll. The caller handles each yielded region (merging
//! its inbound buffers, and issuing its outbound transfers), and marks local
//! edges complete itself with `RGIter::complete`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use log::{debug, trace};

use crate::config::RuntimeConfig;
use crate::error::{Error, TransferError};
use crate::graph::{Edge, EdgeId, RegionGraph, RegionNode};
use crate::message::Rank;
use crate::region::RegionId;
use crate::transfer::Protocol;




/// Returned by [`RGIter::complete`] to indicate whether the destination
/// region of the completed edge is now eligible to be yielded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Eligible,
    Ineligible,
}

impl Status {
    pub fn eligible_if(condition: bool) -> Self {
        if condition {
            Self::Eligible
        } else {
            Self::Ineligible
        }
    }
}




/// A source of transfer completions, polled by the graph iterator.
///
pub trait Progress {
    /// Return the protocol the transfers are being moved with.
    fn protocol(&self) -> Protocol;

    /// Wait at most `timeout` for transfers to complete, and return the
    /// edges that completed since the last call. An empty list means nothing
    /// happened within the timeout.
    fn progress(&mut self, timeout: Duration) -> Result<Vec<EdgeId>, TransferError>;

    /// Must return true when there is no outstanding work on this rank: no
    /// receives waiting, and no staged buffers waiting to be requested.
    fn is_quiescent(&self) -> bool;
}




/// A region whose inbound edges have all completed.
#[derive(Debug)]
pub struct Ready<'g, const D: usize> {
    pub node: &'g RegionNode<D>,
    pub incoming: Vec<&'g Edge<D>>,
    pub outgoing: Vec<&'g Edge<D>>,
}

impl<'g, const D: usize> Ready<'g, D> {
    pub fn id(&self) -> RegionId {
        self.node.id
    }
}




/// Iterator over the regions of a graph owned by one rank, in dependency
/// order. Among regions which are ready at the same time, the one with the
/// smallest `RegionId` comes first. No region is yielded twice.
///
/// After the last local region is yielded the iterator keeps polling until
/// the progress source is quiescent, so that buffers staged for other ranks
/// are served before the invocation ends. A transfer error, or a stall
/// longer than the configured timeout, is yielded once; the iterator
/// returns `None` afterwards.
///
pub struct RGIter<'g, 'p, P, const D: usize> {
    graph: &'g RegionGraph<D>,
    progress: &'p mut P,
    rank: Rank,
    poll_interval: Duration,
    stall_timeout: Duration,
    waiting: BTreeMap<RegionId, usize>,
    eligible: BTreeSet<RegionId>,
    completed: Vec<bool>,
    last_completion: Instant,
    fused: bool,
}




// ============================================================================
impl<'g, 'p, P: Progress, const D: usize> RGIter<'g, 'p, P, D> {

    pub fn new(graph: &'g RegionGraph<D>, rank: Rank, progress: &'p mut P) -> Self {
        let config = RuntimeConfig::default();
        let mut iter = Self {
            graph,
            progress,
            rank,
            poll_interval: config.poll_interval(),
            stall_timeout: config.stall_timeout(),
            waiting: BTreeMap::new(),
            eligible: BTreeSet::new(),
            completed: Vec::new(),
            last_completion: Instant::now(),
            fused: false,
        };
        iter.restart();
        iter
    }

    /// Take the polling interval and stall timeout from a runtime
    /// configuration.
    pub fn with_config(mut self, config: &RuntimeConfig) -> Self {
        self.poll_interval = config.poll_interval();
        self.stall_timeout = config.stall_timeout();
        self
    }

    /// Reset the traversal, so every local region is yielded again as its
    /// inbound edges complete. Completions recorded so far are forgotten.
    pub fn restart(&mut self) {
        self.waiting.clear();
        self.eligible.clear();

        for node in self.graph.local_nodes(self.rank) {
            let n = self.graph.in_degree(node.id);

            if n == 0 {
                self.eligible.insert(node.id);
            } else {
                self.waiting.insert(node.id, n);
            }
        }
        self.completed = vec![false; self.graph.num_edges()];
        self.last_completion = Instant::now();
        self.fused = false;
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn progress_mut(&mut self) -> &mut P {
        &mut *self.progress
    }

    pub fn progress(&self) -> &P {
        &*self.progress
    }

    /// Return the local regions still waiting on inbound edges.
    pub fn waiting(&self) -> impl Iterator<Item = RegionId> + '_ {
        self.waiting.keys().copied()
    }


    /// Record that an edge ending on this rank has completed. Fails if the
    /// edge does not exist, does not end here, or was already completed.
    ///
    pub fn complete(&mut self, edge: EdgeId) -> Result<Status, TransferError> {
        let unknown = TransferError::UnknownEdge { edge, rank: self.rank };
        let dst = match self.graph.edge(edge) {
            Some(e) if e.dst_owner == self.rank && !self.completed[edge] => e.dst,
            _ => return Err(unknown),
        };
        self.completed[edge] = true;
        self.last_completion = Instant::now();

        let remaining = match self.waiting.get_mut(&dst) {
            Some(n) => {
                *n -= 1;
                *n
            }
            None => return Err(unknown),
        };
        trace!("edge {} into {} complete, {} remaining", edge, dst, remaining);

        if remaining == 0 {
            self.waiting.remove(&dst);
            self.eligible.insert(dst);
        }
        Ok(Status::eligible_if(remaining == 0))
    }

    fn ready(&self, id: RegionId) -> Option<Ready<'g, D>> {
        let graph = self.graph;
        graph.node(id).map(|node| Ready {
            node,
            incoming: graph.incoming(id).collect(),
            outgoing: graph.outgoing(id).collect(),
        })
    }

    fn fail(&mut self, error: TransferError) -> Option<Result<Ready<'g, D>, Error>> {
        self.fused = true;
        Some(Err(error.into()))
    }

    fn stalled(&self) -> TransferError {
        let waiting: Vec<_> = self.waiting.keys().map(|id| id.to_string()).collect();

        TransferError::Stalled {
            protocol: self.progress.protocol(),
            elapsed: self.last_completion.elapsed(),
            waiting: if waiting.is_empty() {
                "none (staged buffers not yet requested)".to_string()
            } else {
                waiting.join(", ")
            },
        }
    }
}

impl<'g, 'p, P: Progress, const D: usize> Iterator for RGIter<'g, 'p, P, D> {
    type Item = Result<Ready<'g, D>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        loop {
            if let Some(id) = self.eligible.pop_first() {
                return self.ready(id).map(Ok);
            }
            if self.waiting.is_empty() && self.progress.is_quiescent() {
                debug!("rank {} traversal complete", self.rank);
                self.fused = true;
                return None;
            }
            match self.progress.progress(self.poll_interval) {
                Err(e) => return self.fail(e),
                Ok(edges) if edges.is_empty() => {
                    if self.last_completion.elapsed() > self.stall_timeout {
                        let error = self.stalled();
                        return self.fail(error);
                    }
                }
                Ok(edges) => {
                    for edge in edges {
                        if let Err(e) = self.complete(edge) {
                            return self.fail(e);
                        }
                    }
                }
            }
        }
    }
}




// ============================================================================
impl<const D: usize> RegionGraph<D> {

    /// Start a traversal of the regions owned by `rank`, with completions
    /// polled from `progress`.
    pub fn iter<'g, 'p, P: Progress>(&'g self, rank: Rank, progress: &'p mut P) -> RGIter<'g, 'p, P, D> {
        RGIter::new(self, rank, progress)
    }
}
