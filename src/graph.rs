//! Dependency graphs between regions.
//!
//! A `RegionGraph` is built once per grid configuration, from the box
//! layouts of one or two levels, and is a pure function of its inputs: every
//! rank that builds a graph from the same layouts gets the same nodes, the
//! same edges, and the same edge numbering. Edge numbers are therefore usable
//! as part of a message key. Overlaps are computed geometrically, so a coarse
//! layout need not be an exact coarsening of the fine layout above it.

use std::collections::{BTreeMap, BTreeSet};
use log::debug;

use crate::adjacency_list::AdjacencyList;
use crate::error::ConfigurationError;
use crate::geometry::Geometry;
use crate::index_space::{IndexSpace, Ratio};
use crate::layout::BoxLayout;
use crate::message::Rank;
use crate::region::RegionId;
use crate::transfer::TransferKey;

/// Number of an edge within its graph.
pub type EdgeId = usize;

/// What a graph edge transfers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    /// Fine data averaged onto the coarse level below it.
    Restrict,
    /// Valid data copied into the ghost zones of a neighbor on the same
    /// level.
    Halo,
}

/// A vertex of the graph: a region's box and its owner.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionNode<const D: usize> {
    pub id: RegionId,
    pub space: IndexSpace<D>,
    pub owner: Rank,
}

/// A required data transfer from one region to another. The `source` zones
/// are read from the source region, and the `target` zones written in the
/// destination region. For restriction edges `source` is `target` refined by
/// the graph's ratio; for halo edges `source` is `target` translated by
/// `shift`, which is non-zero for periodic images.
#[derive(Clone, Debug, PartialEq)]
pub struct Edge<const D: usize> {
    pub id: EdgeId,
    pub kind: EdgeKind,
    pub src: RegionId,
    pub dst: RegionId,
    pub src_owner: Rank,
    pub dst_owner: Rank,
    pub source: IndexSpace<D>,
    pub target: IndexSpace<D>,
    pub shift: [i64; D],
}

impl<const D: usize> Edge<D> {
    /// Whether both ends are owned by the same rank, in which case the
    /// transfer is a direct copy.
    pub fn is_local(&self) -> bool {
        self.src_owner == self.dst_owner
    }

    /// Return the message key for moving the given components along this
    /// edge.
    pub fn key(&self, scomp: usize, ncomp: usize) -> TransferKey {
        TransferKey {
            src: self.src,
            dst: self.dst,
            edge: self.id,
            scomp,
            ncomp,
        }
    }
}

/// Regions as nodes and required transfers as directed edges, for one level
/// (neighbor exchange) or one pair of levels (restriction).
pub struct RegionGraph<const D: usize> {
    src_level: u32,
    dst_level: u32,
    ratio: Option<Ratio<D>>,
    nodes: BTreeMap<RegionId, RegionNode<D>>,
    edges: Vec<Edge<D>>,
    adjacency: AdjacencyList<RegionId>,
}

impl<const D: usize> RegionGraph<D> {
    fn with_nodes<'a, I>(src_level: u32, dst_level: u32, ratio: Option<Ratio<D>>, layouts: I) -> Self
    where
        I: IntoIterator<Item = &'a BoxLayout<D>>,
    {
        let mut nodes = BTreeMap::new();

        for layout in layouts {
            for (n, space, owner) in layout.iter() {
                let id = RegionId::new(layout.level(), n);
                nodes.insert(id, RegionNode { id, space: space.clone(), owner });
            }
        }
        Self {
            src_level,
            dst_level,
            ratio,
            nodes,
            edges: Vec::new(),
            adjacency: AdjacencyList::new(),
        }
    }

    fn push_edge(&mut self, kind: EdgeKind, src: RegionId, dst: RegionId, source: IndexSpace<D>, target: IndexSpace<D>, shift: [i64; D]) {
        let src_owner = self.nodes[&src].owner;
        let dst_owner = self.nodes[&dst].owner;
        let id = self.adjacency.insert(src, dst);

        self.edges.push(Edge {
            id,
            kind,
            src,
            dst,
            src_owner,
            dst_owner,
            source,
            target,
            shift,
        })
    }

    /// The level data flows out of.
    pub fn src_level(&self) -> u32 {
        self.src_level
    }

    /// The level data flows into. Equal to `src_level` for neighbor graphs.
    pub fn dst_level(&self) -> u32 {
        self.dst_level
    }

    /// The refinement ratio of a restriction graph.
    pub fn ratio(&self) -> Option<Ratio<D>> {
        self.ratio
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &RegionNode<D>> {
        self.nodes.values()
    }

    pub fn node(&self, id: RegionId) -> Option<&RegionNode<D>> {
        self.nodes.get(&id)
    }

    pub fn edges(&self) -> &[Edge<D>] {
        &self.edges
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge<D>> {
        self.edges.get(id)
    }

    /// Edges pointing into the given region, in edge order.
    pub fn incoming(&self, id: RegionId) -> impl Iterator<Item = &Edge<D>> {
        self.adjacency.incoming_edges(&id).map(move |e| &self.edges[e])
    }

    /// Edges leaving the given region, in edge order.
    pub fn outgoing(&self, id: RegionId) -> impl Iterator<Item = &Edge<D>> {
        self.adjacency.outgoing_edges(&id).map(move |e| &self.edges[e])
    }

    pub fn in_degree(&self, id: RegionId) -> usize {
        self.adjacency.in_degree(&id)
    }

    /// Nodes owned by the given rank, in id order.
    pub fn local_nodes(&self, rank: Rank) -> impl Iterator<Item = &RegionNode<D>> {
        self.nodes.values().filter(move |n| n.owner == rank)
    }

    /// Total number of zones read by all edges together.
    pub fn source_volume(&self) -> usize {
        self.edges.iter().map(|e| e.source.len()).sum()
    }
}

/// Build the restriction graph from a fine layout onto the coarse layout
/// below it. There is one edge for each (fine box, coarse box) pair whose
/// footprints overlap once the fine box is coarsened by `ratio`, and it
/// carries the overlapping coarse zones.
///
/// Every fine box must be aligned to the ratio, the boxes of each layout
/// must be pairwise disjoint, and every coarsened fine zone must fall inside
/// some coarse box. Violations are reported as configuration errors naming
/// the offending boxes, never silently dropped.
pub fn build_dependency_graph<R, const D: usize>(
    fine: &BoxLayout<D>,
    coarse: &BoxLayout<D>,
    ratio: R,
) -> Result<RegionGraph<D>, ConfigurationError>
where
    R: Into<Ratio<D>>,
{
    let ratio = ratio.into();
    let fine_level = fine.level();
    let coarse_level = coarse.level();

    if fine_level == coarse_level {
        return Err(ConfigurationError::LevelsNotDistinct { level: fine_level });
    }
    if !ratio.is_valid() {
        return Err(ConfigurationError::InvalidRatio {
            fine_level,
            coarse_level,
            ratio: ratio.to_string(),
        });
    }
    if let Some((n, space, _)) = fine.iter().find(|(_, space, _)| !space.is_aligned(&ratio)) {
        return Err(ConfigurationError::Misaligned {
            fine_level,
            coarse_level,
            index: n,
            space: space.to_string(),
            ratio: ratio.to_string(),
        });
    }
    for layout in [fine, coarse] {
        if let Some((a, b)) = layout.first_overlapping_pair() {
            return Err(ConfigurationError::OverlappingBoxes { level: layout.level(), a, b });
        }
    }

    let mut graph = RegionGraph::with_nodes(fine_level, coarse_level, Some(ratio), [fine, coarse]);
    let index = coarse.index();
    let mut seen = BTreeSet::new();

    for (f, fine_space, _) in fine.iter() {
        let footprint = fine_space.coarsen(&ratio);
        let mut covered = 0;

        for c in index.query(coarse, &footprint) {
            let coarse_space = match coarse.get(c) {
                Some((space, _)) => space,
                None => continue,
            };
            if let Some(target) = footprint.intersect(coarse_space) {
                if seen.insert((f, c)) {
                    covered += target.len();
                    graph.push_edge(
                        EdgeKind::Restrict,
                        RegionId::new(fine_level, f),
                        RegionId::new(coarse_level, c),
                        target.refine(&ratio),
                        target,
                        [0; D],
                    );
                }
            }
        }

        if covered < footprint.len() {
            return Err(ConfigurationError::MissingOverlap {
                fine_level,
                coarse_level,
                index: f,
                missing: footprint.len() - covered,
            });
        }
    }

    debug!(
        "restriction graph {} -> {}: {} regions, {} edges",
        fine_level,
        coarse_level,
        graph.num_nodes(),
        graph.num_edges()
    );
    Ok(graph)
}

/// Build the neighbor graph between two layouts of the same level. Each box
/// grown by `num_ghost` zones receives an edge from every box of the other
/// layout whose valid zones overlap it, including overlaps with periodic
/// images of the domain. Edges are generated in both directions, and a box
/// never depends on its own unshifted self.
///
/// The two layouts share the level's id space, so a box index present in
/// both must describe the same box. The boxes of each layout must be
/// pairwise disjoint. Passing one layout twice gives the
/// ordinary intra-level halo graph.
pub fn build_neighbor_graph<const D: usize>(
    a: &BoxLayout<D>,
    b: &BoxLayout<D>,
    num_ghost: usize,
    geometry: &Geometry<D>,
) -> Result<RegionGraph<D>, ConfigurationError> {
    let level = a.level();

    if b.level() != level {
        return Err(ConfigurationError::LevelMismatch { a: level, b: b.level() });
    }
    if let Some(n) = (0..a.len().min(b.len())).find(|&n| a.get(n) != b.get(n)) {
        return Err(ConfigurationError::InconsistentLayouts { level, index: n });
    }
    for layout in [a, b] {
        if let Some((p, q)) = layout.first_overlapping_pair() {
            return Err(ConfigurationError::OverlappingBoxes { level, a: p, b: q });
        }
    }

    let mut shifts = vec![[0; D]];
    shifts.extend(geometry.periodic_shifts());

    let mut graph = RegionGraph::with_nodes(level, level, None, [a, b]);
    let mut seen = BTreeSet::new();

    for (src_layout, dst_layout) in [(a, b), (b, a)] {
        let index = src_layout.index();

        for (d, dst_space, _) in dst_layout.iter() {
            let grown = dst_space.extend_all(num_ghost as i64);

            for shift in &shifts {
                let image = grown.translate(*shift);

                for s in index.query(src_layout, &image) {
                    if s == d && shift.iter().all(|&x| x == 0) {
                        continue;
                    }
                    let src_space = match src_layout.get(s) {
                        Some((space, _)) => space,
                        None => continue,
                    };
                    if let Some(source) = src_space.intersect(&image) {
                        if seen.insert((s, d, *shift)) {
                            let target = source.translate(shift.map(|x| -x));
                            graph.push_edge(
                                EdgeKind::Halo,
                                RegionId::new(level, s),
                                RegionId::new(level, d),
                                source,
                                target,
                                *shift,
                            );
                        }
                    }
                }
            }
        }
    }

    debug!(
        "neighbor graph on level {}: {} regions, {} edges",
        level,
        graph.num_nodes(),
        graph.num_edges()
    );
    Ok(graph)
}
