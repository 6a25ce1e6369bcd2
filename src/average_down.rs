//! Restriction of fine-level data onto the coarse level beneath it.
//!
//! Each fine region averages the zones under every coarse zone it covers
//! into one buffer per outbound edge of the restriction graph; each coarse
//! region merges the buffers of its inbound edges into a private
//! accumulator and normalizes it into its data. The same kernel and the same
//! merge run under both protocols, and buffers are merged in edge order, so
//! push and pull produce bit-identical results which do not depend on the
//! order messages arrive in.

use std::fmt;
use std::str::FromStr;
use log::debug;
use rayon::prelude::*;

use crate::error::{ConfigurationError, Error, TransferError};
use crate::geometry::Geometry;
use crate::graph::{Edge, RegionGraph};
use crate::index_space::{IndexSpace, Ratio};
use crate::level::LevelData;
use crate::message::{Communicator, Rank};
use crate::region::Region;
use crate::rg_iter::{RGIter, Ready};
use crate::runtime::Runtime;
use crate::transfer::{Protocol, TransferEngine, TransferStats};




/**
 * How the fine zones under a coarse zone are combined.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Weighting {
    /// Arithmetic mean of the fine zones.
    Cell,
    /// Mean of the fine zones weighted by their volume in the fine
    /// geometry.
    Volume,
}




impl FromStr for Weighting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cell" => Ok(Weighting::Cell),
            "volume" => Ok(Weighting::Volume),
            _ => Err(format!("unknown weighting '{}', expected cell or volume", s)),
        }
    }
}




/**
 * The stages one invocation passes through on each rank.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Receives (and pull requests) for remote inbound edges are posted.
    Issued,
    /// Every local fine region has staged its outbound buffers.
    InFlight,
    /// Every local coarse region has merged its inbound buffers.
    Merged,
    /// Staged buffers are all served, and the call is returning.
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct PhaseLog {
    phase: Phase,
    rank: Rank,
    protocol: Protocol,
    levels: (u32, u32),
}

impl PhaseLog {
    fn start(rank: Rank, protocol: Protocol, levels: (u32, u32)) -> Self {
        let log = Self { phase: Phase::Issued, rank, protocol, levels };
        log.report();
        log
    }

    fn advance(&mut self, phase: Phase) {
        if phase > self.phase {
            self.phase = phase;
            self.report();
        }
    }

    fn report(&self) {
        debug!(
            "average_down {} {} -> {} on rank {}: {}",
            self.protocol, self.levels.0, self.levels.1, self.rank, self.phase
        );
    }
}




/**
 * Average the fine zones under each zone of `target` (a coarse index space)
 * and return the results, in row-major order with the `ncomp` components of
 * each coarse zone together. The fine zones are read from `fine`, which must
 * contain `target` refined by `ratio`.
 */
pub fn restrict_overlap<const D: usize>(
    fine: &Region<D>,
    geometry: &Geometry<D>,
    target: &IndexSpace<D>,
    ratio: &Ratio<D>,
    scomp: usize,
    ncomp: usize,
    weighting: Weighting,
) -> Vec<f64> {
    let block = IndexSpace::<D>::new(std::array::from_fn(|a| 0..ratio.along(a)));
    let mut buffer = Vec::with_capacity(target.len() * ncomp);
    let mut sum = vec![0.0; ncomp];

    for coarse in target {
        let mut weight = 0.0;
        sum.iter_mut().for_each(|s| *s = 0.0);

        for offset in &block {
            let index: [i64; D] = std::array::from_fn(|a| coarse[a] * ratio.along(a) + offset[a]);
            let w = match weighting {
                Weighting::Cell => 1.0,
                Weighting::Volume => geometry.cell_volume(index),
            };
            for (s, f) in sum.iter_mut().zip(&fine.get_slice(index)[scomp..scomp + ncomp]) {
                *s += w * f
            }
            weight += w;
        }
        buffer.extend(sum.iter().map(|s| s / weight));
    }
    buffer
}




/**
 * Sums of the contributions to each zone of one coarse region, and the
 * number of contributions. Zones which received nothing are left alone when
 * the accumulator is written back.
 */
struct CoarseAccumulator<const D: usize> {
    space: IndexSpace<D>,
    ncomp: usize,
    sum: Vec<f64>,
    hits: Vec<u32>,
}

impl<const D: usize> CoarseAccumulator<D> {
    fn new(space: IndexSpace<D>, ncomp: usize) -> Self {
        let len = space.len();
        Self {
            space,
            ncomp,
            sum: vec![0.0; len * ncomp],
            hits: vec![0; len],
        }
    }

    fn add(&mut self, target: &IndexSpace<D>, payload: &[f64]) {
        for (index, values) in target.iter().zip(payload.chunks_exact(self.ncomp)) {
            let n = self.space.row_major_offset(index);
            self.hits[n] += 1;

            for (s, v) in self.sum[n * self.ncomp..(n + 1) * self.ncomp].iter_mut().zip(values) {
                *s += v
            }
        }
    }

    fn write_into(self, region: &mut Region<D>, scomp: usize) {
        for (n, index) in self.space.iter().enumerate() {
            if self.hits[n] > 0 {
                let hits = self.hits[n] as f64;
                let sums = &self.sum[n * self.ncomp..(n + 1) * self.ncomp];
                let zone = &mut region.get_slice_mut(index)[scomp..scomp + self.ncomp];

                for (x, s) in zone.iter_mut().zip(sums) {
                    *x = s / hits
                }
            }
        }
    }
}




#[allow(clippy::too_many_arguments)]
fn check_restriction<const D: usize>(
    fine_data: &LevelData<D>,
    coarse_data: &LevelData<D>,
    graph: &RegionGraph<D>,
    fine_geom: &Geometry<D>,
    coarse_geom: &Geometry<D>,
    scomp: usize,
    ncomp: usize,
    ratio: &Ratio<D>,
) -> Result<(), ConfigurationError> {
    let fine_level = fine_data.level();
    let coarse_level = coarse_data.level();

    if graph.src_level() != fine_level || graph.dst_level() != coarse_level {
        return Err(ConfigurationError::GraphMismatch {
            graph_src: graph.src_level(),
            graph_dst: graph.dst_level(),
            src: fine_level,
            dst: coarse_level,
        });
    }
    if graph.ratio() != Some(*ratio) {
        return Err(ConfigurationError::RatioMismatch {
            fine_level,
            coarse_level,
            graph: graph.ratio().map_or("no ratio".to_string(), |r| r.to_string()),
            given: ratio.to_string(),
        });
    }
    fine_data.check_components(scomp, ncomp)?;
    coarse_data.check_components(scomp, ncomp)?;

    if *fine_geom.domain() != coarse_geom.domain().refine(ratio) {
        return Err(ConfigurationError::GeometryMismatch {
            fine_level,
            coarse_level,
            fine: fine_geom.domain().to_string(),
            coarse: coarse_geom.domain().to_string(),
            ratio: ratio.to_string(),
        });
    }
    Ok(())
}




/**
 * Average the components `scomp..scomp + ncomp` of the fine level down onto
 * the coarse level, over a restriction graph built from the two levels'
 * layouts with `build_dependency_graph`. Every rank holding regions of
 * either level must make the matching call.
 *
 * Coarse zones not covered by the fine level, and components outside the
 * range, are left untouched. The call returns once every local coarse
 * region has merged all of its inbound buffers and every buffer this rank
 * staged for another rank has been delivered. Any error aborts the
 * invocation; the coarse data is then only partially updated.
 */
#[allow(clippy::too_many_arguments)]
pub fn average_down<C, R, const D: usize>(
    runtime: &Runtime<C>,
    fine_data: &LevelData<D>,
    coarse_data: &mut LevelData<D>,
    graph: &RegionGraph<D>,
    fine_geom: &Geometry<D>,
    coarse_geom: &Geometry<D>,
    (scomp, ncomp): (usize, usize),
    ratio: R,
    protocol: Protocol,
    weighting: Weighting,
) -> Result<TransferStats, Error>
where
    C: Communicator,
    R: Into<Ratio<D>>,
{
    let ratio = ratio.into();
    let rank = runtime.rank();
    let fine_level = graph.src_level();

    check_restriction(fine_data, coarse_data, graph, fine_geom, coarse_geom, scomp, ncomp, &ratio)?;

    let _claim = runtime.claim(fine_data.ids().chain(coarse_data.ids()), "average_down")?;
    let mut engine = TransferEngine::new(runtime, protocol);
    engine.post_receives(graph, scomp, ncomp)?;

    let num_fine = graph.local_nodes(rank).filter(|n| n.id.level == fine_level).count();
    let num_coarse = graph.local_nodes(rank).count() - num_fine;
    let (mut staged, mut merged) = (0, 0);
    let mut phases = PhaseLog::start(rank, protocol, (graph.src_level(), graph.dst_level()));

    if num_fine == 0 {
        phases.advance(Phase::InFlight);
    }

    let mut rgi = graph.iter(rank, &mut engine).with_config(runtime.config());

    while let Some(ready) = rgi.next() {
        let ready = ready?;
        average_down_step(&mut rgi, &ready, fine_data, coarse_data, fine_geom, (scomp, ncomp), &ratio, weighting)?;

        if ready.id().level == fine_level {
            staged += 1;

            if staged == num_fine {
                phases.advance(Phase::InFlight);
            }
        } else {
            merged += 1;

            if merged == num_coarse {
                phases.advance(Phase::Merged);
            }
        }
    }
    drop(rgi);

    phases.advance(Phase::Merged);
    phases.advance(Phase::Done);
    Ok(engine.into_stats())
}


/**
 * Handle one region yielded by the iterator of a restriction graph. A fine
 * region computes the buffers of its outbound edges and hands them to the
 * transfer engine; a coarse region merges the buffers of its inbound edges.
 *
 * This is one step of `average_down`, for callers which drive the iterator
 * themselves: post the receives with `TransferEngine::post_receives`, then
 * call this on every region the iterator yields. No validation or claiming
 * is done here.
 */
#[allow(clippy::too_many_arguments)]
pub fn average_down_step<C, const D: usize>(
    rgi: &mut RGIter<'_, '_, TransferEngine<'_, C>, D>,
    ready: &Ready<'_, D>,
    fine_data: &LevelData<D>,
    coarse_data: &mut LevelData<D>,
    fine_geom: &Geometry<D>,
    (scomp, ncomp): (usize, usize),
    ratio: &Ratio<D>,
    weighting: Weighting,
) -> Result<(), Error>
where
    C: Communicator,
{
    let rank = rgi.rank();
    rgi.progress_mut().count_region();

    if ready.id().level == fine_data.level() {
        let fine = fine_data.require(ready.id(), rank)?;
        let parallel = rgi.progress().runtime().config().parallel_staging;
        let buffers = stage_buffers(&ready.outgoing, parallel, |edge| {
            restrict_overlap(fine, fine_geom, &edge.target, ratio, scomp, ncomp, weighting)
        });

        for (&edge, buffer) in ready.outgoing.iter().zip(buffers) {
            if edge.is_local() {
                rgi.progress_mut().deliver_local(edge.id, buffer);
                rgi.complete(edge.id)?;
            } else {
                rgi.progress_mut().isend(edge, scomp, ncomp, buffer)?;
            }
        }
    } else {
        let coarse = coarse_data.require_mut(ready.id(), rank)?;
        let mut accumulator = CoarseAccumulator::new(coarse.valid_space().clone(), ncomp);

        for edge in &ready.incoming {
            let payload = rgi
                .progress_mut()
                .take(edge.id)
                .ok_or(TransferError::UnknownEdge { edge: edge.id, rank })?;
            accumulator.add(&edge.target, &payload);
        }
        accumulator.write_into(coarse, scomp);
    }
    Ok(())
}


/**
 * Compute the buffers of a region's outbound edges, on the Rayon pool if
 * requested. Buffers are returned in edge order either way.
 */
pub(crate) fn stage_buffers<const D: usize, F>(edges: &[&Edge<D>], parallel: bool, kernel: F) -> Vec<Vec<f64>>
where
    F: Fn(&Edge<D>) -> Vec<f64> + Sync + Send,
{
    if parallel && edges.len() > 1 {
        edges.par_iter().map(|edge| kernel(edge)).collect()
    } else {
        edges.iter().map(|edge| kernel(edge)).collect()
    }
}


/**
 * `average_down` with the push protocol: fine regions send their buffers as
 * soon as they are computed.
 */
#[allow(clippy::too_many_arguments)]
pub fn average_down_push<C, R, const D: usize>(
    runtime: &Runtime<C>,
    fine_data: &LevelData<D>,
    coarse_data: &mut LevelData<D>,
    graph: &RegionGraph<D>,
    fine_geom: &Geometry<D>,
    coarse_geom: &Geometry<D>,
    components: (usize, usize),
    ratio: R,
    weighting: Weighting,
) -> Result<TransferStats, Error>
where
    C: Communicator,
    R: Into<Ratio<D>>,
{
    average_down(runtime, fine_data, coarse_data, graph, fine_geom, coarse_geom, components, ratio, Protocol::Push, weighting)
}


/**
 * `average_down` with the pull protocol: coarse regions request each
 * buffer, and fine regions reply once they have computed it.
 */
#[allow(clippy::too_many_arguments)]
pub fn average_down_pull<C, R, const D: usize>(
    runtime: &Runtime<C>,
    fine_data: &LevelData<D>,
    coarse_data: &mut LevelData<D>,
    graph: &RegionGraph<D>,
    fine_geom: &Geometry<D>,
    coarse_geom: &Geometry<D>,
    components: (usize, usize),
    ratio: R,
    weighting: Weighting,
) -> Result<TransferStats, Error>
where
    C: Communicator,
    R: Into<Ratio<D>>,
{
    average_down(runtime, fine_data, coarse_data, graph, fine_geom, coarse_geom, components, ratio, Protocol::Pull, weighting)
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{average_down, average_down_pull, average_down_push, average_down_step, restrict_overlap, Weighting};
    use crate::config::RuntimeConfig;
    use crate::error::{ConfigurationError, Error, SequencingError, TransferError};
    use crate::geometry::{CoordSys, Geometry};
    use crate::graph::build_dependency_graph;
    use crate::index_space::{range2d, IndexSpace, Ratio};
    use crate::layout::BoxLayout;
    use crate::level::LevelData;
    use crate::message::{Communicator, LocalCommunicator};
    use crate::region::{Region, RegionId};
    use crate::runtime::{on_threads, Runtime};
    use crate::transfer::{Message, Protocol, TransferEngine};
    use std::time::Duration;

    fn geometries() -> (Geometry<2>, Geometry<2>) {
        let fine = Geometry::new(range2d(0..8, 0..8), [0.0, 0.0], [1.0, 1.0]);
        let coarse = Geometry::new(range2d(0..4, 0..4), [0.0, 0.0], [1.0, 1.0]);
        (fine, coarse)
    }

    fn single_rank() -> Runtime<LocalCommunicator> {
        Runtime::new(LocalCommunicator::group(1).remove(0))
    }

    fn coarse_values(data: &LevelData<2>, index: usize) -> Vec<f64> {
        data.get(index).map(|r| r.data().to_vec()).unwrap_or_default()
    }

    /// Two fine strips on ranks 0 and 1 over one coarse box on rank 0, with
    /// a smoothly varying two-component field.
    fn two_rank_restriction(runtime: &Runtime<LocalCommunicator>, protocol: Protocol, invocations: usize) -> Vec<f64> {
        let fine = BoxLayout::new(1, vec![(range2d(0..4, 0..8), 0), (range2d(4..8, 0..8), 1)]);
        let coarse = BoxLayout::new(0, vec![(range2d(0..4, 0..4), 0)]);
        let graph = build_dependency_graph(&fine, &coarse, 2).unwrap();
        let (fine_geom, coarse_geom) = geometries();
        let rank = runtime.rank();

        let fine_data = LevelData::from_slice_function(&fine, rank, 2, 0, |[i, j], f| {
            f[0] = (0.37 * i as f64).sin() + 1.3 * j as f64;
            f[1] = (i * j) as f64 / 7.0;
        });
        let mut coarse_data = LevelData::new(&coarse, rank, 2, 0);

        for _ in 0..invocations {
            average_down(runtime, &fine_data, &mut coarse_data, &graph, &fine_geom, &coarse_geom, (0, 2), 2, protocol, Weighting::Cell).unwrap();
        }
        coarse_values(&coarse_data, 0)
    }

    #[test]
    fn unit_field_restricts_to_unit_field_with_pull() {
        let fine = BoxLayout::new(1, vec![(IndexSpace::from_corners([0, 0], [7, 7]), 0)]);
        let coarse = BoxLayout::new(0, vec![(IndexSpace::from_corners([0, 0], [3, 3]), 0)]);
        let graph = build_dependency_graph(&fine, &coarse, 2).unwrap();
        let (fine_geom, coarse_geom) = geometries();
        let runtime = single_rank();

        let fine_data = LevelData::from_slice_function(&fine, 0, 1, 0, |_, f| f[0] = 1.0);
        let mut coarse_data = LevelData::new(&coarse, 0, 1, 0);
        let stats = average_down_pull(&runtime, &fine_data, &mut coarse_data, &graph, &fine_geom, &coarse_geom, (0, 1), 2, Weighting::Cell).unwrap();

        assert_eq!(coarse_values(&coarse_data, 0), vec![1.0; 16]);
        assert_eq!(stats.local_copies, 1);
        assert_eq!(stats.regions, 2);
    }

    #[test]
    fn strips_on_two_ranks_restrict_side_by_side() {
        for protocol in [Protocol::Push, Protocol::Pull] {
            let results = on_threads(2, |runtime| {
                let rank = runtime.rank();
                let fine = BoxLayout::new(1, vec![
                    (IndexSpace::from_corners([0, 0], [3, 7]), 0),
                    (IndexSpace::from_corners([4, 0], [7, 7]), 1),
                ]);
                let coarse = BoxLayout::new(0, vec![(IndexSpace::from_corners([0, 0], [3, 3]), 0)]);
                let graph = build_dependency_graph(&fine, &coarse, 2).unwrap();
                let (fine_geom, coarse_geom) = geometries();

                let fine_data = LevelData::from_slice_function(&fine, rank, 1, 0, |_, f| f[0] = if rank == 0 { 2.0 } else { 4.0 });
                let mut coarse_data = LevelData::new(&coarse, rank, 1, 0);
                average_down(&runtime, &fine_data, &mut coarse_data, &graph, &fine_geom, &coarse_geom, (0, 1), 2, protocol, Weighting::Cell).unwrap();
                coarse_data.get(0).map(|r| r.clone())
            });

            let coarse = results[0].as_ref().unwrap();
            assert!(results[1].is_none());

            for [i, j] in coarse.valid_space() {
                let expected = if i < 2 { 2.0 } else { 4.0 };
                assert_eq!(coarse.get_slice([i, j])[0], expected, "{} at ({}, {})", protocol, i, j);
            }
        }
    }

    #[test]
    fn push_and_pull_are_bit_identical() {
        let push = on_threads(2, |runtime| two_rank_restriction(&runtime, Protocol::Push, 1));
        let pull = on_threads(2, |runtime| two_rank_restriction(&runtime, Protocol::Pull, 1));
        assert_eq!(push[0].len(), 32);
        assert!(push[0].iter().zip(&pull[0]).all(|(a, b)| a.to_bits() == b.to_bits()));
    }

    #[test]
    fn repeated_invocations_are_idempotent() {
        let once = on_threads(2, |runtime| two_rank_restriction(&runtime, Protocol::Pull, 1));
        let thrice = on_threads(2, |runtime| two_rank_restriction(&runtime, Protocol::Push, 3));
        assert!(once[0].iter().zip(&thrice[0]).all(|(a, b)| a.to_bits() == b.to_bits()));
    }

    #[test]
    fn constant_field_is_preserved_in_one_dimension() {
        let fine = BoxLayout::new(1, vec![(IndexSpace::new([0..8]), 0), (IndexSpace::new([8..16]), 0)]);
        let coarse = BoxLayout::new(0, vec![(IndexSpace::new([0..3]), 0), (IndexSpace::new([3..4]), 0)]);
        let graph = build_dependency_graph(&fine, &coarse, 4).unwrap();
        let fine_geom = Geometry::new(IndexSpace::new([0..16]), [0.0], [2.0]);
        let coarse_geom = Geometry::new(IndexSpace::new([0..4]), [0.0], [2.0]);
        let runtime = single_rank();

        let fine_data = LevelData::from_slice_function(&fine, 0, 1, 1, |_, f| f[0] = 3.25);
        let mut coarse_data = LevelData::new(&coarse, 0, 1, 1);
        average_down_push(&runtime, &fine_data, &mut coarse_data, &graph, &fine_geom, &coarse_geom, (0, 1), 4, Weighting::Cell).unwrap();

        for region in coarse_data.iter() {
            for index in region.valid_space() {
                assert_eq!(region.get_slice(index), &[3.25]);
            }
        }
    }

    #[test]
    fn constant_field_is_preserved_in_three_dimensions_with_anisotropic_ratio() {
        let fine = BoxLayout::new(1, vec![
            (IndexSpace::new([0..4, 0..2, 0..6]), 0),
            (IndexSpace::new([4..8, 0..2, 0..6]), 0),
        ]);
        let coarse = BoxLayout::new(0, vec![(IndexSpace::new([0..4, 0..2, 0..2]), 0)]);
        let graph = build_dependency_graph(&fine, &coarse, [2, 1, 3]).unwrap();
        let fine_geom = Geometry::new(IndexSpace::new([0..8, 0..2, 0..6]), [0.0; 3], [1.0, 0.5, 3.0]);
        let coarse_geom = Geometry::new(IndexSpace::new([0..4, 0..2, 0..2]), [0.0; 3], [1.0, 0.5, 3.0]);
        let runtime = single_rank();

        for weighting in [Weighting::Cell, Weighting::Volume] {
            let fine_data = LevelData::from_slice_function(&fine, 0, 3, 0, |_, f| f.copy_from_slice(&[-1.5, 0.1, 7.0]));
            let mut coarse_data = LevelData::new(&coarse, 0, 3, 0);
            average_down_pull(&runtime, &fine_data, &mut coarse_data, &graph, &fine_geom, &coarse_geom, (0, 3), [2, 1, 3], weighting).unwrap();

            let region = coarse_data.get(0).unwrap();
            for index in region.valid_space() {
                for (x, y) in region.get_slice(index).iter().zip([-1.5, 0.1, 7.0]) {
                    assert!((x - y).abs() < 1e-12, "{:?}: {} != {}", weighting, x, y);
                }
            }
        }
    }

    #[test]
    fn uncovered_zones_and_other_components_are_untouched() {
        let fine = BoxLayout::new(1, vec![(range2d(0..4, 0..8), 0)]);
        let coarse = BoxLayout::new(0, vec![(range2d(0..4, 0..4), 0), (range2d(0..4, 4..8), 0)]);
        let graph = build_dependency_graph(&fine, &coarse, 2).unwrap();
        let fine_geom = Geometry::new(range2d(0..8, 0..16), [0.0, 0.0], [1.0, 2.0]);
        let coarse_geom = Geometry::new(range2d(0..4, 0..8), [0.0, 0.0], [1.0, 2.0]);
        let runtime = single_rank();

        let fine_data = LevelData::from_slice_function(&fine, 0, 3, 0, |_, f| f.copy_from_slice(&[5.0, 6.0, 7.0]));
        let mut coarse_data = LevelData::from_slice_function(&coarse, 0, 3, 0, |_, f| f.copy_from_slice(&[-1.0, -1.0, -1.0]));
        average_down(&runtime, &fine_data, &mut coarse_data, &graph, &fine_geom, &coarse_geom, (1, 1), 2, Protocol::Push, Weighting::Cell).unwrap();

        let first = coarse_data.get(0).unwrap();
        assert_eq!(first.get_slice([0, 0]), &[-1.0, 6.0, -1.0]);
        assert_eq!(first.get_slice([1, 3]), &[-1.0, 6.0, -1.0]);
        assert_eq!(first.get_slice([2, 0]), &[-1.0, -1.0, -1.0]);
        assert!(coarse_data.get(1).unwrap().data().iter().all(|&x| x == -1.0));
    }

    #[test]
    fn volume_weighting_uses_cylindrical_shells() {
        let fine = Region::from_slice_function(RegionId::new(1, 0), 0, IndexSpace::new([0..2]), 0, 1, |[i], f| {
            f[0] = if i == 0 { 1.0 } else { 3.0 }
        });
        let geometry = Geometry::new(IndexSpace::new([0..2]), [0.0], [1.0]).with_coord(CoordSys::Cylindrical);
        let target = IndexSpace::new([0..1]);

        let cell = restrict_overlap(&fine, &geometry, &target, &Ratio::new([2]), 0, 1, Weighting::Cell);
        let volume = restrict_overlap(&fine, &geometry, &target, &Ratio::new([2]), 0, 1, Weighting::Volume);
        assert_eq!(cell, vec![2.0]);
        assert!((volume[0] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn claimed_regions_reject_a_second_invocation() {
        let fine = BoxLayout::new(1, vec![(range2d(0..8, 0..8), 0)]);
        let coarse = BoxLayout::new(0, vec![(range2d(0..4, 0..4), 0)]);
        let graph = build_dependency_graph(&fine, &coarse, 2).unwrap();
        let (fine_geom, coarse_geom) = geometries();
        let runtime = single_rank();

        let fine_data = LevelData::new(&fine, 0, 1, 0);
        let mut coarse_data = LevelData::new(&coarse, 0, 1, 0);
        let _held = runtime.claim(vec![RegionId::new(0, 0)], "fill_boundary").unwrap();

        assert!(matches!(
            average_down_push(&runtime, &fine_data, &mut coarse_data, &graph, &fine_geom, &coarse_geom, (0, 1), 2, Weighting::Cell),
            Err(Error::Sequencing(SequencingError::InFlight { operation: "average_down", .. }))
        ));
    }

    #[test]
    fn inconsistent_arguments_are_configuration_errors() {
        let fine = BoxLayout::new(1, vec![(range2d(0..8, 0..8), 0)]);
        let coarse = BoxLayout::new(0, vec![(range2d(0..4, 0..4), 0)]);
        let graph = build_dependency_graph(&fine, &coarse, 2).unwrap();
        let (fine_geom, coarse_geom) = geometries();
        let runtime = single_rank();
        let fine_data = LevelData::new(&fine, 0, 2, 0);
        let mut coarse_data = LevelData::new(&coarse, 0, 1, 0);

        let mut run = |components: (usize, usize), ratio: [i64; 2], coarse_geom: &Geometry<2>| {
            average_down_push(&runtime, &fine_data, &mut coarse_data, &graph, &fine_geom, coarse_geom, components, ratio, Weighting::Cell)
        };
        assert!(matches!(
            run((1, 1), [2, 2], &coarse_geom),
            Err(Error::Configuration(ConfigurationError::ComponentRange { level: 0, .. }))
        ));
        assert!(matches!(
            run((0, 1), [2, 4], &coarse_geom),
            Err(Error::Configuration(ConfigurationError::RatioMismatch { .. }))
        ));
        let wrong = Geometry::new(range2d(0..4, 0..5), [0.0, 0.0], [1.0, 1.0]);
        assert!(matches!(
            run((0, 1), [2, 2], &wrong),
            Err(Error::Configuration(ConfigurationError::GeometryMismatch { .. }))
        ));
    }

    #[test]
    fn missing_peer_stalls_the_invocation() {
        let mut comms = LocalCommunicator::group(2);
        let _peer = comms.pop();
        let config = RuntimeConfig::default().with_stall_timeout(Duration::from_millis(50));
        let runtime = Runtime::with_config(comms.remove(0), config);

        let fine = BoxLayout::new(1, vec![(range2d(0..8, 0..8), 1)]);
        let coarse = BoxLayout::new(0, vec![(range2d(0..4, 0..4), 0)]);
        let graph = build_dependency_graph(&fine, &coarse, 2).unwrap();
        let (fine_geom, coarse_geom) = geometries();
        let fine_data = LevelData::new(&fine, 0, 1, 0);
        let mut coarse_data = LevelData::new(&coarse, 0, 1, 0);

        let result = average_down_pull(&runtime, &fine_data, &mut coarse_data, &graph, &fine_geom, &coarse_geom, (0, 1), 2, Weighting::Cell);
        assert!(matches!(
            result,
            Err(Error::Transfer(TransferError::Stalled { protocol: Protocol::Pull, .. }))
        ));
        assert!(runtime.claim(vec![RegionId::new(0, 0)], "after").is_ok());
    }

    #[test]
    fn short_payload_fails_the_invocation() {
        let mut comms = LocalCommunicator::group(2);
        let peer = comms.pop().unwrap();
        let runtime = Runtime::new(comms.remove(0));

        let fine = BoxLayout::new(1, vec![(range2d(0..8, 0..8), 1)]);
        let coarse = BoxLayout::new(0, vec![(range2d(0..4, 0..4), 0)]);
        let graph = build_dependency_graph(&fine, &coarse, 2).unwrap();
        let (fine_geom, coarse_geom) = geometries();
        let fine_data = LevelData::new(&fine, 0, 1, 0);
        let mut coarse_data = LevelData::from_slice_function(&coarse, 0, 1, 0, |_, f| f[0] = -1.0);

        let short = Message::Data {
            key: graph.edges()[0].key(0, 1),
            seq: 0,
            protocol: Protocol::Push,
            payload: vec![9.0; 3],
        };
        peer.send(0, short.encode().unwrap()).unwrap();

        let result = average_down_push(&runtime, &fine_data, &mut coarse_data, &graph, &fine_geom, &coarse_geom, (0, 1), 2, Weighting::Cell);
        assert!(matches!(
            result,
            Err(Error::Transfer(TransferError::PayloadSize { expected: 16, received: 3, protocol: Protocol::Push, .. }))
        ));
        assert!(coarse_values(&coarse_data, 0).iter().all(|&x| x == -1.0));
    }

    #[test]
    fn caller_driven_steps_match_the_whole_operator() {
        let results = on_threads(2, |runtime| {
            let rank = runtime.rank();
            let fine = BoxLayout::new(1, vec![(range2d(0..4, 0..8), 0), (range2d(4..8, 0..8), 1)]);
            let coarse = BoxLayout::new(0, vec![(range2d(0..4, 0..4), 0)]);
            let graph = build_dependency_graph(&fine, &coarse, 2).unwrap();
            let (fine_geom, coarse_geom) = geometries();
            let ratio = Ratio::new([2, 2]);

            let fine_data = LevelData::from_slice_function(&fine, rank, 1, 0, |[i, j], f| f[0] = (i + 2 * j) as f64);
            let mut stepped = LevelData::new(&coarse, rank, 1, 0);
            let mut whole = LevelData::new(&coarse, rank, 1, 0);

            let mut engine = TransferEngine::new(&runtime, Protocol::Pull);
            engine.post_receives(&graph, 0, 1).unwrap();
            let mut rgi = graph.iter(rank, &mut engine);
            let mut steps = 0;

            while let Some(ready) = rgi.next() {
                let ready = ready.unwrap();
                average_down_step(&mut rgi, &ready, &fine_data, &mut stepped, &fine_geom, (0, 1), &ratio, Weighting::Cell).unwrap();
                steps += 1;
            }
            drop(rgi);
            assert_eq!(engine.stats().regions, steps);

            average_down_pull(&runtime, &fine_data, &mut whole, &graph, &fine_geom, &coarse_geom, (0, 1), ratio, Weighting::Cell).unwrap();
            (coarse_values(&stepped, 0), coarse_values(&whole, 0), stepped.get(0).map(|r| r.get_slice([1, 2])[0]))
        });

        let (stepped, whole, sample) = &results[0];
        assert_eq!(stepped.len(), 16);
        assert!(stepped.iter().zip(whole).all(|(a, b)| a.to_bits() == b.to_bits()));
        assert_eq!(*sample, Some(11.5));
        assert!(results[1].0.is_empty());
    }
}
