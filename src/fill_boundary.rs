use log::debug;

use crate::average_down::stage_buffers;
use crate::error::{ConfigurationError, Error, TransferError};
use crate::graph::RegionGraph;
use crate::level::LevelData;
use crate::message::{Communicator, Rank};
use crate::runtime::Runtime;
use crate::transfer::{Protocol, TransferEngine, TransferStats};




fn check_neighbors<const D: usize>(
    data: &LevelData<D>,
    graph: &RegionGraph<D>,
    rank: Rank,
    scomp: usize,
    ncomp: usize,
) -> Result<(), ConfigurationError> {
    let level = data.level();

    if graph.src_level() != level || graph.dst_level() != level || graph.ratio().is_some() {
        return Err(ConfigurationError::GraphMismatch {
            graph_src: graph.src_level(),
            graph_dst: graph.dst_level(),
            src: level,
            dst: level,
        });
    }
    data.check_components(scomp, ncomp)?;

    for edge in graph.edges().iter().filter(|e| e.dst_owner == rank) {
        let region = data.require(edge.dst, rank)?;

        if !region.index_space().contains_space(&edge.target) {
            return Err(ConfigurationError::GhostOverflow {
                region: edge.dst,
                target: edge.target.to_string(),
            });
        }
    }
    Ok(())
}




/**
 * Fill the ghost zones of every local region on a level, for the components
 * `scomp..scomp + ncomp`, with the valid data of its neighbors and of the
 * periodic images of the domain, over a graph from `build_neighbor_graph`.
 * Ghost zones outside the domain on non-periodic axes are left alone.
 *
 * Halo edges run both ways between neighbors, so no region can wait for its
 * inbound edges before issuing its outbound ones. Every outbound buffer is
 * therefore extracted and issued before the traversal starts; this is safe
 * because buffers read only valid zones and merges write only ghost zones.
 */
pub fn fill_boundary<C, const D: usize>(
    runtime: &Runtime<C>,
    data: &mut LevelData<D>,
    graph: &RegionGraph<D>,
    (scomp, ncomp): (usize, usize),
    protocol: Protocol,
) -> Result<TransferStats, Error>
where
    C: Communicator,
{
    let rank = runtime.rank();
    check_neighbors(data, graph, rank, scomp, ncomp)?;

    let _claim = runtime.claim(data.ids(), "fill_boundary")?;
    let mut engine = TransferEngine::new(runtime, protocol);
    engine.post_receives(graph, scomp, ncomp)?;

    let parallel = runtime.config().parallel_staging;
    let mut rgi = graph.iter(rank, &mut engine).with_config(runtime.config());

    for node in graph.local_nodes(rank) {
        let region = data.require(node.id, rank)?;
        let outgoing: Vec<_> = graph.outgoing(node.id).collect();
        let buffers = stage_buffers(&outgoing, parallel, |edge| region.extract(&edge.source, scomp, ncomp));

        for (&edge, buffer) in outgoing.iter().zip(buffers) {
            if edge.is_local() {
                rgi.progress_mut().deliver_local(edge.id, buffer);
                rgi.complete(edge.id)?;
            } else {
                rgi.progress_mut().isend(edge, scomp, ncomp, buffer)?;
            }
        }
    }
    debug!("fill_boundary {} on level {} rank {}: issued", protocol, graph.src_level(), rank);

    while let Some(ready) = rgi.next() {
        let ready = ready?;
        rgi.progress_mut().count_region();
        let region = data.require_mut(ready.id(), rank)?;

        for edge in &ready.incoming {
            let payload = rgi
                .progress_mut()
                .take(edge.id)
                .ok_or(TransferError::UnknownEdge { edge: edge.id, rank })?;
            region.write(&edge.target, scomp, ncomp, &payload);
        }
    }
    drop(rgi);

    debug!("fill_boundary {} on level {} rank {}: done", protocol, graph.src_level(), rank);
    Ok(engine.into_stats())
}
