//! Gridflow is a distributed, asynchronous runtime for moving data between
//! the patches of a block-structured adaptive mesh. Each rank owns a subset
//! of the rectangular regions on each refinement level. Data moves along the
//! edges of a region graph: between neighbors on one level (halo exchange),
//! or from a fine level onto the coarse level beneath it (restriction). A
//! graph iterator yields each local region as soon as its inbound edges
//! have completed, so communication overlaps computation and there is no
//! global barrier.
//!
//! Transfers use either a push protocol, where producers send as soon as
//! their buffers are computed, or a pull protocol, where consumers request
//! buffers and producers reply. Both give bit-identical results.
//!
//! ```no_run
//! use gridflow::{average_down_pull, build_dependency_graph, BoxLayout, Geometry, LevelData, Runtime, Weighting};
//! use gridflow::index_space::range2d;
//! use gridflow::message::LocalCommunicator;
//!
//! let runtime = Runtime::new(LocalCommunicator::group(1).remove(0));
//! let fine = BoxLayout::new(1, vec![(range2d(0..8, 0..8), 0)]);
//! let coarse = BoxLayout::new(0, vec![(range2d(0..4, 0..4), 0)]);
//! let graph = build_dependency_graph(&fine, &coarse, 2)?;
//!
//! let fine_geom = Geometry::new(range2d(0..8, 0..8), [0.0, 0.0], [1.0, 1.0]);
//! let coarse_geom = Geometry::new(range2d(0..4, 0..4), [0.0, 0.0], [1.0, 1.0]);
//! let fine_data = LevelData::from_slice_function(&fine, 0, 1, 0, |_, f| f[0] = 1.0);
//! let mut coarse_data = LevelData::new(&coarse, 0, 1, 0);
//!
//! average_down_pull(&runtime, &fine_data, &mut coarse_data, &graph, &fine_geom, &coarse_geom, (0, 1), 2, Weighting::Cell)?;
//! # Ok::<(), gridflow::Error>(())
//! ```

pub mod adjacency_list;
pub mod average_down;
pub mod config;
pub mod error;
pub mod fill_boundary;
pub mod geometry;
pub mod graph;
pub mod index_space;
pub mod layout;
pub mod level;
pub mod message;
pub mod overlap;
pub mod region;
pub mod rg_iter;
pub mod runtime;
pub mod transfer;

pub use average_down::{average_down, average_down_pull, average_down_push, average_down_step, Phase, Weighting};
pub use config::RuntimeConfig;
pub use error::{ConfigurationError, Error, SequencingError, TransferError};
pub use fill_boundary::fill_boundary;
pub use geometry::{CoordSys, Geometry};
pub use graph::{build_dependency_graph, build_neighbor_graph, Edge, EdgeId, EdgeKind, RegionGraph};
pub use index_space::{IndexSpace, Ratio};
pub use layout::BoxLayout;
pub use level::LevelData;
pub use region::{Region, RegionId};
pub use rg_iter::{Progress, RGIter, Ready, Status};
pub use runtime::Runtime;
pub use transfer::{Protocol, TransferEngine, TransferKey, TransferStats};
