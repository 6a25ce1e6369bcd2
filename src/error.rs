//! Error types for graph construction, transfers, and invocation sequencing.
//!
//! Every failure in this crate is fatal to the operation that raised it:
//! there is no degraded or partially merged result. Messages name the level
//! pair, the boxes involved, and the protocol in flight where one is known.

use std::time::Duration;
use thiserror::Error;

use crate::region::RegionId;
use crate::transfer::{Protocol, TransferKey};

/// Unified error type returned by the public operations of this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("sequencing error: {0}")]
    Sequencing(#[from] SequencingError),
}

/// The box layouts, ratio, geometry, or data containers handed to a graph
/// builder or operator do not describe a consistent configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("refinement ratio {ratio} between levels {fine_level} -> {coarse_level} must be at least one on every axis")]
    InvalidRatio {
        fine_level: u32,
        coarse_level: u32,
        ratio: String,
    },

    #[error("fine box {index} {space} on level {fine_level} is not aligned to ratio {ratio} (levels {fine_level} -> {coarse_level})")]
    Misaligned {
        fine_level: u32,
        coarse_level: u32,
        index: usize,
        space: String,
        ratio: String,
    },

    #[error("fine box {index} on level {fine_level} has {missing} coarsened cells with no overlapping box on level {coarse_level}")]
    MissingOverlap {
        fine_level: u32,
        coarse_level: u32,
        index: usize,
        missing: usize,
    },

    #[error("boxes {a} and {b} on level {level} overlap each other")]
    OverlappingBoxes { level: u32, a: usize, b: usize },

    #[error("layouts disagree on box {index} of level {level}")]
    InconsistentLayouts { level: u32, index: usize },

    #[error("restriction needs two distinct levels, got level {level} for both layouts")]
    LevelsNotDistinct { level: u32 },

    #[error("neighbor layouts are on different levels {a} and {b}")]
    LevelMismatch { a: u32, b: u32 },

    #[error("fine domain {fine} on level {fine_level} is not coarse domain {coarse} on level {coarse_level} refined by {ratio}")]
    GeometryMismatch {
        fine_level: u32,
        coarse_level: u32,
        fine: String,
        coarse: String,
        ratio: String,
    },

    #[error("graph connects levels {graph_src} -> {graph_dst} but the operator was given levels {src} -> {dst}")]
    GraphMismatch {
        graph_src: u32,
        graph_dst: u32,
        src: u32,
        dst: u32,
    },

    #[error("graph restricts levels {fine_level} -> {coarse_level} by {graph} but the operator was given ratio {given}")]
    RatioMismatch {
        fine_level: u32,
        coarse_level: u32,
        graph: String,
        given: String,
    },

    #[error("region {region} has too few ghost zones to receive {target}")]
    GhostOverflow { region: RegionId, target: String },

    #[error("component range {scomp}..{end} exceeds the {num_fields} fields of level {level}", end = .scomp + .ncomp)]
    ComponentRange {
        level: u32,
        scomp: usize,
        ncomp: usize,
        num_fields: usize,
    },

    #[error("region {region} is owned by rank {rank} in the graph but missing from its level data")]
    MissingRegion { region: RegionId, rank: usize },
}

/// A non-blocking transfer failed at the transport level. These are never
/// retried by the runtime.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("i/o failure talking to rank {peer}: {source}")]
    Io {
        peer: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("channel to rank {peer} is disconnected")]
    Disconnected { peer: usize },

    #[error("failed to encode message for {key}: {reason}")]
    Encode { key: TransferKey, reason: String },

    #[error("failed to decode inbound message: {0}")]
    Decode(String),

    #[error("{protocol} message #{received} for {key} arrived after #{expected} was already consumed")]
    Stale {
        key: TransferKey,
        protocol: Protocol,
        expected: u64,
        received: u64,
    },

    #[error("{protocol} transfer {key} carried {received} values where {expected} were expected")]
    PayloadSize {
        key: TransferKey,
        protocol: Protocol,
        expected: usize,
        received: usize,
    },

    #[error("{protocol} transfer {key} is not expected on this rank")]
    Unexpected { key: TransferKey, protocol: Protocol },

    #[error("edge {edge} completed twice or does not end on rank {rank}")]
    UnknownEdge { edge: usize, rank: usize },

    #[error("{protocol} transfers stalled for {elapsed:?} with regions still waiting: {waiting}")]
    Stalled {
        protocol: Protocol,
        elapsed: Duration,
        waiting: String,
    },
}

/// A level-transfer operator was invoked on regions which are still claimed
/// by an invocation in flight.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequencingError {
    #[error("{operation} on region {region} while a previous invocation on it is still in flight")]
    InFlight {
        region: RegionId,
        operation: &'static str,
    },
}
