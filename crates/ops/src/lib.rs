//! Operation kernels and the tile compute engine.
//!
//! An [`OperationGraph`] is the mutable edit stack of one image. Every
//! rendering request works against an immutable [`GraphSnapshot`] taken at
//! the request's epoch, and [`TileComputeEngine::compute`] is a pure function
//! of that snapshot and a tile coordinate.

mod engine;
mod graph;
mod kernels;
mod kind;
mod mask_cache;
mod region;
mod source;

pub use engine::TileComputeEngine;
pub use graph::{
    GraphError, GraphSnapshot, NodeId, OperationGraph, OperationNode, StoredOperation,
};
pub use kernels::PreparedOperation;
pub use kind::{
    ColorBalanceParams, NoiseReductionParams, OperationKind, ToneMapperParams, VibranceParams,
    ZoneMapperParams, ZoneScale,
};
pub use mask_cache::{DEFAULT_MASK_CACHE_ENTRIES, MaskCache};
pub use source::{MemoryRaster, RasterSource};
