//! stratify-pipeline: flat-color layer decomposition (sans-IO).
//!
//! Decomposes a raster image into a small stack of flat color layers
//! through: color space conversion -> superpixel segmentation ->
//! seeded clustering -> iterative adjacency merging -> layer
//! extraction.
//!
//! Pipelines are declarative and lazily composed: builder calls only
//! record validated stage descriptors, and nothing runs until one of
//! the `execute` entry points is called. Results are immutable and
//! `Arc`-share their intermediates, so several pipelines that agree on
//! an expensive prefix can branch from one computed result and re-run
//! only their divergent suffixes — concurrently, with no locks.
//!
//! This crate has **no I/O dependencies** — it operates on in-memory
//! buffers and returns structured data. Decoding bytes and writing
//! layer files live in the `stratify` CLI crate.

pub mod cluster;
pub mod color;
pub mod diagnostics;
pub mod extract;
pub mod merge;
pub mod metadata;
pub mod pipeline;
pub mod segment;
pub mod types;

pub use cluster::ClusterAssignment;
pub use extract::{EdgeMode, ExtractMode, Layer, LayerStats, layer_stats};
pub use metadata::{Metadata, MetadataValue, keys};
pub use pipeline::{Artifact, ColorTarget, Pipeline, PipelineResult, PipelineStage, artifacts};
pub use segment::SuperpixelMap;
pub use types::{ColorSpace, FinalKind, LabScale, PipelineError, PixelBuffer, RgbaImage};
