//! Pipeline construction and execution.
//!
//! A [`Pipeline`] is an immutable, ordered sequence of tagged stage
//! descriptors. Builder calls validate their parameters eagerly and
//! return a new pipeline value; nothing shared is ever mutated, so two
//! branches built from a common prefix cannot interfere.
//!
//! ```rust
//! # use stratify_pipeline::{ColorTarget, Pipeline, PipelineError};
//! # fn run(image: image::RgbaImage) -> Result<(), PipelineError> {
//! let result = Pipeline::new()
//!     .convert_color_space(ColorTarget::Lab)?
//!     .segment(100)?
//!     .cluster(5)?
//!     .auto_merge(0.2)?
//!     .extract_layers()?
//!     .execute(&image)?;
//!
//! let layers = result.layers().unwrap_or_default();
//! # Ok(())
//! # }
//! ```
//!
//! # Branch reuse
//!
//! [`Pipeline::execute_from`] resumes from a previously computed
//! result: the engine finds the longest stage-by-stage structural
//! match between this pipeline and the prior result's provenance and
//! re-runs only the diverging suffix. Results are read-only once
//! returned and artifacts are `Arc`-shared, so any number of branches
//! can resume from one prior result concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterAssignment, DEFAULT_SEED, cluster};
use crate::color::to_lab;
use crate::diagnostics::{PipelineDiagnostics, StageDiagnostics, StageMetrics};
use crate::extract::{EdgeMode, ExtractMode, Layer, extract_layers};
use crate::merge::auto_merge;
use crate::metadata::{FromMetadata, Metadata, keys};
use crate::segment::{DEFAULT_COMPACTNESS, SuperpixelMap, segment};
use crate::types::{FinalKind, LabScale, PipelineError, PixelBuffer, RgbaImage};

/// Names of the intermediates a result can hold.
pub mod artifacts {
    /// The registered source buffer.
    pub const INPUT: &str = "input";
    /// The color-converted buffer.
    pub const LAB: &str = "lab";
    /// The superpixel map.
    pub const SUPERPIXELS: &str = "superpixels";
    /// The cluster assignment (post-merge once merges ran).
    pub const CLUSTERS: &str = "clusters";
    /// The extracted layer stack.
    pub const LAYERS: &str = "layers";
}

/// Target of a color space conversion stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorTarget {
    /// CIE L\*a\*b\*.
    #[default]
    Lab,
}

/// An immutable, value-comparable description of one transformation.
///
/// Branch compatibility is decided by comparing sequences of these
/// descriptors structurally, never by identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineStage {
    /// Convert the source buffer into a perceptual color space.
    ConvertColorSpace {
        /// Destination color space.
        target: ColorTarget,
        /// Per-axis scale applied after conversion.
        scale: LabScale,
    },
    /// Partition the working buffer into superpixels.
    Segment {
        /// Target superpixel count.
        superpixels: u32,
        /// Compactness weight.
        compactness: f32,
    },
    /// Group superpixels into color clusters.
    Cluster {
        /// Requested cluster count.
        clusters: u32,
        /// Seed for the centroid initialization.
        seed: u64,
    },
    /// Merge adjacent clusters closer than a threshold.
    AutoMerge {
        /// Similarity threshold in `[0, 1]`.
        threshold: f64,
    },
    /// Rasterize each cluster into an alpha-masked layer.
    ExtractLayers {
        /// How layer pixels are colored.
        mode: ExtractMode,
        /// How mask boundaries are treated.
        edges: EdgeMode,
    },
}

impl PipelineStage {
    /// Stage name as it appears on the builder surface.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConvertColorSpace { .. } => "convertColorSpace",
            Self::Segment { .. } => "segment",
            Self::Cluster { .. } => "cluster",
            Self::AutoMerge { .. } => "autoMerge",
            Self::ExtractLayers { .. } => "extractLayers",
        }
    }

    /// Name of the artifact this stage produces.
    const fn artifact(&self) -> &'static str {
        match self {
            Self::ConvertColorSpace { .. } => artifacts::LAB,
            Self::Segment { .. } => artifacts::SUPERPIXELS,
            Self::Cluster { .. } | Self::AutoMerge { .. } => artifacts::CLUSTERS,
            Self::ExtractLayers { .. } => artifacts::LAYERS,
        }
    }

    const fn final_kind(&self) -> FinalKind {
        match self {
            Self::ConvertColorSpace { .. } => FinalKind::Converted,
            Self::Segment { .. } => FinalKind::Superpixels,
            Self::Cluster { .. } | Self::AutoMerge { .. } => FinalKind::Clusters,
            Self::ExtractLayers { .. } => FinalKind::Layers,
        }
    }
}

/// A typed intermediate held by a [`PipelineResult`].
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    /// A pixel buffer (source or color-converted).
    Buffer(PixelBuffer),
    /// A superpixel map.
    Superpixels(SuperpixelMap),
    /// A cluster assignment.
    Clusters(ClusterAssignment),
    /// An ordered layer stack.
    Layers(Vec<Layer>),
}

/// An immutable, composable description of a stage sequence.
///
/// A pipeline with zero stages is valid; executing it is an identity
/// pass that registers the input and reports only its dimensions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
    input: Option<PixelBuffer>,
}

impl Pipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stages: Vec::new(),
            input: None,
        }
    }

    /// Create an empty pipeline pre-seeded with a source buffer for
    /// [`execute_seeded`](Self::execute_seeded).
    #[must_use]
    pub const fn with_input(input: PixelBuffer) -> Self {
        Self {
            stages: Vec::new(),
            input: Some(input),
        }
    }

    /// The stage sequence.
    #[must_use]
    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    fn append(mut self, stage: PipelineStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Append a color space conversion with identity scale.
    ///
    /// # Errors
    ///
    /// Never fails for the identity scale; the `Result` keeps the
    /// builder surface uniform.
    pub fn convert_color_space(self, target: ColorTarget) -> Result<Self, PipelineError> {
        self.convert_color_space_scaled(target, LabScale::IDENTITY)
    }

    /// Append a color space conversion with a per-axis scale.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidStage`] if any scale factor is
    /// non-positive or non-finite.
    pub fn convert_color_space_scaled(
        self,
        target: ColorTarget,
        scale: LabScale,
    ) -> Result<Self, PipelineError> {
        if !scale.is_valid() {
            return Err(PipelineError::InvalidStage {
                stage: "convertColorSpace",
                reason: "scale factors must be finite and positive".to_string(),
            });
        }
        Ok(self.append(PipelineStage::ConvertColorSpace { target, scale }))
    }

    /// Append a segmentation stage with the default compactness.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidStage`] if `superpixels` is zero.
    pub fn segment(self, superpixels: u32) -> Result<Self, PipelineError> {
        self.segment_with(superpixels, DEFAULT_COMPACTNESS)
    }

    /// Append a segmentation stage with an explicit compactness weight.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidStage`] if `superpixels` is zero
    /// or `compactness` is non-positive or non-finite.
    pub fn segment_with(self, superpixels: u32, compactness: f32) -> Result<Self, PipelineError> {
        if superpixels == 0 {
            return Err(PipelineError::InvalidStage {
                stage: "segment",
                reason: "superpixel count must be positive".to_string(),
            });
        }
        if !compactness.is_finite() || compactness <= 0.0 {
            return Err(PipelineError::InvalidStage {
                stage: "segment",
                reason: format!("compactness must be finite and positive, got {compactness}"),
            });
        }
        Ok(self.append(PipelineStage::Segment {
            superpixels,
            compactness,
        }))
    }

    /// Append a clustering stage with the default seed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidStage`] if `clusters` is zero.
    pub fn cluster(self, clusters: u32) -> Result<Self, PipelineError> {
        self.cluster_seeded(clusters, DEFAULT_SEED)
    }

    /// Append a clustering stage with an explicit seed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidStage`] if `clusters` is zero.
    pub fn cluster_seeded(self, clusters: u32, seed: u64) -> Result<Self, PipelineError> {
        if clusters == 0 {
            return Err(PipelineError::InvalidStage {
                stage: "cluster",
                reason: "cluster count must be positive".to_string(),
            });
        }
        Ok(self.append(PipelineStage::Cluster { clusters, seed }))
    }

    /// Append a merge stage. May be called multiple times; each
    /// application works on the result of the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidStage`] if `threshold` is
    /// outside `[0, 1]` or non-finite.
    pub fn auto_merge(self, threshold: f64) -> Result<Self, PipelineError> {
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::InvalidStage {
                stage: "autoMerge",
                reason: format!("merge threshold must lie in [0, 1], got {threshold}"),
            });
        }
        Ok(self.append(PipelineStage::AutoMerge { threshold }))
    }

    /// Append the terminal extraction stage with default mode and
    /// hard edges.
    ///
    /// # Errors
    ///
    /// Never fails for the defaults; the `Result` keeps the builder
    /// surface uniform.
    pub fn extract_layers(self) -> Result<Self, PipelineError> {
        self.extract_layers_with(ExtractMode::default(), EdgeMode::default())
    }

    /// Append the terminal extraction stage with explicit mode and
    /// edge treatment.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps the builder surface
    /// uniform.
    pub fn extract_layers_with(
        self,
        mode: ExtractMode,
        edges: EdgeMode,
    ) -> Result<Self, PipelineError> {
        Ok(self.append(PipelineStage::ExtractLayers { mode, edges }))
    }

    // ───────────────────────── execution ─────────────────────────

    /// Run the full stage sequence from a fresh source image.
    ///
    /// # Errors
    ///
    /// Returns the first stage error encountered; no partial result is
    /// produced.
    pub fn execute(&self, image: &RgbaImage) -> Result<PipelineResult, PipelineError> {
        self.execute_buffer(PixelBuffer::from_rgba(image))
    }

    /// Run the full stage sequence from an already-built buffer.
    ///
    /// # Errors
    ///
    /// Returns the first stage error encountered.
    pub fn execute_buffer(&self, input: PixelBuffer) -> Result<PipelineResult, PipelineError> {
        let started = Instant::now();
        let mut state = ExecutionState::fresh(input);
        for stage in &self.stages {
            state.apply(stage)?;
        }
        Ok(state.finish(self, started))
    }

    /// Run the full stage sequence from the pre-seeded input buffer.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingInput`] if the pipeline was
    /// built without one, or the first stage error encountered.
    pub fn execute_seeded(&self) -> Result<PipelineResult, PipelineError> {
        let input = self.input.clone().ok_or(PipelineError::MissingInput)?;
        self.execute_buffer(input)
    }

    /// Run the full pipeline independently over each input; results
    /// preserve input order and share no state.
    ///
    /// # Errors
    ///
    /// Returns the first error from any input's execution.
    pub fn execute_batch(&self, images: &[RgbaImage]) -> Result<Vec<PipelineResult>, PipelineError> {
        images.par_iter().map(|image| self.execute(image)).collect()
    }

    /// Run only the stages beyond the longest structural prefix shared
    /// with `prior`'s provenance.
    ///
    /// Artifacts and metadata carry forward from the prior result;
    /// re-run stages overwrite their own artifacts and metadata keys
    /// and nothing else.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BranchIncompatible`] if no prefix is
    /// shared — a caller starting fresh should use
    /// [`execute`](Self::execute) — or the first stage error
    /// encountered while running the suffix.
    pub fn execute_from(&self, prior: &PipelineResult) -> Result<PipelineResult, PipelineError> {
        let shared = self
            .stages
            .iter()
            .zip(prior.stages())
            .take_while(|(ours, theirs)| ours == theirs)
            .count();
        if shared == 0 {
            return Err(PipelineError::BranchIncompatible);
        }

        let started = Instant::now();
        let mut state = ExecutionState::resumed(prior, &self.stages[..shared]);
        for stage in &self.stages[shared..] {
            state.apply(stage)?;
        }
        Ok(state.finish(self, started))
    }
}

/// Mutable state threaded through one execution. Never escapes: the
/// caller only ever sees the immutable [`PipelineResult`].
struct ExecutionState {
    artifacts: BTreeMap<&'static str, Arc<Artifact>>,
    metadata: Metadata,
    diagnostics: PipelineDiagnostics,
}

impl ExecutionState {
    fn fresh(input: PixelBuffer) -> Self {
        let started = Instant::now();
        let mut metadata = Metadata::new();
        metadata.insert(keys::WIDTH, input.width());
        metadata.insert(keys::HEIGHT, input.height());

        let metrics = StageMetrics::Input {
            width: input.width(),
            height: input.height(),
            pixel_count: input.pixel_count() as u64,
        };
        let mut registered = BTreeMap::new();
        registered.insert(artifacts::INPUT, Arc::new(Artifact::Buffer(input)));

        Self {
            artifacts: registered,
            metadata,
            diagnostics: PipelineDiagnostics {
                stages: vec![StageDiagnostics {
                    name: "input".to_string(),
                    duration: started.elapsed(),
                    metrics,
                }],
                total_duration: std::time::Duration::ZERO,
            },
        }
    }

    /// Carry a prior result's state forward, dropping artifacts that
    /// were produced by the prior run's diverged suffix: they describe
    /// a branch this execution is about to replace.
    fn resumed(prior: &PipelineResult, shared: &[PipelineStage]) -> Self {
        let mut artifacts = prior.artifacts.clone();
        for stage in &prior.stages()[shared.len()..] {
            let name = stage.artifact();
            if !shared.iter().any(|kept| kept.artifact() == name) {
                artifacts.remove(name);
            }
        }
        Self {
            artifacts,
            metadata: prior.metadata.clone(),
            diagnostics: PipelineDiagnostics::default(),
        }
    }

    fn buffer(&self, name: &str) -> Option<&PixelBuffer> {
        match self.artifacts.get(name).map(Arc::as_ref) {
            Some(Artifact::Buffer(buffer)) => Some(buffer),
            _ => None,
        }
    }

    fn superpixels(&self) -> Option<&SuperpixelMap> {
        match self.artifacts.get(artifacts::SUPERPIXELS).map(Arc::as_ref) {
            Some(Artifact::Superpixels(map)) => Some(map),
            _ => None,
        }
    }

    fn clusters(&self) -> Option<&ClusterAssignment> {
        match self.artifacts.get(artifacts::CLUSTERS).map(Arc::as_ref) {
            Some(Artifact::Clusters(assignment)) => Some(assignment),
            _ => None,
        }
    }

    /// The buffer segmentation should operate on: the converted one
    /// when a conversion ran, otherwise the raw input.
    fn working_buffer(&self) -> Option<&PixelBuffer> {
        self.buffer(artifacts::LAB).or_else(|| self.buffer(artifacts::INPUT))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn apply(&mut self, stage: &PipelineStage) -> Result<(), PipelineError> {
        let started = Instant::now();
        let metrics = match stage {
            PipelineStage::ConvertColorSpace { target: _, scale } => {
                let input = self.buffer(artifacts::INPUT).ok_or(
                    PipelineError::MissingStageInput {
                        stage: "convertColorSpace",
                        requires: "input",
                    },
                )?;
                let converted = to_lab(input, *scale)?;
                self.artifacts
                    .insert(artifacts::LAB, Arc::new(Artifact::Buffer(converted)));
                StageMetrics::Convert {
                    scale: [scale.l, scale.a, scale.b],
                }
            }
            PipelineStage::Segment {
                superpixels,
                compactness,
            } => {
                let buffer = self
                    .working_buffer()
                    .ok_or(PipelineError::MissingStageInput {
                        stage: "segment",
                        requires: "input",
                    })?;
                let map = segment(buffer, *superpixels, *compactness);
                let achieved = map.len() as u32;
                self.metadata.insert(keys::WIDTH, map.width());
                self.metadata.insert(keys::HEIGHT, map.height());
                self.metadata.insert(keys::SUPERPIXEL_COUNT, achieved);
                self.artifacts
                    .insert(artifacts::SUPERPIXELS, Arc::new(Artifact::Superpixels(map)));
                StageMetrics::Segment {
                    requested: *superpixels,
                    achieved,
                    compactness: *compactness,
                }
            }
            PipelineStage::Cluster { clusters, seed } => {
                let map = self
                    .superpixels()
                    .ok_or(PipelineError::MissingStageInput {
                        stage: "cluster",
                        requires: "segment",
                    })?;
                let assignment = cluster(map, *clusters, *seed);
                let achieved = assignment.len() as u32;
                self.metadata.insert(keys::CLUSTER_COUNT, achieved);
                self.metadata.insert(keys::CLUSTER_SEED, *seed as i64);
                self.artifacts
                    .insert(artifacts::CLUSTERS, Arc::new(Artifact::Clusters(assignment)));
                StageMetrics::Cluster {
                    requested: *clusters,
                    achieved,
                    seed: *seed,
                }
            }
            PipelineStage::AutoMerge { threshold } => {
                let map = self
                    .superpixels()
                    .ok_or(PipelineError::MissingStageInput {
                        stage: "autoMerge",
                        requires: "segment",
                    })?;
                let assignment =
                    self.clusters().ok_or(PipelineError::MissingStageInput {
                        stage: "autoMerge",
                        requires: "cluster",
                    })?;
                let before = assignment.len() as u32;
                let merged = auto_merge(map, assignment, *threshold as f32);
                let after = merged.len() as u32;
                self.metadata.insert(keys::CLUSTER_COUNT, after);
                self.metadata.insert(keys::MERGE_THRESHOLD, *threshold);
                self.artifacts
                    .insert(artifacts::CLUSTERS, Arc::new(Artifact::Clusters(merged)));
                StageMetrics::Merge {
                    threshold: *threshold as f32,
                    clusters_before: before,
                    clusters_after: after,
                }
            }
            PipelineStage::ExtractLayers { mode, edges } => {
                let source = self.buffer(artifacts::INPUT).ok_or(
                    PipelineError::MissingStageInput {
                        stage: "extractLayers",
                        requires: "input",
                    },
                )?;
                let map = self
                    .superpixels()
                    .ok_or(PipelineError::MissingStageInput {
                        stage: "extractLayers",
                        requires: "segment",
                    })?;
                let assignment =
                    self.clusters().ok_or(PipelineError::MissingStageInput {
                        stage: "extractLayers",
                        requires: "cluster",
                    })?;
                let layers = extract_layers(source, map, assignment, *mode, *edges);
                let layer_count = layers.len();
                self.metadata
                    .insert(keys::CLUSTER_COUNT, assignment.len() as u32);
                self.artifacts
                    .insert(artifacts::LAYERS, Arc::new(Artifact::Layers(layers)));
                StageMetrics::Extract {
                    mode: mode.to_string(),
                    layer_count,
                }
            }
        };

        self.diagnostics.stages.push(StageDiagnostics {
            name: stage.name().to_string(),
            duration: started.elapsed(),
            metrics,
        });
        Ok(())
    }

    fn finish(mut self, pipeline: &Pipeline, started: Instant) -> PipelineResult {
        self.diagnostics.total_duration = started.elapsed();
        PipelineResult {
            stages: pipeline.stages.clone(),
            final_kind: pipeline
                .stages
                .last()
                .map_or(FinalKind::Input, PipelineStage::final_kind),
            artifacts: self.artifacts,
            metadata: self.metadata,
            diagnostics: self.diagnostics,
        }
    }
}

/// The terminal value of an execution: named intermediates, a typed
/// metadata mapping, and the stage provenance used for branch-prefix
/// matching.
///
/// Owned exclusively by the caller after execution and never mutated
/// by the engine, which makes sharing one result across concurrently
/// resuming branches safe.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    stages: Vec<PipelineStage>,
    artifacts: BTreeMap<&'static str, Arc<Artifact>>,
    metadata: Metadata,
    final_kind: FinalKind,
    diagnostics: PipelineDiagnostics,
}

impl PipelineResult {
    /// The stage sequence that produced this result.
    #[must_use]
    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// Which stage produced the terminal output.
    #[must_use]
    pub const fn final_kind(&self) -> FinalKind {
        self.final_kind
    }

    /// Type-checked metadata lookup: `None` when the key is absent or
    /// holds a different type.
    #[must_use]
    pub fn metadata<T: FromMetadata>(&self, key: &str) -> Option<T> {
        self.metadata.get(key)
    }

    /// The full metadata mapping.
    #[must_use]
    pub const fn metadata_map(&self) -> &Metadata {
        &self.metadata
    }

    /// A named intermediate, if this execution (or the prior run it
    /// resumed from) produced it.
    #[must_use]
    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.get(name).map(Arc::as_ref)
    }

    /// A named pixel buffer (`"input"` or `"lab"`).
    #[must_use]
    pub fn buffer(&self, name: &str) -> Option<&PixelBuffer> {
        match self.artifact(name) {
            Some(Artifact::Buffer(buffer)) => Some(buffer),
            _ => None,
        }
    }

    /// The superpixel map, if a segment stage ran.
    #[must_use]
    pub fn superpixels(&self) -> Option<&SuperpixelMap> {
        match self.artifact(artifacts::SUPERPIXELS) {
            Some(Artifact::Superpixels(map)) => Some(map),
            _ => None,
        }
    }

    /// The cluster assignment, if a cluster stage ran.
    #[must_use]
    pub fn clusters(&self) -> Option<&ClusterAssignment> {
        match self.artifact(artifacts::CLUSTERS) {
            Some(Artifact::Clusters(assignment)) => Some(assignment),
            _ => None,
        }
    }

    /// The extracted layers, if an extraction stage ran.
    #[must_use]
    pub fn layers(&self) -> Option<&[Layer]> {
        match self.artifact(artifacts::LAYERS) {
            Some(Artifact::Layers(layers)) => Some(layers),
            _ => None,
        }
    }

    /// Per-stage timing and metrics for this execution.
    #[must_use]
    pub const fn diagnostics(&self) -> &PipelineDiagnostics {
        &self.diagnostics
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn solid_image(width: u32, height: u32, rgba: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, image::Rgba(rgba))
    }

    // ─────────── builder validation ───────────

    #[test]
    fn segment_rejects_zero_superpixels() {
        let result = Pipeline::new().segment(0);
        assert!(matches!(
            result,
            Err(PipelineError::InvalidStage { stage: "segment", .. })
        ));
    }

    #[test]
    fn segment_rejects_bad_compactness() {
        assert!(Pipeline::new().segment_with(10, 0.0).is_err());
        assert!(Pipeline::new().segment_with(10, -1.0).is_err());
        assert!(Pipeline::new().segment_with(10, f32::NAN).is_err());
    }

    #[test]
    fn cluster_rejects_zero_count() {
        let result = Pipeline::new().cluster(0);
        assert!(matches!(
            result,
            Err(PipelineError::InvalidStage { stage: "cluster", .. })
        ));
    }

    #[test]
    fn auto_merge_rejects_out_of_range_thresholds() {
        assert!(Pipeline::new().auto_merge(-0.1).is_err());
        assert!(Pipeline::new().auto_merge(1.1).is_err());
        assert!(Pipeline::new().auto_merge(f64::NAN).is_err());
        assert!(Pipeline::new().auto_merge(0.0).is_ok());
        assert!(Pipeline::new().auto_merge(1.0).is_ok());
    }

    #[test]
    fn convert_rejects_invalid_scale() {
        let result =
            Pipeline::new().convert_color_space_scaled(ColorTarget::Lab, LabScale::new(0.0, 1.0, 1.0));
        assert!(matches!(
            result,
            Err(PipelineError::InvalidStage {
                stage: "convertColorSpace",
                ..
            })
        ));
    }

    #[test]
    fn builder_returns_new_values_without_touching_the_original() {
        let base = Pipeline::new().segment(10).unwrap();
        let extended = base.clone().cluster(3).unwrap();
        assert_eq!(base.stages().len(), 1);
        assert_eq!(extended.stages().len(), 2);
    }

    // ─────────── execution basics ───────────

    #[test]
    fn empty_pipeline_is_an_identity_pass() {
        let image = solid_image(8, 6, [1, 2, 3, 255]);
        let result = Pipeline::new().execute(&image).unwrap();
        assert_eq!(result.final_kind(), FinalKind::Input);
        assert_eq!(result.metadata::<i64>(keys::WIDTH), Some(8));
        assert_eq!(result.metadata::<i64>(keys::HEIGHT), Some(6));
        assert_eq!(result.metadata_map().len(), 2);
        let input = result.buffer(artifacts::INPUT).unwrap();
        assert_eq!(input.get(0, 0), PixelBuffer::from_rgba(&image).get(0, 0));
    }

    #[test]
    fn cluster_without_segment_fails_at_execution() {
        let image = solid_image(8, 8, [9, 9, 9, 255]);
        let result = Pipeline::new().cluster(3).unwrap().execute(&image);
        assert!(matches!(
            result,
            Err(PipelineError::MissingStageInput {
                stage: "cluster",
                requires: "segment",
            })
        ));
    }

    #[test]
    fn execute_seeded_requires_an_input() {
        let result = Pipeline::new().segment(4).unwrap().execute_seeded();
        assert!(matches!(result, Err(PipelineError::MissingInput)));
    }

    #[test]
    fn execute_seeded_uses_the_stored_buffer() {
        let buffer = PixelBuffer::from_rgba(&solid_image(10, 10, [50, 100, 150, 255]));
        let result = Pipeline::with_input(buffer)
            .segment(4)
            .unwrap()
            .execute_seeded()
            .unwrap();
        assert_eq!(result.final_kind(), FinalKind::Superpixels);
        assert!(result.superpixels().is_some());
    }

    #[test]
    fn final_kind_tracks_the_last_stage() {
        let image = solid_image(20, 20, [200, 40, 40, 255]);
        let segmented = Pipeline::new().segment(4).unwrap().execute(&image).unwrap();
        assert_eq!(segmented.final_kind(), FinalKind::Superpixels);

        let clustered = Pipeline::new()
            .segment(4)
            .unwrap()
            .cluster(2)
            .unwrap()
            .execute(&image)
            .unwrap();
        assert_eq!(clustered.final_kind(), FinalKind::Clusters);
    }

    #[test]
    fn diagnostics_cover_every_executed_stage() {
        let image = solid_image(20, 20, [200, 40, 40, 255]);
        let result = Pipeline::new()
            .convert_color_space(ColorTarget::Lab)
            .unwrap()
            .segment(4)
            .unwrap()
            .cluster(2)
            .unwrap()
            .execute(&image)
            .unwrap();
        let names: Vec<&str> = result
            .diagnostics()
            .stages
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["input", "convertColorSpace", "segment", "cluster"]);
    }

    // ─────────── branch reuse ───────────

    #[test]
    fn execute_from_rejects_disjoint_pipelines() {
        let image = solid_image(20, 20, [10, 200, 10, 255]);
        let prior = Pipeline::new().segment(4).unwrap().execute(&image).unwrap();
        let other = Pipeline::new()
            .convert_color_space(ColorTarget::Lab)
            .unwrap()
            .segment(4)
            .unwrap();
        let result = other.execute_from(&prior);
        assert!(matches!(result, Err(PipelineError::BranchIncompatible)));
    }

    #[test]
    fn execute_from_skips_the_shared_prefix() {
        let image = solid_image(30, 30, [10, 200, 10, 255]);
        let prefix = Pipeline::new()
            .convert_color_space(ColorTarget::Lab)
            .unwrap()
            .segment(9)
            .unwrap();
        let prior = prefix.execute(&image).unwrap();

        let full = prefix.clone().cluster_seeded(3, 7).unwrap();
        let resumed = full.execute_from(&prior).unwrap();

        // Only the cluster stage ran; the prefix came from the prior.
        let names: Vec<&str> = resumed
            .diagnostics()
            .stages
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["cluster"]);
        assert_eq!(resumed.metadata::<i64>(keys::CLUSTER_COUNT), Some(3));
        assert_eq!(resumed.final_kind(), FinalKind::Clusters);
    }

    #[test]
    fn resume_drops_artifacts_from_the_diverged_suffix() {
        let image = solid_image(30, 30, [10, 200, 10, 255]);
        let prefix = Pipeline::new().segment(9).unwrap();
        let prior = prefix
            .clone()
            .cluster(5)
            .unwrap()
            .extract_layers()
            .unwrap()
            .execute(&image)
            .unwrap();
        assert!(prior.layers().is_some());

        // The new branch diverges at the cluster stage; the prior's
        // clusters and layers describe the old branch and must go.
        let branch = prefix.cluster_seeded(3, 9).unwrap();
        let resumed = branch.execute_from(&prior).unwrap();
        assert_eq!(resumed.clusters().unwrap().len(), 3);
        assert!(resumed.layers().is_none());
        assert!(resumed.superpixels().is_some());
    }

    // ─────────── batch ───────────

    #[test]
    fn batch_preserves_input_order() {
        let images = vec![
            solid_image(10, 10, [255, 0, 0, 255]),
            solid_image(20, 10, [0, 255, 0, 255]),
            solid_image(30, 10, [0, 0, 255, 255]),
        ];
        let pipeline = Pipeline::new().segment(4).unwrap();
        let results = pipeline.execute_batch(&images).unwrap();
        assert_eq!(results.len(), 3);
        let widths: Vec<i64> = results
            .iter()
            .map(|r| r.metadata::<i64>(keys::WIDTH).unwrap())
            .collect();
        assert_eq!(widths, vec![10, 20, 30]);
    }

    #[test]
    fn stage_descriptors_compare_structurally() {
        let a = Pipeline::new().segment(10).unwrap().cluster(3).unwrap();
        let b = Pipeline::new().segment(10).unwrap().cluster(3).unwrap();
        let c = Pipeline::new().segment(10).unwrap().cluster(4).unwrap();
        assert_eq!(a.stages(), b.stages());
        assert_ne!(a.stages(), c.stages());
    }

    #[test]
    fn stage_serde_round_trip() {
        let pipeline = Pipeline::new()
            .convert_color_space_scaled(ColorTarget::Lab, LabScale::new(0.65, 1.0, 1.0))
            .unwrap()
            .segment_with(100, 12.5)
            .unwrap()
            .cluster_seeded(5, 42)
            .unwrap()
            .auto_merge(0.2)
            .unwrap()
            .extract_layers()
            .unwrap();
        let json = serde_json::to_string(pipeline.stages()).unwrap();
        let back: Vec<PipelineStage> = serde_json::from_str(&json).unwrap();
        assert_eq!(pipeline.stages(), back.as_slice());
    }
}
