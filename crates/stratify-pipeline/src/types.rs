//! Shared types for the stratify layer decomposition pipeline.

use serde::{Deserialize, Serialize};

/// Re-export `RgbaImage` so downstream crates can reference extracted
/// layer rasters without depending on `image` directly.
pub use image::RgbaImage;

/// Per-axis scale factors applied after RGB→LAB conversion.
///
/// Scaling biases every downstream distance computation. Shrinking `l`
/// de-emphasizes lightness so clustering groups by hue (the classic
/// icon-tracing setup uses `l = 0.65`); growing `b` emphasizes the
/// blue–yellow axis for green-heavy imagery.
///
/// Invariant: all three factors are finite and strictly positive,
/// enforced when the scale enters a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabScale {
    /// Multiplier for the lightness axis.
    pub l: f32,
    /// Multiplier for the green–red axis.
    pub a: f32,
    /// Multiplier for the blue–yellow axis.
    pub b: f32,
}

impl LabScale {
    /// Identity scale: plain CIE L\*a\*b\* distances.
    pub const IDENTITY: Self = Self {
        l: 1.0,
        a: 1.0,
        b: 1.0,
    };

    /// Create a new scale from per-axis factors.
    #[must_use]
    pub const fn new(l: f32, a: f32, b: f32) -> Self {
        Self { l, a, b }
    }

    /// Whether all factors are finite and strictly positive.
    #[must_use]
    pub fn is_valid(self) -> bool {
        [self.l, self.a, self.b]
            .iter()
            .all(|f| f.is_finite() && *f > 0.0)
    }
}

impl Default for LabScale {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// The color space a [`PixelBuffer`]'s samples live in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ColorSpace {
    /// Non-linear sRGB, components in `0.0..=1.0`.
    Rgb,
    /// CIE L\*a\*b\* with the given per-axis scale already applied.
    Lab {
        /// The scale that was applied during conversion. Needed to
        /// undo the bias when mapping cluster means back to sRGB.
        scale: LabScale,
    },
}

impl std::fmt::Display for ColorSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rgb => write!(f, "rgb"),
            Self::Lab { .. } => write!(f, "lab"),
        }
    }
}

/// A width×height grid of three-component color samples plus an
/// optional alpha plane.
///
/// Buffers are immutable once produced: every pipeline stage consumes
/// input buffers by reference and produces new buffers, so a buffer
/// held by one branch's result can never be mutated by another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    color_space: ColorSpace,
    samples: Vec<[f32; 3]>,
    alpha: Option<Vec<f32>>,
}

impl PixelBuffer {
    /// Build an sRGB buffer from a decoded RGBA image.
    ///
    /// Partially transparent pixels are composited over white, matching
    /// how icon sources are flattened before analysis; the original
    /// alpha plane is retained so later stages can pass it through.
    /// Fully opaque images carry no alpha plane.
    #[must_use]
    pub fn from_rgba(image: &RgbaImage) -> Self {
        let pixel_count = image.width() as usize * image.height() as usize;
        let mut samples = Vec::with_capacity(pixel_count);
        let mut alpha = Vec::with_capacity(pixel_count);
        let mut any_transparent = false;
        for pixel in image.pixels() {
            let a = f32::from(pixel.0[3]) / 255.0;
            if a < 1.0 {
                any_transparent = true;
            }
            let over_white = |c: u8| (f32::from(c) / 255.0).mul_add(a, 1.0 - a);
            samples.push([
                over_white(pixel.0[0]),
                over_white(pixel.0[1]),
                over_white(pixel.0[2]),
            ]);
            alpha.push(a);
        }
        Self {
            width: image.width(),
            height: image.height(),
            color_space: ColorSpace::Rgb,
            samples,
            alpha: any_transparent.then_some(alpha),
        }
    }

    /// Construct a buffer from raw parts.
    ///
    /// Returns `None` if the sample count (or alpha plane length, when
    /// present) does not equal `width * height`.
    #[must_use]
    pub fn from_parts(
        width: u32,
        height: u32,
        color_space: ColorSpace,
        samples: Vec<[f32; 3]>,
        alpha: Option<Vec<f32>>,
    ) -> Option<Self> {
        let expected = width as usize * height as usize;
        if samples.len() != expected {
            return None;
        }
        if alpha.as_ref().is_some_and(|a| a.len() != expected) {
            return None;
        }
        Some(Self {
            width,
            height,
            color_space,
            samples,
            alpha,
        })
    }

    /// Buffer width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Buffer height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Total number of pixels.
    #[must_use]
    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// The color space the samples live in.
    #[must_use]
    pub const fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    /// All samples in row-major order.
    #[must_use]
    pub fn samples(&self) -> &[[f32; 3]] {
        &self.samples
    }

    /// The alpha plane, if the source image carried transparency.
    #[must_use]
    pub fn alpha(&self) -> Option<&[f32]> {
        self.alpha.as_deref()
    }

    /// Sample at `(x, y)`. Coordinates must be in bounds.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> [f32; 3] {
        debug_assert!(x < self.width && y < self.height);
        self.samples[y as usize * self.width as usize + x as usize]
    }
}

/// Which stage produced the terminal output of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalKind {
    /// Zero-stage pipeline: the input passed through unmodified.
    Input,
    /// A color space conversion was the last stage.
    Converted,
    /// Superpixel segmentation was the last stage.
    Superpixels,
    /// Clustering or merging was the last stage.
    Clusters,
    /// Layer extraction was the last stage.
    Layers,
}

/// Errors reported by pipeline construction and execution.
///
/// Construction errors surface synchronously from the builder call that
/// introduced them; execution errors abort the remaining stage sequence
/// and no partial result is returned.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A stage was appended with a parameter outside its domain.
    #[error("invalid {stage} stage: {reason}")]
    InvalidStage {
        /// Name of the stage being appended.
        stage: &'static str,
        /// What was wrong with the parameters.
        reason: String,
    },

    /// A stage received a buffer in a color space it cannot consume.
    #[error("unsupported pixel format for {stage}: expected {expected}, found {found}")]
    UnsupportedFormat {
        /// Name of the stage that rejected the buffer.
        stage: &'static str,
        /// The color space the stage requires.
        expected: &'static str,
        /// The color space it was handed.
        found: String,
    },

    /// `execute_from` was given a result sharing no stage prefix with
    /// this pipeline. Callers starting fresh should execute from the
    /// source image instead; recomputing silently would mask the
    /// mismatch.
    #[error("prior result shares no stage prefix with this pipeline")]
    BranchIncompatible,

    /// A stage needs an intermediate a preceding stage never produced.
    #[error("{stage} stage requires a prior {requires} stage")]
    MissingStageInput {
        /// Name of the stage that could not run.
        stage: &'static str,
        /// The stage kind that must precede it.
        requires: &'static str,
    },

    /// `execute_seeded` was called on a pipeline built without an
    /// input buffer.
    #[error("pipeline was built without a pre-seeded input buffer")]
    MissingInput,

    /// Failed to decode the source image bytes.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The source image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn lab_scale_identity_is_valid() {
        assert!(LabScale::IDENTITY.is_valid());
        assert_eq!(LabScale::default(), LabScale::IDENTITY);
    }

    #[test]
    fn lab_scale_rejects_non_positive_and_non_finite() {
        assert!(!LabScale::new(0.0, 1.0, 1.0).is_valid());
        assert!(!LabScale::new(1.0, -2.0, 1.0).is_valid());
        assert!(!LabScale::new(1.0, 1.0, f32::NAN).is_valid());
        assert!(!LabScale::new(f32::INFINITY, 1.0, 1.0).is_valid());
        assert!(LabScale::new(0.65, 1.0, 1.0).is_valid());
    }

    #[test]
    fn color_space_display() {
        assert_eq!(ColorSpace::Rgb.to_string(), "rgb");
        assert_eq!(
            ColorSpace::Lab {
                scale: LabScale::IDENTITY
            }
            .to_string(),
            "lab",
        );
    }

    #[test]
    fn from_rgba_opaque_has_no_alpha_plane() {
        let img = RgbaImage::from_pixel(4, 3, image::Rgba([255, 0, 0, 255]));
        let buffer = PixelBuffer::from_rgba(&img);
        assert_eq!(buffer.width(), 4);
        assert_eq!(buffer.height(), 3);
        assert_eq!(buffer.pixel_count(), 12);
        assert_eq!(buffer.color_space(), ColorSpace::Rgb);
        assert!(buffer.alpha().is_none());
        assert_eq!(buffer.get(0, 0), [1.0, 0.0, 0.0]);
    }

    #[test]
    fn from_rgba_composites_transparency_over_white() {
        let img = RgbaImage::from_pixel(1, 1, image::Rgba([0, 0, 0, 0]));
        let buffer = PixelBuffer::from_rgba(&img);
        // Fully transparent black reads as white after compositing.
        assert_eq!(buffer.get(0, 0), [1.0, 1.0, 1.0]);
        assert_eq!(buffer.alpha(), Some([0.0].as_slice()));
    }

    #[test]
    fn from_parts_validates_lengths() {
        assert!(PixelBuffer::from_parts(2, 2, ColorSpace::Rgb, vec![[0.0; 3]; 4], None).is_some());
        assert!(PixelBuffer::from_parts(2, 2, ColorSpace::Rgb, vec![[0.0; 3]; 3], None).is_none());
        assert!(
            PixelBuffer::from_parts(2, 2, ColorSpace::Rgb, vec![[0.0; 3]; 4], Some(vec![1.0; 2]))
                .is_none()
        );
    }

    #[test]
    fn pixel_buffer_serde_round_trip() {
        let img = RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 255]));
        let buffer = PixelBuffer::from_rgba(&img);
        let json = serde_json::to_string(&buffer).unwrap();
        let back: PixelBuffer = serde_json::from_str(&json).unwrap();
        assert_eq!(buffer, back);
    }

    #[test]
    fn error_messages_name_the_stage() {
        let err = PipelineError::InvalidStage {
            stage: "segment",
            reason: "superpixel count must be positive".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid segment stage: superpixel count must be positive",
        );

        let err = PipelineError::MissingStageInput {
            stage: "cluster",
            requires: "segment",
        };
        assert_eq!(err.to_string(), "cluster stage requires a prior segment stage");
    }
}
