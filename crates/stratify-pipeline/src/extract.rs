//! Layer extraction: rasterize each surviving cluster into an
//! independent, alpha-masked image layer.
//!
//! Each cluster's superpixel footprint is upsampled to full pixel
//! resolution as an alpha mask, colored either with the cluster's mean
//! color or with the masked source pixels, and emitted largest region
//! first so compositing the layers back-to-front reconstructs the
//! source.

use image::{GrayImage, Luma, Rgba, RgbaImage};
use imageproc::filter::gaussian_blur_f32;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterAssignment;
use crate::color::sample_to_rgb8;
use crate::segment::SuperpixelMap;
use crate::types::PixelBuffer;

/// Blur sigma applied to the alpha mask in [`EdgeMode::Soft`].
pub const SOFT_EDGE_SIGMA: f32 = 0.8;

/// How a layer's visible pixels are colored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExtractMode {
    /// Fill the footprint with the cluster's mean color.
    #[default]
    MeanColor,
    /// Copy the original pixel colors inside the footprint.
    SourcePixels,
}

impl std::fmt::Display for ExtractMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MeanColor => write!(f, "meanColor"),
            Self::SourcePixels => write!(f, "sourcePixels"),
        }
    }
}

/// How the alpha mask treats cluster boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EdgeMode {
    /// Binary mask: a pixel is fully in or fully out.
    #[default]
    Hard,
    /// Gaussian-softened mask for anti-aliased boundaries.
    Soft,
}

/// One extracted layer: a full-sized RGBA raster whose alpha mask is
/// the cluster footprint, plus the cluster's representative color.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    image: RgbaImage,
    color: [u8; 3],
    cluster: u32,
    pixels: u64,
}

impl Layer {
    /// The rasterized layer image.
    #[must_use]
    pub const fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// The cluster's representative color as 8-bit sRGB.
    #[must_use]
    pub const fn color(&self) -> [u8; 3] {
        self.color
    }

    /// Id of the cluster this layer was extracted from.
    #[must_use]
    pub const fn cluster(&self) -> u32 {
        self.cluster
    }

    /// Number of pixels in the cluster footprint.
    #[must_use]
    pub const fn pixels(&self) -> u64 {
        self.pixels
    }
}

/// Serde proxy for [`Layer`]: `RgbaImage` does not implement the serde
/// traits, so the raster is carried as `(width, height, raw_bytes)`.
#[derive(Serialize, Deserialize)]
struct LayerProxy {
    image: (u32, u32, Vec<u8>),
    color: [u8; 3],
    cluster: u32,
    pixels: u64,
}

impl Serialize for Layer {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let proxy = LayerProxy {
            image: (
                self.image.width(),
                self.image.height(),
                self.image.as_raw().clone(),
            ),
            color: self.color,
            cluster: self.cluster,
            pixels: self.pixels,
        };
        proxy.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Layer {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = LayerProxy::deserialize(deserializer)?;
        let image = RgbaImage::from_raw(proxy.image.0, proxy.image.1, proxy.image.2)
            .ok_or_else(|| serde::de::Error::custom("invalid layer image dimensions"))?;
        Ok(Self {
            image,
            color: proxy.color,
            cluster: proxy.cluster,
            pixels: proxy.pixels,
        })
    }
}

/// Per-layer statistics for reporting and export manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    /// Position of the layer in the extracted (coverage-ordered) stack.
    pub layer: usize,
    /// Number of pixels in the layer's footprint.
    pub pixel_count: u64,
    /// Footprint as a percentage of the source image.
    pub percentage: f64,
    /// Representative color as 8-bit sRGB.
    pub color: [u8; 3],
}

/// Rasterize every surviving cluster into a layer, ordered by
/// descending pixel coverage (ties to the lower cluster id).
#[must_use]
pub fn extract_layers(
    source: &PixelBuffer,
    map: &SuperpixelMap,
    assignment: &ClusterAssignment,
    mode: ExtractMode,
    edges: EdgeMode,
) -> Vec<Layer> {
    let width = map.width();
    let height = map.height();

    // Upsample the superpixel footprints to a per-pixel cluster grid.
    let pixel_clusters: Vec<u32> = map
        .labels()
        .iter()
        .map(|&label| assignment.cluster_of(label))
        .collect();

    let mut counts = vec![0_u64; assignment.len()];
    for &cluster in &pixel_clusters {
        counts[cluster as usize] += 1;
    }

    #[allow(clippy::cast_possible_truncation)]
    let mut order: Vec<u32> = (0..assignment.len() as u32).collect();
    order.sort_by(|&a, &b| {
        counts[b as usize]
            .cmp(&counts[a as usize])
            .then(a.cmp(&b))
    });

    order
        .par_iter()
        .map(|&cluster| {
            let mask = GrayImage::from_fn(width, height, |x, y| {
                let index = y as usize * width as usize + x as usize;
                Luma([if pixel_clusters[index] == cluster { 255 } else { 0 }])
            });
            let alpha = match edges {
                EdgeMode::Hard => mask,
                EdgeMode::Soft => gaussian_blur_f32(&mask, SOFT_EDGE_SIGMA),
            };

            let color = sample_to_rgb8(assignment.means()[cluster as usize], map.color_space());
            let image = RgbaImage::from_fn(width, height, |x, y| {
                let a = alpha.get_pixel(x, y).0[0];
                if a == 0 {
                    return Rgba([0, 0, 0, 0]);
                }
                let rgb = match mode {
                    ExtractMode::MeanColor => color,
                    ExtractMode::SourcePixels => {
                        sample_to_rgb8(source.get(x, y), source.color_space())
                    }
                };
                Rgba([rgb[0], rgb[1], rgb[2], a])
            });

            Layer {
                image,
                color,
                cluster,
                pixels: counts[cluster as usize],
            }
        })
        .collect()
}

/// Compute per-layer statistics against the source dimensions.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn layer_stats(layers: &[Layer], width: u32, height: u32) -> Vec<LayerStats> {
    let total = f64::from(width) * f64::from(height);
    layers
        .iter()
        .enumerate()
        .map(|(index, layer)| LayerStats {
            layer: index,
            pixel_count: layer.pixels(),
            percentage: if total > 0.0 {
                layer.pixels() as f64 / total * 100.0
            } else {
                0.0
            },
            color: layer.color(),
        })
        .collect()
}
