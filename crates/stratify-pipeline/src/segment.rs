//! SLIC-style superpixel segmentation.
//!
//! Partitions a converted buffer into a target number of compact,
//! color-coherent regions. The algorithm follows the classic SLIC
//! outline: seed one center per grid cell (snapped off local gradient
//! maxima), iterate windowed assignment and centroid updates until the
//! centers settle, then enforce label connectivity and relabel to a
//! contiguous range.
//!
//! Each pixel only ever competes among the centers seeded in its
//! surrounding grid cells, which bounds the work to near-linear in
//! image size instead of `pixels × centers`.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::color::distance_squared;
use crate::types::{ColorSpace, PixelBuffer};

/// Default compactness weight: a mid-range tradeoff between spatially
/// regular and color-adherent superpixel shapes.
pub const DEFAULT_COMPACTNESS: f32 = 10.0;

/// Upper bound on assignment/update rounds.
const MAX_ITERATIONS: usize = 10;

/// Stop iterating once no center moved further than this (pixels).
const CONVERGENCE_EPSILON: f32 = 1.0;

/// Descriptor of a single superpixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Mean color of the member pixels, in the map's color space.
    pub color: [f32; 3],
    /// Mean horizontal position of the member pixels.
    pub x: f32,
    /// Mean vertical position of the member pixels.
    pub y: f32,
    /// Number of member pixels.
    pub pixels: u32,
}

/// A per-pixel label grid plus one [`Region`] descriptor per label.
///
/// Invariants: every pixel carries exactly one label, labels form a
/// contiguous `0..len` range, and no region is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperpixelMap {
    width: u32,
    height: u32,
    color_space: ColorSpace,
    labels: Vec<u32>,
    regions: Vec<Region>,
}

impl SuperpixelMap {
    /// Map width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Map height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// The color space region colors are expressed in.
    #[must_use]
    pub const fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    /// Per-pixel labels in row-major order.
    #[must_use]
    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Label at `(x, y)`. Coordinates must be in bounds.
    #[must_use]
    pub fn label(&self, x: u32, y: u32) -> u32 {
        debug_assert!(x < self.width && y < self.height);
        self.labels[y as usize * self.width as usize + x as usize]
    }

    /// Region descriptors, indexed by label.
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Number of superpixels.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the map has no regions (never true for a produced map).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// A moving cluster center during iteration.
#[derive(Clone, Copy)]
struct Center {
    color: [f32; 3],
    x: f32,
    y: f32,
}

/// Fixed seed-cell geometry. Centers stay keyed to the cell they were
/// seeded in, so the candidate lookup stays stable while they drift.
struct SeedGrid {
    cols: usize,
    rows: usize,
    cell_w: f32,
    cell_h: f32,
    spacing: f32,
}

impl SeedGrid {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
    fn new(width: u32, height: u32, superpixels: u32) -> Self {
        let pixels = width as usize * height as usize;
        let target = (superpixels as usize).clamp(1, pixels);
        let spacing = ((pixels as f32) / target as f32).sqrt();

        // Floor keeps cols * rows <= target; clamping handles slivers
        // where one dimension is narrower than the grid spacing.
        let cols = ((f64::from(width) / f64::from(spacing)) as usize)
            .max(1)
            .min(target);
        let rows = ((f64::from(height) / f64::from(spacing)) as usize)
            .max(1)
            .min((target / cols).max(1));

        Self {
            cols,
            rows,
            cell_w: width as f32 / cols as f32,
            cell_h: height as f32 / rows as f32,
            spacing,
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn cell_of(&self, x: u32, y: u32) -> (usize, usize) {
        let gx = ((x as f32 / self.cell_w) as usize).min(self.cols - 1);
        let gy = ((y as f32 / self.cell_h) as usize).min(self.rows - 1);
        (gx, gy)
    }
}

/// Segment a buffer into at most `superpixels` regions.
///
/// The achieved region count can fall below the request at image
/// boundaries or after connectivity enforcement, and is always at
/// least one; images too small for the requested grid degrade to a
/// single region rather than failing.
#[must_use]
pub fn segment(buffer: &PixelBuffer, superpixels: u32, compactness: f32) -> SuperpixelMap {
    let width = buffer.width();
    let height = buffer.height();
    let grid = SeedGrid::new(width, height, superpixels);
    let mut centers = seed_centers(buffer, &grid);

    let mut labels = assign(buffer, &grid, &centers, compactness);
    for _ in 0..MAX_ITERATIONS {
        let movement = update_centers(buffer, &labels, &mut centers);
        labels = assign(buffer, &grid, &centers, compactness);
        if movement < CONVERGENCE_EPSILON {
            break;
        }
    }

    let labels = enforce_connectivity(width, height, &labels);
    build_map(buffer, labels)
}

/// Place one center per grid cell, snapped to the lowest-gradient
/// pixel in a 3×3 neighborhood so no center seeds on an edge.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
fn seed_centers(buffer: &PixelBuffer, grid: &SeedGrid) -> Vec<Center> {
    let width = buffer.width();
    let height = buffer.height();
    let mut centers = Vec::with_capacity(grid.cols * grid.rows);
    for gy in 0..grid.rows {
        for gx in 0..grid.cols {
            let cx = (((gx as f32 + 0.5) * grid.cell_w) as u32).min(width - 1);
            let cy = (((gy as f32 + 0.5) * grid.cell_h) as u32).min(height - 1);
            let (sx, sy) = snap_to_min_gradient(buffer, cx, cy);
            centers.push(Center {
                color: buffer.get(sx, sy),
                x: sx as f32,
                y: sy as f32,
            });
        }
    }
    centers
}

/// Color gradient magnitude at a pixel (squared central differences).
fn gradient(buffer: &PixelBuffer, x: u32, y: u32) -> f32 {
    let left = buffer.get(x.saturating_sub(1), y);
    let right = buffer.get((x + 1).min(buffer.width() - 1), y);
    let up = buffer.get(x, y.saturating_sub(1));
    let down = buffer.get(x, (y + 1).min(buffer.height() - 1));
    distance_squared(left, right) + distance_squared(up, down)
}

/// The lowest-gradient pixel within the 3×3 neighborhood of `(x, y)`.
fn snap_to_min_gradient(buffer: &PixelBuffer, x: u32, y: u32) -> (u32, u32) {
    let mut best = (x, y);
    let mut best_gradient = gradient(buffer, x, y);
    for ny in y.saturating_sub(1)..=(y + 1).min(buffer.height() - 1) {
        for nx in x.saturating_sub(1)..=(x + 1).min(buffer.width() - 1) {
            let g = gradient(buffer, nx, ny);
            if g < best_gradient {
                best_gradient = g;
                best = (nx, ny);
            }
        }
    }
    best
}

/// Assign every pixel to the best center among its 3×3 neighborhood of
/// seed cells, minimizing `colorDist² + (spatialDist / S)² · C²`.
///
/// Rows are processed in parallel; ties go to the lowest-indexed
/// center because candidates are visited in ascending index order and
/// only a strictly smaller distance displaces the incumbent.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn assign(buffer: &PixelBuffer, grid: &SeedGrid, centers: &[Center], compactness: f32) -> Vec<u32> {
    let width = buffer.width() as usize;
    let height = buffer.height() as usize;
    let spatial_weight = compactness * compactness / (grid.spacing * grid.spacing);

    let mut labels = vec![0_u32; width * height];
    labels
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, slot) in row.iter_mut().enumerate() {
                let sample = buffer.get(x as u32, y as u32);
                let (gx, gy) = grid.cell_of(x as u32, y as u32);
                let mut best = 0_u32;
                let mut best_distance = f32::INFINITY;
                for cy in gy.saturating_sub(1)..=(gy + 1).min(grid.rows - 1) {
                    for cx in gx.saturating_sub(1)..=(gx + 1).min(grid.cols - 1) {
                        let index = cy * grid.cols + cx;
                        let center = centers[index];
                        let dx = x as f32 - center.x;
                        let dy = y as f32 - center.y;
                        let spatial = dy.mul_add(dy, dx * dx);
                        let distance = spatial.mul_add(
                            spatial_weight,
                            distance_squared(sample, center.color),
                        );
                        if distance < best_distance {
                            best_distance = distance;
                            best = index as u32;
                        }
                    }
                }
                *slot = best;
            }
        });
    labels
}

/// Recompute each center as the mean color and position of its
/// assigned pixels. Returns the largest center displacement; centers
/// that lost every pixel stay where they were.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn update_centers(buffer: &PixelBuffer, labels: &[u32], centers: &mut [Center]) -> f32 {
    let width = buffer.width() as usize;
    let mut sums = vec![[0.0_f64; 5]; centers.len()];
    let mut counts = vec![0_u64; centers.len()];

    for (index, &label) in labels.iter().enumerate() {
        let sample = buffer.samples()[index];
        let entry = &mut sums[label as usize];
        entry[0] += f64::from(sample[0]);
        entry[1] += f64::from(sample[1]);
        entry[2] += f64::from(sample[2]);
        entry[3] += (index % width) as f64;
        entry[4] += (index / width) as f64;
        counts[label as usize] += 1;
    }

    let mut movement = 0.0_f32;
    for (center, (sum, count)) in centers.iter_mut().zip(sums.iter().zip(&counts)) {
        if *count == 0 {
            continue;
        }
        let n = *count as f64;
        let next = Center {
            color: [
                (sum[0] / n) as f32,
                (sum[1] / n) as f32,
                (sum[2] / n) as f32,
            ],
            x: (sum[3] / n) as f32,
            y: (sum[4] / n) as f32,
        };
        let dx = next.x - center.x;
        let dy = next.y - center.y;
        movement = movement.max(dy.mul_add(dy, dx * dx).sqrt());
        *center = next;
    }
    movement
}

/// One connected component of same-labeled pixels.
struct Component {
    old_label: u32,
    pixels: Vec<usize>,
}

/// Enforce label connectivity and relabel to a contiguous range.
///
/// The largest component of each label keeps it; every detached
/// fragment is absorbed into the label held by the majority of its
/// already-resolved neighboring pixels (ties to the lowest label).
/// Absorbing every fragment, regardless of size, also guarantees the
/// achieved count never exceeds the seeded count.
#[allow(clippy::cast_possible_truncation)]
fn enforce_connectivity(width: u32, height: u32, labels: &[u32]) -> Vec<u32> {
    let width = width as usize;
    let height = height as usize;
    const UNVISITED: u32 = u32::MAX;

    // Pass 1: connected component analysis (4-connectivity).
    let mut component_of = vec![UNVISITED; labels.len()];
    let mut components: Vec<Component> = Vec::new();
    let mut stack = Vec::new();
    for start in 0..labels.len() {
        if component_of[start] != UNVISITED {
            continue;
        }
        let id = components.len() as u32;
        let old_label = labels[start];
        let mut pixels = Vec::new();
        component_of[start] = id;
        stack.push(start);
        while let Some(index) = stack.pop() {
            pixels.push(index);
            for neighbor in neighbors4(index, width, height) {
                if component_of[neighbor] == UNVISITED && labels[neighbor] == old_label {
                    component_of[neighbor] = id;
                    stack.push(neighbor);
                }
            }
        }
        components.push(Component { old_label, pixels });
    }

    // Pass 2: the largest component of each original label survives.
    let label_count = labels.iter().max().map_or(0, |&m| m as usize + 1);
    let mut largest: Vec<Option<usize>> = vec![None; label_count];
    for (index, component) in components.iter().enumerate() {
        let slot = &mut largest[component.old_label as usize];
        let is_larger = slot.is_none_or(|held: usize| {
            component.pixels.len() > components[held].pixels.len()
        });
        if is_larger {
            *slot = Some(index);
        }
    }

    let mut resolved: Vec<Option<u32>> = vec![None; components.len()];
    let mut next_label = 0_u32;
    for (index, component) in components.iter().enumerate() {
        if largest[component.old_label as usize] == Some(index) {
            resolved[index] = Some(next_label);
            next_label += 1;
        }
    }

    // Pass 3: absorb fragments into the majority neighboring label.
    // Each sweep resolves every fragment adjacent to resolved territory,
    // so the loop terminates: the component adjacency graph is connected
    // and at least one component resolved above.
    let mut unresolved: Vec<usize> = (0..components.len())
        .filter(|&i| resolved[i].is_none())
        .collect();
    while !unresolved.is_empty() {
        let mut remaining = Vec::new();
        let mut progressed = false;
        for &component_index in &unresolved {
            let mut votes: std::collections::BTreeMap<u32, usize> = std::collections::BTreeMap::new();
            for &pixel in &components[component_index].pixels {
                for neighbor in neighbors4(pixel, width, height) {
                    let neighbor_component = component_of[neighbor] as usize;
                    if neighbor_component == component_index {
                        continue;
                    }
                    if let Some(label) = resolved[neighbor_component] {
                        *votes.entry(label).or_insert(0) += 1;
                    }
                }
            }
            // Majority label; BTreeMap order makes the tie-break the
            // lowest label.
            let winner = votes
                .iter()
                .max_by(|(la, ca), (lb, cb)| ca.cmp(cb).then(lb.cmp(la)))
                .map(|(&label, _)| label);
            if let Some(label) = winner {
                resolved[component_index] = Some(label);
                progressed = true;
            } else {
                remaining.push(component_index);
            }
        }
        if !progressed {
            // Unreachable on a connected grid; resolve leftovers to the
            // first label instead of looping forever.
            for component_index in &remaining {
                resolved[*component_index] = Some(0);
            }
            remaining.clear();
        }
        unresolved = remaining;
    }

    let mut final_labels = vec![0_u32; labels.len()];
    for (component_index, component) in components.iter().enumerate() {
        let label = resolved[component_index].unwrap_or(0);
        for &pixel in &component.pixels {
            final_labels[pixel] = label;
        }
    }
    final_labels
}

/// 4-connected neighbor indices of a pixel.
fn neighbors4(index: usize, width: usize, height: usize) -> impl Iterator<Item = usize> {
    let x = index % width;
    let y = index / width;
    [
        (x > 0).then(|| index - 1),
        (x + 1 < width).then(|| index + 1),
        (y > 0).then(|| index - width),
        (y + 1 < height).then(|| index + width),
    ]
    .into_iter()
    .flatten()
}

/// Accumulate region descriptors from the final label grid.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn build_map(buffer: &PixelBuffer, labels: Vec<u32>) -> SuperpixelMap {
    let width = buffer.width() as usize;
    let count = labels.iter().max().map_or(0, |&m| m as usize + 1);
    let mut sums = vec![[0.0_f64; 5]; count];
    let mut counts = vec![0_u32; count];
    for (index, &label) in labels.iter().enumerate() {
        let sample = buffer.samples()[index];
        let entry = &mut sums[label as usize];
        entry[0] += f64::from(sample[0]);
        entry[1] += f64::from(sample[1]);
        entry[2] += f64::from(sample[2]);
        entry[3] += (index % width) as f64;
        entry[4] += (index / width) as f64;
        counts[label as usize] += 1;
    }

    let regions = sums
        .iter()
        .zip(&counts)
        .map(|(sum, &pixels)| {
            let n = f64::from(pixels.max(1));
            Region {
                color: [
                    (sum[0] / n) as f32,
                    (sum[1] / n) as f32,
                    (sum[2] / n) as f32,
                ],
                x: (sum[3] / n) as f32,
                y: (sum[4] / n) as f32,
                pixels,
            }
        })
        .collect();

    SuperpixelMap {
        width: buffer.width(),
        height: buffer.height(),
        color_space: buffer.color_space(),
        labels,
        regions,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::color::to_lab;
    use crate::types::LabScale;
    use image::RgbaImage;

    fn lab_buffer(image: &RgbaImage) -> PixelBuffer {
        to_lab(&PixelBuffer::from_rgba(image), LabScale::IDENTITY).unwrap()
    }

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> PixelBuffer {
        lab_buffer(&RgbaImage::from_pixel(width, height, image::Rgba(rgba)))
    }

    fn assert_invariants(map: &SuperpixelMap, requested: u32) {
        assert!(!map.is_empty());
        assert!(map.len() <= requested as usize);
        let mut seen = vec![0_u32; map.len()];
        for &label in map.labels() {
            assert!((label as usize) < map.len(), "label out of range");
            seen[label as usize] += 1;
        }
        for (label, (&count, region)) in seen.iter().zip(map.regions()).enumerate() {
            assert!(count > 0, "label {label} is empty");
            assert_eq!(count, region.pixels, "label {label} count mismatch");
        }
    }

    #[test]
    fn uniform_image_keeps_the_seeded_grid() {
        let buffer = solid(100, 100, [255, 0, 0, 255]);
        let map = segment(&buffer, 100, DEFAULT_COMPACTNESS);
        assert_eq!(map.len(), 100);
        assert_invariants(&map, 100);
    }

    #[test]
    fn achieved_count_never_exceeds_request() {
        let buffer = solid(37, 23, [20, 120, 220, 255]);
        for requested in [1, 5, 16, 64] {
            let map = segment(&buffer, requested, DEFAULT_COMPACTNESS);
            assert_invariants(&map, requested);
        }
    }

    #[test]
    fn degenerate_image_falls_back_to_one_region() {
        let buffer = solid(1, 1, [9, 9, 9, 255]);
        let map = segment(&buffer, 50, DEFAULT_COMPACTNESS);
        assert_eq!(map.len(), 1);
        assert_eq!(map.labels(), &[0]);
    }

    #[test]
    fn narrow_image_stays_within_request() {
        let buffer = solid(1, 100, [80, 80, 80, 255]);
        let map = segment(&buffer, 50, DEFAULT_COMPACTNESS);
        assert_invariants(&map, 50);
    }

    #[test]
    fn two_tone_image_separates_the_halves() {
        let image = RgbaImage::from_fn(40, 40, |x, _| {
            if x < 20 {
                image::Rgba([255, 0, 0, 255])
            } else {
                image::Rgba([0, 0, 255, 255])
            }
        });
        let buffer = lab_buffer(&image);
        let map = segment(&buffer, 8, DEFAULT_COMPACTNESS);
        assert_invariants(&map, 8);

        // No superpixel should straddle the color boundary: a region's
        // mean color must be close to one of the two input colors.
        let red = buffer.get(0, 0);
        let blue = buffer.get(39, 0);
        for region in map.regions() {
            let to_red = distance_squared(region.color, red);
            let to_blue = distance_squared(region.color, blue);
            assert!(
                to_red.min(to_blue) < 1.0,
                "region color {:?} sits between the input colors",
                region.color,
            );
        }
    }

    #[test]
    fn every_label_is_one_connected_component() {
        let image = RgbaImage::from_fn(30, 30, |x, y| {
            image::Rgba([(x * 8) as u8, (y * 8) as u8, 128, 255])
        });
        let map = segment(&lab_buffer(&image), 9, DEFAULT_COMPACTNESS);

        let width = map.width() as usize;
        let height = map.height() as usize;
        let mut visited = vec![false; map.labels().len()];
        let mut component_count = vec![0_usize; map.len()];
        for start in 0..map.labels().len() {
            if visited[start] {
                continue;
            }
            let label = map.labels()[start];
            component_count[label as usize] += 1;
            let mut stack = vec![start];
            visited[start] = true;
            while let Some(index) = stack.pop() {
                for neighbor in neighbors4(index, width, height) {
                    if !visited[neighbor] && map.labels()[neighbor] == label {
                        visited[neighbor] = true;
                        stack.push(neighbor);
                    }
                }
            }
        }
        for (label, &count) in component_count.iter().enumerate() {
            assert_eq!(count, 1, "label {label} split into {count} components");
        }
    }

    #[test]
    fn segmentation_is_deterministic() {
        let image = RgbaImage::from_fn(50, 50, |x, y| {
            image::Rgba([(x * 5) as u8, (y * 5) as u8, (x + y) as u8, 255])
        });
        let buffer = lab_buffer(&image);
        let first = segment(&buffer, 25, DEFAULT_COMPACTNESS);
        let second = segment(&buffer, 25, DEFAULT_COMPACTNESS);
        assert_eq!(first.labels(), second.labels());
        assert_eq!(first.regions(), second.regions());
    }
}
