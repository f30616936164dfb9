//! Greedy agglomerative merging of adjacent clusters.
//!
//! Builds an adjacency graph over the current cluster assignment (two
//! clusters are adjacent when any of their pixels share a boundary),
//! then repeatedly merges the closest adjacent pair while that
//! distance stays below the threshold. Greedy, not globally optimal:
//! the merge order matters when distances tie, so ties break on the
//! lowest id pair rather than on the iteration order of the graph.

use std::cmp::Ordering;

use petgraph::graphmap::UnGraphMap;

use crate::cluster::ClusterAssignment;
use crate::color::{distance_divisor, distance_squared};
use crate::segment::SuperpixelMap;

/// Merge adjacent clusters whose normalized color distance falls below
/// `threshold`, returning the reduced assignment.
///
/// Distances are Euclidean in the map's color space, scaled into
/// `[0, 1]` by the largest distance the space admits. At `threshold`
/// 0 nothing merges; at 1 every adjacency chain collapses. The
/// smaller-indexed cluster of each merged pair is absorbed into the
/// larger, whose mean is recomputed as the population-weighted mean;
/// surviving ids compact back to a contiguous range afterwards.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn auto_merge(
    map: &SuperpixelMap,
    assignment: &ClusterAssignment,
    threshold: f32,
) -> ClusterAssignment {
    let k = assignment.len();
    if k <= 1 {
        return assignment.clone();
    }

    let divisor = distance_divisor(map.color_space());
    let mut means: Vec<[f32; 3]> = assignment.means().to_vec();
    let mut populations: Vec<u64> = assignment.populations().to_vec();
    let mut parent: Vec<u32> = (0..k as u32).collect();

    let mut graph = adjacency(map, assignment);

    loop {
        let Some((distance, low, high)) = closest_pair(&graph, &means, divisor) else {
            break;
        };
        if distance >= threshold {
            break;
        }

        // Absorb the smaller id into the larger.
        let merged_population = populations[low as usize] + populations[high as usize];
        let weight = |id: u32| populations[id as usize] as f64 / merged_population.max(1) as f64;
        let (wl, wh) = (weight(low), weight(high));
        let (ml, mh) = (means[low as usize], means[high as usize]);
        let merged_mean = [
            f64::from(ml[0]).mul_add(wl, f64::from(mh[0]) * wh) as f32,
            f64::from(ml[1]).mul_add(wl, f64::from(mh[1]) * wh) as f32,
            f64::from(ml[2]).mul_add(wl, f64::from(mh[2]) * wh) as f32,
        ];
        means[high as usize] = merged_mean;
        populations[high as usize] = merged_population;
        parent[low as usize] = high;

        // Rewire the absorbed cluster's adjacencies, then drop it.
        let neighbors: Vec<u32> = graph.neighbors(low).filter(|&n| n != high).collect();
        graph.remove_node(low);
        for neighbor in neighbors {
            graph.add_edge(high, neighbor, ());
        }
    }

    compact(assignment, &parent, &means, &populations)
}

/// Build the cluster adjacency graph from the pixel grid.
fn adjacency(map: &SuperpixelMap, assignment: &ClusterAssignment) -> UnGraphMap<u32, ()> {
    let mut graph = UnGraphMap::new();
    #[allow(clippy::cast_possible_truncation)]
    for id in 0..assignment.len() as u32 {
        graph.add_node(id);
    }

    let width = map.width() as usize;
    let labels = map.labels();
    for (index, &label) in labels.iter().enumerate() {
        let here = assignment.cluster_of(label);
        if (index + 1) % width != 0 {
            let right = assignment.cluster_of(labels[index + 1]);
            if right != here {
                graph.add_edge(here, right, ());
            }
        }
        if index + width < labels.len() {
            let below = assignment.cluster_of(labels[index + width]);
            if below != here {
                graph.add_edge(here, below, ());
            }
        }
    }
    graph
}

/// The adjacent pair with the smallest normalized distance; ties go to
/// the lowest id pair.
fn closest_pair(
    graph: &UnGraphMap<u32, ()>,
    means: &[[f32; 3]],
    divisor: f32,
) -> Option<(f32, u32, u32)> {
    let mut best: Option<(f32, u32, u32)> = None;
    for (a, b, _) in graph.all_edges() {
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let distance =
            distance_squared(means[low as usize], means[high as usize]).sqrt() / divisor;
        let replace = best.is_none_or(|(bd, bl, bh)| match distance.total_cmp(&bd) {
            Ordering::Less => true,
            Ordering::Equal => (low, high) < (bl, bh),
            Ordering::Greater => false,
        });
        if replace {
            best = Some((distance, low, high));
        }
    }
    best
}

/// Resolve merge chains and relabel survivors contiguously.
#[allow(clippy::cast_possible_truncation)]
fn compact(
    assignment: &ClusterAssignment,
    parent: &[u32],
    means: &[[f32; 3]],
    populations: &[u64],
) -> ClusterAssignment {
    let find = |mut id: u32| {
        while parent[id as usize] != id {
            id = parent[id as usize];
        }
        id
    };

    let mut remap = vec![u32::MAX; parent.len()];
    let mut surviving_means = Vec::new();
    let mut surviving_populations = Vec::new();
    for (id, &p) in parent.iter().enumerate() {
        if p == id as u32 {
            remap[id] = surviving_means.len() as u32;
            surviving_means.push(means[id]);
            surviving_populations.push(populations[id]);
        }
    }

    let clusters = assignment
        .clusters()
        .iter()
        .map(|&old| remap[find(old) as usize])
        .collect();

    ClusterAssignment::from_parts(clusters, surviving_means, surviving_populations)
}
