//! Pipeline diagnostics: timing, counts, and other metrics per stage.
//!
//! These diagnostics are permanent instrumentation intended for
//! algorithm tuning and parameter experimentation; every execution
//! collects them alongside the pipeline result.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single execution.
///
/// Resumed executions only record the stages they actually ran; the
/// shared prefix was timed by the execution that produced the prior
/// result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// One entry per executed stage, in execution order.
    pub stages: Vec<StageDiagnostics>,
    /// Total wall-clock duration of the executed stages (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

/// Diagnostics for a single executed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Stage name as it appears on the builder surface.
    pub name: String,
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Source registration metrics.
    Input {
        /// Source width in pixels.
        width: u32,
        /// Source height in pixels.
        height: u32,
        /// Total pixel count.
        pixel_count: u64,
    },
    /// Color space conversion metrics.
    Convert {
        /// The per-axis scale applied after conversion.
        scale: [f32; 3],
    },
    /// Superpixel segmentation metrics.
    Segment {
        /// Requested superpixel count.
        requested: u32,
        /// Achieved superpixel count.
        achieved: u32,
        /// Compactness weight used.
        compactness: f32,
    },
    /// Clustering metrics.
    Cluster {
        /// Requested cluster count.
        requested: u32,
        /// Achieved cluster count (clamped for degenerate inputs).
        achieved: u32,
        /// Seed the generator was initialized with.
        seed: u64,
    },
    /// Merge metrics.
    Merge {
        /// Similarity threshold applied.
        threshold: f32,
        /// Cluster count going in.
        clusters_before: u32,
        /// Cluster count coming out.
        clusters_after: u32,
    },
    /// Layer extraction metrics.
    Extract {
        /// Extraction mode used.
        mode: String,
        /// Number of layers produced.
        layer_count: usize,
    },
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<20} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(76));

        let total_ms = duration_ms(self.total_duration);
        for stage in &self.stages {
            let ms = duration_ms(stage.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&stage.metrics);
            lines.push(format!(
                "{:<20} {ms:>8.3}ms {pct:>9.1}%  {details}",
                stage.name,
            ));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Input {
            width,
            height,
            pixel_count,
        } => format!("{width}x{height} ({pixel_count} pixels)"),
        StageMetrics::Convert { scale } => {
            format!("lab scale=({:.2}, {:.2}, {:.2})", scale[0], scale[1], scale[2])
        }
        StageMetrics::Segment {
            requested,
            achieved,
            compactness,
        } => format!("{requested} requested -> {achieved} achieved (C={compactness:.1})"),
        StageMetrics::Cluster {
            requested,
            achieved,
            seed,
        } => format!("{requested} requested -> {achieved} achieved (seed={seed})"),
        StageMetrics::Merge {
            threshold,
            clusters_before,
            clusters_after,
        } => format!("T={threshold:.2} {clusters_before}->{clusters_after} clusters"),
        StageMetrics::Extract { mode, layer_count } => {
            format!("{mode}, {layer_count} layers")
        }
    }
}
