//! Decompose a raster image into flat-color layers from the command
//! line: each surviving cluster is written out as an alpha-masked PNG,
//! together with a JSON manifest of per-layer statistics.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use stratify_pipeline::{
    ColorTarget, EdgeMode, ExtractMode, LabScale, Pipeline, PipelineError, keys, layer_stats,
};

/// Decompose a raster image into stacked flat-color layers.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Input image path (PNG, JPEG, BMP, WebP).
    input: PathBuf,

    /// Directory the layer PNGs and stats manifest are written into.
    #[arg(short, long, default_value = "layers")]
    output: PathBuf,

    /// Target superpixel count for segmentation.
    #[arg(long, default_value_t = 800)]
    superpixels: u32,

    /// Compactness weight: larger values favor square, regular
    /// superpixels; smaller values hug color boundaries.
    #[arg(long)]
    compactness: Option<f32>,

    /// Number of color clusters (one output layer each, before merging).
    #[arg(short, long, default_value_t = 6)]
    layers: u32,

    /// Seed for the clustering stage.
    #[arg(long)]
    seed: Option<u64>,

    /// Lightness scale applied after LAB conversion. Values below 1
    /// group by hue rather than brightness.
    #[arg(long, default_value_t = 0.65)]
    lightness: f32,

    /// Merge threshold in [0, 1]; may be given multiple times to chain
    /// progressively coarser merges.
    #[arg(long = "merge", value_name = "THRESHOLD")]
    merge: Vec<f64>,

    /// Color layers with the original pixels instead of the cluster
    /// mean color.
    #[arg(long)]
    source_pixels: bool,

    /// Soften layer mask edges for anti-aliased compositing.
    #[arg(long)]
    soft_edges: bool,

    /// Print the per-stage diagnostics report.
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn build_pipeline(&self) -> Result<Pipeline, PipelineError> {
        let mut pipeline = Pipeline::new().convert_color_space_scaled(
            ColorTarget::Lab,
            LabScale::new(self.lightness, 1.0, 1.0),
        )?;
        pipeline = match self.compactness {
            Some(compactness) => pipeline.segment_with(self.superpixels, compactness)?,
            None => pipeline.segment(self.superpixels)?,
        };
        pipeline = match self.seed {
            Some(seed) => pipeline.cluster_seeded(self.layers, seed)?,
            None => pipeline.cluster(self.layers)?,
        };
        for &threshold in &self.merge {
            pipeline = pipeline.auto_merge(threshold)?;
        }
        let mode = if self.source_pixels {
            ExtractMode::SourcePixels
        } else {
            ExtractMode::MeanColor
        };
        let edges = if self.soft_edges {
            EdgeMode::Soft
        } else {
            EdgeMode::Hard
        };
        pipeline.extract_layers_with(mode, edges)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = fs::read(&args.input)?;
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput.into());
    }
    let image = image::load_from_memory(&bytes)
        .map_err(PipelineError::ImageDecode)?
        .to_rgba8();

    let result = args.build_pipeline()?.execute(&image)?;
    let layers = result.layers().unwrap_or_default();

    fs::create_dir_all(&args.output)?;
    for (index, layer) in layers.iter().enumerate() {
        layer
            .image()
            .save(args.output.join(format!("layer-{index:02}.png")))?;
    }

    let stats = layer_stats(layers, image.width(), image.height());
    fs::write(
        args.output.join("stats.json"),
        serde_json::to_string_pretty(&stats)?,
    )?;

    let superpixels = result.metadata::<i64>(keys::SUPERPIXEL_COUNT).unwrap_or(0);
    let clusters = result.metadata::<i64>(keys::CLUSTER_COUNT).unwrap_or(0);
    println!(
        "{}: {superpixels} superpixels -> {clusters} clusters -> {} layers in {}",
        args.input.display(),
        layers.len(),
        args.output.display(),
    );
    if args.verbose {
        println!("{}", result.diagnostics().report());
    }
    Ok(())
}
