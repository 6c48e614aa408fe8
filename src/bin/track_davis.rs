//! `track_davis`: propagate first-frame DAVIS annotations through every video of a split.
//!
//! ```bash
//! cargo run --release --bin track_davis -- --data-path /path/to/davis --output-dir out
//! cargo run --release --bin track_davis -- --data-path /path/to/davis --config tracking.json
//! ```
//!
//! The binary embeds patches with [`PixelPatchExtractor`]; a learned backbone
//! is plugged in through the library's `FeatureExtractor` trait.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::Device;
use clap::Parser;
use tracing::info;

use labelprop::davis::{evaluate_davis, DavisDataset};
use labelprop::{InputSize, Palette, PixelPatchExtractor, TrackingConfig, VideoTracker};

#[derive(Parser, Debug)]
#[command(
    name = "track_davis",
    version,
    about = "Video object segmentation by label propagation on DAVIS 2017",
    long_about = None
)]
struct Args {
    /// DAVIS root containing ImageSets/, JPEGImages/ and Annotations/.
    #[arg(long, value_name = "DIR")]
    data_path: PathBuf,

    /// Where to save segmentations.
    #[arg(long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// JSON tracking configuration; flags below override it.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Split file relative to the data path.
    #[arg(long, default_value = "ImageSets/2017/val.txt")]
    split: PathBuf,

    /// Number of preceding frames.
    #[arg(long)]
    n_last_frames: Option<usize>,

    /// Restrict source patches to this box radius around the query patch (0 disables).
    #[arg(long)]
    size_mask_neighborhood: Option<usize>,

    /// Accumulate labels from the top k neighbours.
    #[arg(long)]
    topk: Option<usize>,

    /// Feature extraction batch size; reduce if memory runs out.
    #[arg(long = "bs")]
    batch_size: Option<usize>,

    /// Shorter image side, or `WIDTH HEIGHT`.
    #[arg(long, num_args = 1..=2)]
    input_size: Option<Vec<u32>>,

    /// Patch resolution of the model.
    #[arg(long)]
    patch_size: Option<usize>,

    /// Palette file (`r g b` per line) for the output masks.
    #[arg(long, value_name = "FILE")]
    palette: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .init();

    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            TrackingConfig::from_json(path)
                .with_context(|| format!("loading {}", path.display()))?
        }
        None => TrackingConfig::default(),
    };

    if let Some(v) = args.n_last_frames {
        config.n_last_frames = v;
    }
    if let Some(v) = args.size_mask_neighborhood {
        config.size_mask_neighborhood = v;
    }
    if let Some(v) = args.topk {
        config.topk = v;
    }
    if let Some(v) = args.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = args.patch_size {
        config.patch_size = v;
    }
    if let Some(size) = args.input_size.as_deref() {
        config.input_size = match size {
            &[side] => InputSize::ShorterSide(side),
            &[w, h] => InputSize::Exact(w, h),
            _ => anyhow::bail!("--input-size takes one or two values"),
        };
    }
    config.validate().context("invalid tracking configuration")?;
    info!("{:#?}", config);

    let palette = args
        .palette
        .as_deref()
        .map(Palette::from_text_file)
        .transpose()
        .context("loading palette")?;

    let device = Device::cuda_if_available(0)?;
    let extractor = PixelPatchExtractor::rgb(config.patch_size)?;
    let mut tracker = VideoTracker::new(extractor, config, &device)?;

    let dataset = DavisDataset::new(&args.data_path).with_split(&args.split);
    let summaries = evaluate_davis(&mut tracker, &dataset, &args.output_dir, palette.as_ref())?;

    let frames: usize = summaries.iter().map(|s| s.frames_written).sum();
    info!("Segmented {} videos, {} frames", summaries.len(), frames);
    Ok(())
}
