//! DAVIS-2017 layout driver.
//!
//! ```text
//! <root>/ImageSets/2017/val.txt           one video name per line
//! <root>/JPEGImages/480p/<video>/*.jpg    frames
//! <root>/Annotations/480p/<video>/*.png   indexed masks, first one used
//! ```
//!
//! Results land in `<output_dir>/<video>/`, one indexed PNG per frame.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{PropagationError, Result};
use crate::modeling::feature_extractor::FeatureExtractor;
use crate::segmentation_io::Palette;
use crate::video_tracker::{read_seg, ImageLoader, VideoSummary, VideoTracker};

const DEFAULT_SPLIT: &str = "ImageSets/2017/val.txt";
const DEFAULT_RESOLUTION: &str = "480p";

#[derive(Debug, Clone)]
pub struct DavisDataset {
    root: PathBuf,
    split: PathBuf,
    resolution: String,
}

impl DavisDataset {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            split: PathBuf::from(DEFAULT_SPLIT),
            resolution: DEFAULT_RESOLUTION.to_string(),
        }
    }

    /// Use another split file, relative to the dataset root.
    pub fn with_split<P: AsRef<Path>>(mut self, split: P) -> Self {
        self.split = split.as_ref().to_path_buf();
        self
    }

    pub fn video_names(&self) -> Result<Vec<String>> {
        let path = self.root.join(&self.split);
        let contents =
            std::fs::read_to_string(&path).map_err(|source| PropagationError::io(&path, source))?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn frames_dir(&self, video: &str) -> PathBuf {
        self.root
            .join("JPEGImages")
            .join(&self.resolution)
            .join(video)
    }

    /// Annotation matching the first frame of `frames`.
    pub fn first_annotation(&self, video: &str, frames: &ImageLoader) -> Result<PathBuf> {
        let stem = frames
            .frame_path(0)
            .and_then(|p| p.file_stem())
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                PropagationError::invalid_input(format!("video {video} has no first frame"))
            })?;
        Ok(self
            .root
            .join("Annotations")
            .join(&self.resolution)
            .join(video)
            .join(format!("{stem}.png")))
    }
}

/// Track every video of the split, in order. The first failing video aborts the run.
///
/// Output masks use `palette` when given, otherwise the first mask's own
/// palette, otherwise the DAVIS palette.
pub fn evaluate_davis<E: FeatureExtractor>(
    tracker: &mut VideoTracker<E>,
    dataset: &DavisDataset,
    output_dir: &Path,
    palette: Option<&Palette>,
) -> Result<Vec<VideoSummary>> {
    let videos = dataset.video_names()?;
    let mut summaries = Vec::with_capacity(videos.len());
    let (input_size, patch_size) = (tracker.config().input_size, tracker.config().patch_size);

    for (i, video) in videos.iter().enumerate() {
        info!("[{}/{}] Begin to segment video {}.", i, videos.len(), video);

        let frames = ImageLoader::new(dataset.frames_dir(video), input_size, patch_size)?;
        let seg_path = dataset.first_annotation(video, &frames)?;
        let first_mask = read_seg(&seg_path, input_size, patch_size, tracker.device())?;

        let video_palette = match (palette, first_mask.palette.as_ref()) {
            (Some(p), _) => p.clone(),
            (None, Some(p)) => p.clone(),
            (None, None) => Palette::davis(),
        };

        let summary = tracker.track_video(
            &frames,
            &first_mask,
            &video_palette,
            &output_dir.join(video),
        )?;
        summaries.push(summary);
    }

    Ok(summaries)
}
