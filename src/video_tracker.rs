use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::GenericImageView;
use ndarray::{s, Array2};
use tracing::{info, warn};

use crate::config::{InputSize, TrackingConfig};
use crate::error::{PropagationError, Result};
use crate::modeling::affinity::AffinityEngine;
use crate::modeling::feature_extractor::{extract_batched, FeatureExtractor};
use crate::modeling::interpolation::nearest_resize_labels;
use crate::modeling::label_projector::LabelProjector;
use crate::modeling::label_utils::{soft_label_to_classes, to_one_hot};
use crate::modeling::neighborhood::NeighborhoodMaskCache;
use crate::segmentation_io::{read_indexed_png, write_indexed_png, Palette};
use crate::temporal_window::{ContextEntry, TemporalWindow};
use crate::{preprocess_image, IMAGE_MEAN, IMAGE_STD};

/// Ground-truth segmentation of the first frame.
#[derive(Debug, Clone)]
pub struct FirstMask {
    /// `[1, num_classes, H / p, W / p]` one-hot label.
    pub soft_label: Tensor,
    /// `[H, W]` class ids at frame resolution, written out unchanged as frame 0.
    pub labels: Array2<u8>,
    /// Palette stored in the mask file, if any.
    pub palette: Option<Palette>,
}

impl FirstMask {
    /// Build from a class map already at frame resolution.
    ///
    /// The map is cropped to a multiple of `patch_size` and downsampled
    /// (nearest) to the patch grid before one-hot encoding. The class count is
    /// taken from the full-resolution map so that thin objects lost by the
    /// downsampling still get a channel.
    pub fn from_labels(labels: Array2<u8>, patch_size: usize, device: &Device) -> Result<Self> {
        if patch_size == 0 {
            return Err(PropagationError::invalid_config("patch_size", "must be >= 1"));
        }
        let (h, w) = labels.dim();
        let (ch, cw) = (h - h % patch_size, w - w % patch_size);
        if ch == 0 || cw == 0 {
            return Err(PropagationError::invalid_input(format!(
                "mask of {h}x{w} is smaller than one {patch_size}px patch"
            )));
        }
        let labels = labels.slice(s![..ch, ..cw]).to_owned();
        let num_classes = labels.iter().copied().max().unwrap_or(0) as usize + 1;

        let small = nearest_resize_labels(&labels, ch / patch_size, cw / patch_size);
        let mut present = [false; 256];
        small.iter().for_each(|&c| present[c as usize] = true);
        let lost = (0..num_classes).filter(|&c| !present[c]).count();
        if lost > 0 {
            warn!(lost, num_classes, patch_size, "classes vanish when the first mask is downsampled");
        }
        let soft_label = to_one_hot(&small, Some(num_classes), device)?;

        Ok(Self {
            soft_label,
            labels,
            palette: None,
        })
    }

    pub fn num_classes(&self) -> Result<usize> {
        Ok(self.soft_label.dim(1)?)
    }
}

/// Load the first-frame mask, resized (nearest) the same way frames are.
pub fn read_seg(
    path: &Path,
    input_size: InputSize,
    patch_size: usize,
    device: &Device,
) -> Result<FirstMask> {
    let indexed = read_indexed_png(path)?;
    let (h, w) = indexed.labels.dim();
    let (tw, th) = input_size.resized_dims(w as u32, h as u32);
    let resized = nearest_resize_labels(&indexed.labels, th as usize, tw as usize);

    let mut mask = FirstMask::from_labels(resized, patch_size, device)?;
    mask.palette = indexed.palette;
    Ok(mask)
}

pub trait FrameLoader {
    fn get_frame(&self, index: usize, device: &Device) -> Result<Tensor>;
    fn total_frames(&self) -> usize;
    /// File name of the mask written for frame `index`.
    fn output_name(&self, index: usize) -> Result<String>;
}

/// Frames of one video read from a directory of JPEGs, in lexicographic order.
pub struct ImageLoader {
    image_paths: Vec<PathBuf>,
    base_dimensions: (u32, u32),
    input_size: InputSize,
    patch_size: usize,
}

impl ImageLoader {
    pub fn new<P: AsRef<Path>>(
        folder_path: P,
        input_size: InputSize,
        patch_size: usize,
    ) -> Result<Self> {
        let folder_path = folder_path.as_ref();
        let mut image_paths = Vec::new();
        let supported_extensions = ["jpg", "jpeg"];

        let entries = std::fs::read_dir(folder_path)
            .map_err(|source| PropagationError::io(folder_path, source))?;

        for entry in entries {
            let entry = entry.map_err(|source| PropagationError::io(folder_path, source))?;
            let path = entry.path();

            if path.is_file() {
                if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                    let ext = ext.to_lowercase();
                    if supported_extensions.contains(&ext.as_str()) {
                        image_paths.push(path);
                    }
                }
            }
        }

        if image_paths.is_empty() {
            return Err(PropagationError::invalid_input(format!(
                "no jpeg frames found in {}",
                folder_path.display()
            )));
        }

        image_paths.sort();

        // frames must share the first frame's size
        let first_img = image::open(&image_paths[0]).map_err(|source| PropagationError::Image {
            path: image_paths[0].clone(),
            source,
        })?;
        let base_dimensions = first_img.dimensions();

        Ok(Self {
            image_paths,
            base_dimensions,
            input_size,
            patch_size,
        })
    }

    pub fn len(&self) -> usize {
        self.image_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_paths.is_empty()
    }

    pub fn frame_path(&self, index: usize) -> Option<&Path> {
        self.image_paths.get(index).map(PathBuf::as_path)
    }
}

impl FrameLoader for ImageLoader {
    fn get_frame(&self, index: usize, device: &Device) -> Result<Tensor> {
        let path = self.frame_path(index).ok_or_else(|| {
            PropagationError::invalid_input(format!(
                "frame index {index} out of bounds (total: {})",
                self.len()
            ))
        })?;

        let img = image::open(path).map_err(|source| PropagationError::Image {
            path: path.to_path_buf(),
            source,
        })?;

        let current_dims = img.dimensions();
        if current_dims != self.base_dimensions {
            return Err(PropagationError::invalid_input(format!(
                "{}: frame size {:?} does not match first frame {:?}",
                path.display(),
                current_dims,
                self.base_dimensions
            )));
        }

        let target = self.input_size.resized_dims(current_dims.0, current_dims.1);
        preprocess_image(&img, target, &IMAGE_MEAN, &IMAGE_STD, self.patch_size, device)
    }

    fn total_frames(&self) -> usize {
        self.len()
    }

    fn output_name(&self, index: usize) -> Result<String> {
        let stem = self
            .frame_path(index)
            .and_then(|p| p.file_stem())
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                PropagationError::invalid_input(format!("no file name for frame {index}"))
            })?;
        Ok(format!("{stem}.png"))
    }
}

/// Frames already decoded into a `[num_frames, channels, H, W]` tensor.
pub struct TensorFrameLoader {
    frames: Tensor,
}

impl TensorFrameLoader {
    pub fn new(frames: Tensor) -> Result<Self> {
        frames.dims4()?;
        Ok(Self { frames })
    }

    /// Read the `images` tensor of a safetensors file.
    pub fn from_safetensors<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path.as_ref(), device)?;
        let frames = tensors.remove("images").ok_or_else(|| {
            PropagationError::invalid_input(format!(
                "{}: missing `images` tensor",
                path.as_ref().display()
            ))
        })?;
        Self::new(frames)
    }
}

impl FrameLoader for TensorFrameLoader {
    fn get_frame(&self, index: usize, device: &Device) -> Result<Tensor> {
        if index >= self.total_frames() {
            return Err(PropagationError::invalid_input(format!(
                "frame index {index} out of bounds (total: {})",
                self.total_frames()
            )));
        }
        Ok(self.frames.get(index)?.to_device(device)?)
    }

    fn total_frames(&self) -> usize {
        self.frames.dims().first().copied().unwrap_or(0)
    }

    fn output_name(&self, index: usize) -> Result<String> {
        Ok(format!("{index:05}.png"))
    }
}

#[derive(Debug, Clone)]
pub struct VideoSummary {
    pub frames_written: usize,
    pub output_dir: PathBuf,
}

/// Propagates a first-frame segmentation through a video.
///
/// Per video: write frame 0's mask, then for every later frame propagate
/// labels from the first frame and the `n_last_frames` previous frames,
/// write the rasterized result and slide the window. The neighborhood mask
/// cache outlives videos, so videos sharing a grid size share the mask.
pub struct VideoTracker<E: FeatureExtractor> {
    extractor: E,
    config: TrackingConfig,
    engine: AffinityEngine,
    projector: LabelProjector,
    mask_cache: NeighborhoodMaskCache,
    device: Device,
}

impl<E: FeatureExtractor> VideoTracker<E> {
    pub fn new(extractor: E, config: TrackingConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        if extractor.patch_size() != config.patch_size {
            return Err(PropagationError::invalid_config(
                "patch_size",
                format!(
                    "{} does not match the backbone patch stride {}",
                    config.patch_size,
                    extractor.patch_size()
                ),
            ));
        }
        let engine = AffinityEngine::from_config(&config)?;

        Ok(Self {
            extractor,
            config,
            engine,
            projector: LabelProjector::new(),
            mask_cache: NeighborhoodMaskCache::new(device),
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    /// Soft label `[1, num_classes, h, w]` of `target` given the window's context frames.
    pub fn propagate(
        &mut self,
        target: &Tensor,
        window: &TemporalWindow<ContextEntry>,
    ) -> Result<Tensor> {
        let mut frames: Vec<&Tensor> = Vec::with_capacity(1 + window.context_len());
        frames.push(target);
        frames.extend(window.context().map(|entry| &entry.frame));

        let mut features = extract_batched(&self.extractor, &frames, self.config.batch_size)?;
        let feat_tar = features.remove(0);
        let (_, h, w) = feat_tar.dims3()?;

        let mask = self
            .mask_cache
            .get_or_build(h, w, self.config.size_mask_neighborhood)?;
        let affinity = self.engine.compute(&feat_tar, &features, &mask)?;

        let labels: Vec<&Tensor> = window.context().map(|entry| &entry.label).collect();
        self.projector.project(&affinity, &labels)
    }

    pub fn track_video<L: FrameLoader + ?Sized>(
        &mut self,
        frames: &L,
        first_mask: &FirstMask,
        palette: &Palette,
        output_dir: &Path,
    ) -> Result<VideoSummary> {
        let num_frames = frames.total_frames();
        if num_frames == 0 {
            return Err(PropagationError::invalid_input("video has no frames"));
        }
        std::fs::create_dir_all(output_dir)
            .map_err(|source| PropagationError::io(output_dir, source))?;

        let frame0 = frames.get_frame(0, &self.device)?;
        let (_, fh, fw) = frame0.dims3()?;
        if first_mask.labels.dim() != (fh, fw) {
            return Err(PropagationError::invalid_input(format!(
                "first mask is {:?} but frame 0 is {}x{}",
                first_mask.labels.dim(),
                fh,
                fw
            )));
        }
        write_indexed_png(
            &output_dir.join(frames.output_name(0)?),
            &first_mask.labels,
            palette,
        )?;

        let mut window = TemporalWindow::new(
            ContextEntry::new(frame0, first_mask.soft_label.clone()),
            self.config.n_last_frames,
        );

        for idx in 1..num_frames {
            let frame_tar = frames.get_frame(idx, &self.device)?;
            let seg = self.propagate(&frame_tar, &window)?;

            window.push(ContextEntry::new(frame_tar, seg.clone()));

            let classes = soft_label_to_classes(&seg, self.config.patch_size)?;
            let name = frames.output_name(idx)?;
            write_indexed_png(&output_dir.join(&name), &classes, palette)?;
            info!(
                "[{}/{}] propagated {} (context {})",
                idx,
                num_frames - 1,
                name,
                window.context_len()
            );
        }

        info!(
            frames = num_frames,
            output = %output_dir.display(),
            "video done"
        );
        Ok(VideoSummary {
            frames_written: num_frames,
            output_dir: output_dir.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modeling::feature_extractor::PixelPatchExtractor;
    use ndarray::array;

    #[test]
    fn test_patch_size_must_match_backbone() {
        let extractor = PixelPatchExtractor::rgb(8).unwrap();
        let res = VideoTracker::new(extractor, TrackingConfig::default(), &Device::Cpu);
        assert!(matches!(
            res,
            Err(PropagationError::InvalidConfiguration { field: "patch_size", .. })
        ));
    }

    #[test]
    fn test_zero_topk_fails_before_tracking() {
        let extractor = PixelPatchExtractor::rgb(16).unwrap();
        let config = TrackingConfig {
            topk: 0,
            ..Default::default()
        };
        assert!(matches!(
            VideoTracker::new(extractor, config, &Device::Cpu),
            Err(PropagationError::InvalidConfiguration { field: "topk", .. })
        ));
    }

    #[test]
    fn test_first_mask_crops_and_downsamples() {
        let labels = Array2::from_shape_fn((5, 7), |(y, x)| if x >= 4 && y < 2 { 2 } else { 0 });
        let mask = FirstMask::from_labels(labels, 2, &Device::Cpu).unwrap();
        assert_eq!(mask.labels.dim(), (4, 6));
        assert_eq!(mask.soft_label.dims(), &[1, 3, 2, 3]);
        assert_eq!(mask.num_classes().unwrap(), 3);
        let class2 = mask.soft_label.get(0).unwrap().get(2).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(class2, vec![vec![0.0, 0.0, 1.0], vec![0.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_first_mask_smaller_than_patch() {
        let res = FirstMask::from_labels(array![[1u8]], 4, &Device::Cpu);
        assert!(matches!(res, Err(PropagationError::InvalidInput(_))));
    }

    #[test]
    fn test_tensor_loader_bounds_and_names() {
        let frames = Tensor::zeros((2, 3, 4, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let loader = TensorFrameLoader::new(frames).unwrap();
        assert_eq!(loader.total_frames(), 2);
        assert_eq!(loader.get_frame(1, &Device::Cpu).unwrap().dims(), &[3, 4, 4]);
        assert!(loader.get_frame(2, &Device::Cpu).is_err());
        assert_eq!(loader.output_name(1).unwrap(), "00001.png");
    }
}
