use candle_core::{Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use ndarray::prelude::*;
use ndarray::Axis;

pub mod config;
pub mod davis;
pub mod error;
pub mod modeling;
pub mod segmentation_io;
pub mod temporal_window;
pub mod video_tracker;

pub use config::{InputSize, TrackingConfig};
pub use error::{PropagationError, Result};
pub use modeling::affinity::{AffinityEngine, AffinityMatrix};
pub use modeling::feature_extractor::{FeatureExtractor, PixelPatchExtractor};
pub use modeling::label_projector::LabelProjector;
pub use modeling::neighborhood::{NeighborhoodMask, NeighborhoodMaskCache};
pub use segmentation_io::Palette;
pub use temporal_window::{ContextEntry, TemporalWindow};
pub use video_tracker::{FirstMask, FrameLoader, ImageLoader, TensorFrameLoader, VideoTracker};

pub const IMAGE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGE_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Resize, normalize and crop an image into a `[3, H, W]` tensor.
///
/// `H` and `W` are the resized height and width rounded down to a multiple
/// of `patch_size`.
pub fn preprocess_image(
    img: &DynamicImage,
    target_size: (u32, u32),
    means: &[f32; 3],
    stds: &[f32; 3],
    patch_size: usize,
    device: &Device,
) -> Result<Tensor> {
    // bilinear resize to (width, height)
    let resized_img = img.resize_exact(target_size.0, target_size.1, FilterType::Triangle);

    let rgb_img = resized_img.to_rgb8();

    let (width, height) = rgb_img.dimensions();
    let mut array = Array3::<f32>::zeros((3, height as usize, width as usize));

    for (x, y, pixel) in rgb_img.enumerate_pixels() {
        let r = pixel[0] as f32 / 255.0;
        let g = pixel[1] as f32 / 255.0;
        let b = pixel[2] as f32 / 255.0;

        array[[0, y as usize, x as usize]] = r;
        array[[1, y as usize, x as usize]] = g;
        array[[2, y as usize, x as usize]] = b;
    }

    for channel in 0..3 {
        let mut channel_view = array.index_axis_mut(Axis(0), channel);
        channel_view.mapv_inplace(|val| (val - means[channel]) / stds[channel]);
    }

    // make the image divisible by the patch size
    let patch_size = patch_size.max(1);
    let h = height as usize - height as usize % patch_size;
    let w = width as usize - width as usize % patch_size;
    if h == 0 || w == 0 {
        return Err(PropagationError::invalid_input(format!(
            "image of {width}x{height} is smaller than one {patch_size}px patch"
        )));
    }

    let data: Vec<f32> = array.slice(s![.., ..h, ..w]).iter().copied().collect();

    Ok(Tensor::from_vec(data, (3, h, w), device)?)
}
