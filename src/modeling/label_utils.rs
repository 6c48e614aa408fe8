use candle_core::{DType, Device, Tensor};
use ndarray::Array2;

use crate::error::{PropagationError, Result};
use crate::modeling::interpolation::upsample_bilinear;

/// Largest class count a `u8` label map can address.
pub const MAX_CLASSES: usize = 256;

/// One-hot encode a `[h, w]` class map into a `[1, num_classes, h, w]` soft label.
///
/// With `num_classes == None` the count is inferred as `max(labels) + 1`.
pub fn to_one_hot(labels: &Array2<u8>, num_classes: Option<usize>, device: &Device) -> Result<Tensor> {
    let (h, w) = labels.dim();
    let max_label = labels.iter().copied().max().unwrap_or(0) as usize;
    let num_classes = num_classes.unwrap_or(max_label + 1);
    if num_classes == 0 || num_classes > MAX_CLASSES {
        return Err(PropagationError::invalid_input(format!(
            "number of classes must be in 1..={MAX_CLASSES}, got {num_classes}"
        )));
    }
    if max_label >= num_classes {
        return Err(PropagationError::invalid_input(format!(
            "label {max_label} out of range for {num_classes} classes"
        )));
    }

    let hw = h * w;
    let mut data = vec![0f32; num_classes * hw];
    for (idx, &class) in labels.iter().enumerate() {
        data[class as usize * hw + idx] = 1.0;
    }
    Ok(Tensor::from_vec(data, (1, num_classes, h, w), device)?)
}

/// Per-channel min-max normalization of a `[C, H, W]` tensor.
///
/// Channels whose maximum is not positive are left untouched.
pub fn norm_mask(mask: &Tensor) -> Result<Tensor> {
    let (c, h, w) = mask.dims3()?;
    let mut data = mask.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let hw = h * w;

    for channel in data.chunks_mut(hw.max(1)).take(c) {
        let max = channel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if max > 0.0 {
            let min = channel.iter().copied().fold(f32::INFINITY, f32::min);
            channel.iter_mut().for_each(|v| *v -= min);
            let range = max - min;
            if range > 0.0 {
                channel.iter_mut().for_each(|v| *v /= range);
            }
        }
    }

    Ok(Tensor::from_vec(data, (c, h, w), mask.device())?)
}

/// Index of the largest channel at every pixel of a `[C, H, W]` tensor.
///
/// Ties resolve to the lowest channel index.
pub fn argmax_classes(mask: &Tensor) -> Result<Array2<u8>> {
    let (c, h, w) = mask.dims3()?;
    if c == 0 || c > MAX_CLASSES {
        return Err(PropagationError::invalid_input(format!(
            "cannot decode {c} channels into a u8 class map"
        )));
    }
    let data = mask.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let hw = h * w;

    Ok(Array2::from_shape_fn((h, w), |(y, x)| {
        let px = y * w + x;
        let mut best = 0usize;
        for ch in 1..c {
            if data[ch * hw + px] > data[best * hw + px] {
                best = ch;
            }
        }
        best as u8
    }))
}

/// Rasterize a feature-resolution `[1, C, h, w]` soft label into a full-resolution class map.
///
/// Upsamples by `patch_size` (bilinear), min-max normalizes every channel and
/// takes the per-pixel argmax.
pub fn soft_label_to_classes(soft_label: &Tensor, patch_size: usize) -> Result<Array2<u8>> {
    let upsampled = upsample_bilinear(soft_label, patch_size)?;
    let normed = norm_mask(&upsampled.squeeze(0)?)?;
    argmax_classes(&normed)
}
