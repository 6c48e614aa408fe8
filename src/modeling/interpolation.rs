//! Resizing for feature maps and label maps.
//!
//! [`bilinear_interpolate`] matches `F.interpolate(mode="bilinear",
//! align_corners=False)`: output pixel centres are mapped back onto the input
//! grid and sampling coordinates are clamped at the border.

use candle_core::{DType, Device, Tensor};
use ndarray::{Array2, Array4};

use crate::error::{PropagationError, Result};

pub fn bilinear_interpolate_tensor(
    input: &Tensor, // Tensor shape [batch, channel, height, width]
    output_h: usize,
    output_w: usize,
) -> Result<Tensor> {
    let (batch, channels, in_h, in_w) = input.dims4().map_err(|_| {
        PropagationError::invalid_input(format!(
            "bilinear interpolation expects a 4-D tensor, got {:?}",
            input.dims()
        ))
    })?;

    let input_array = tensor_to_array4(input)?;
    debug_assert_eq!(input_array.dim(), (batch, channels, in_h, in_w));

    let output_array = bilinear_interpolate(&input_array, output_h, output_w);

    // iter() walks standard layout, matching the row-major tensor order
    let data: Vec<f32> = output_array.iter().copied().collect();
    let output_tensor = Tensor::from_vec(
        data,
        (batch, channels, output_h, output_w),
        input.device(),
    )?;

    Ok(output_tensor)
}

/// Upsample a `[batch, channel, h, w]` tensor by an integer factor.
pub fn upsample_bilinear(input: &Tensor, scale_factor: usize) -> Result<Tensor> {
    let (_, _, h, w) = input.dims4()?;
    if scale_factor == 1 {
        return Ok(input.clone());
    }
    bilinear_interpolate_tensor(input, h * scale_factor, w * scale_factor)
}

pub fn bilinear_interpolate(
    input: &Array4<f32>, // shape [batch, channel, height, width]
    output_h: usize,
    output_w: usize,
) -> Array4<f32> {
    let (batch, channels, in_h, in_w) = input.dim();
    let mut output = Array4::<f32>::zeros((batch, channels, output_h, output_w));
    if in_h == 0 || in_w == 0 {
        return output;
    }
    let scale_h = in_h as f32 / output_h as f32;
    let scale_w = in_w as f32 / output_w as f32;
    output.indexed_iter_mut().for_each(|((b, c, y, x), val)| {
        // input coords (align_corners=False)
        let y_in = (y as f32 + 0.5) * scale_h - 0.5;
        let x_in = (x as f32 + 0.5) * scale_w - 0.5;
        // bound
        let y_in = y_in.clamp(0.0, (in_h - 1) as f32);
        let x_in = x_in.clamp(0.0, (in_w - 1) as f32);

        let y0 = y_in.floor() as usize;
        let x0 = x_in.floor() as usize;
        let y1 = (y0 + 1).min(in_h - 1);
        let x1 = (x0 + 1).min(in_w - 1);
        // interpolation weight
        let dy = y_in - y0 as f32;
        let dx = x_in - x0 as f32;

        let f00 = input[[b, c, y0, x0]];
        let f01 = input[[b, c, y0, x1]];
        let f10 = input[[b, c, y1, x0]];
        let f11 = input[[b, c, y1, x1]];

        *val = (1.0 - dx) * (1.0 - dy) * f00
            + dx * (1.0 - dy) * f01
            + (1.0 - dx) * dy * f10
            + dx * dy * f11;
    });
    output
}

/// Nearest-neighbour resize of a discrete label map (`mode="nearest"`).
///
/// Output pixel `(y, x)` samples input `(floor(y * in_h / out_h), floor(x * in_w / out_w))`,
/// so an integer downsampling by `p` keeps the top-left pixel of every `p x p` block.
pub fn nearest_resize_labels(input: &Array2<u8>, output_h: usize, output_w: usize) -> Array2<u8> {
    let (in_h, in_w) = input.dim();
    if in_h == 0 || in_w == 0 {
        return Array2::zeros((output_h, output_w));
    }
    Array2::from_shape_fn((output_h, output_w), |(y, x)| {
        let src_y = ((y * in_h) / output_h).min(in_h - 1);
        let src_x = ((x * in_w) / output_w).min(in_w - 1);
        input[[src_y, src_x]]
    })
}

fn tensor_to_array4(t: &Tensor) -> Result<Array4<f32>> {
    let t = t.to_device(&Device::Cpu)?;

    let t = t.contiguous()?;

    let t = match t.dtype() {
        DType::F32 => t,
        DType::F64 | DType::F16 | DType::BF16 | DType::U8 | DType::U32 => t.to_dtype(DType::F32)?,
        dt => {
            return Err(PropagationError::invalid_input(format!(
                "unsupported dtype {:?}",
                dt
            )))
        }
    };

    let shape = t.dims4()?;
    let data = t.flatten_all()?.to_vec1::<f32>()?;

    Array4::from_shape_vec(shape, data).map_err(|e| {
        PropagationError::invalid_input(format!("failed to convert tensor to Array4<f32>: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_bilinear_identity_at_same_size() {
        let input = Array4::from_shape_fn((1, 2, 3, 3), |(_, c, y, x)| (c * 9 + y * 3 + x) as f32);
        let out = bilinear_interpolate(&input, 3, 3);
        for (a, b) in out.iter().zip(input.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_bilinear_upsample_constant_stays_constant() {
        let input = Array4::from_elem((1, 1, 2, 2), 0.25f32);
        let out = bilinear_interpolate(&input, 8, 8);
        assert!(out.iter().all(|v| (*v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_upsample_tensor_shape() {
        let t = Tensor::zeros((1, 3, 2, 5), DType::F32, &Device::Cpu).unwrap();
        let up = upsample_bilinear(&t, 4).unwrap();
        assert_eq!(up.dims(), &[1, 3, 8, 20]);
    }

    #[test]
    fn test_interpolate_rejects_3d() {
        let t = Tensor::zeros((3, 2, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(bilinear_interpolate_tensor(&t, 4, 10).is_err());
    }

    #[test]
    fn test_nearest_downsample_keeps_top_left() {
        let labels = array![[1u8, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12], [13, 14, 15, 16]];
        let small = nearest_resize_labels(&labels, 2, 2);
        assert_eq!(small, array![[1u8, 3], [9, 11]]);
    }

    #[test]
    fn test_nearest_upsample_repeats() {
        let labels = array![[1u8, 2], [3, 4]];
        let big = nearest_resize_labels(&labels, 4, 4);
        assert_eq!(big[[0, 0]], 1);
        assert_eq!(big[[1, 1]], 1);
        assert_eq!(big[[0, 3]], 2);
        assert_eq!(big[[3, 0]], 3);
        assert_eq!(big[[3, 3]], 4);
    }
}
