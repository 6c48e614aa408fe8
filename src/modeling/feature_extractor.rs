//! Backbone boundary.
//!
//! The tracker only needs a deterministic function from a batch of frames to a
//! grid of per-patch embeddings. Learned backbones (DINO ViT and friends) plug
//! in through [`FeatureExtractor`]; [`PixelPatchExtractor`] is a non-learned
//! stand-in that flattens raw patch pixels.

use candle_core::{DType, Tensor};

use crate::error::{PropagationError, Result};

pub trait FeatureExtractor {
    /// Stride, in pixels, between neighbouring patches.
    fn patch_size(&self) -> usize;

    /// Length of one patch embedding.
    fn embed_dim(&self) -> usize;

    /// Map `[batch, channels, H, W]` frames to `[batch, embed_dim, H / p, W / p]`.
    ///
    /// `H` and `W` are multiples of [`FeatureExtractor::patch_size`]. Any class
    /// token the backbone produces must already be discarded.
    fn extract(&self, images: &Tensor) -> Result<Tensor>;
}

impl<E: FeatureExtractor + ?Sized> FeatureExtractor for Box<E> {
    fn patch_size(&self) -> usize {
        (**self).patch_size()
    }

    fn embed_dim(&self) -> usize {
        (**self).embed_dim()
    }

    fn extract(&self, images: &Tensor) -> Result<Tensor> {
        (**self).extract(images)
    }
}

/// Extract per-frame `[embed_dim, h, w]` embeddings, `batch_size` frames per call.
///
/// Returned embeddings are in the same order as `frames`.
pub fn extract_batched<E: FeatureExtractor + ?Sized>(
    extractor: &E,
    frames: &[&Tensor],
    batch_size: usize,
) -> Result<Vec<Tensor>> {
    if batch_size == 0 {
        return Err(PropagationError::invalid_config("batch_size", "must be >= 1"));
    }
    let patch = extractor.patch_size();
    let mut embeddings = Vec::with_capacity(frames.len());

    for chunk in frames.chunks(batch_size) {
        let batch = Tensor::stack(chunk, 0)?;
        let (b, _, height, width) = batch.dims4()?;

        let out = extractor.extract(&batch)?;
        let (ob, dim, gh, gw) = out.dims4()?;
        if ob != b || dim != extractor.embed_dim() || gh != height / patch || gw != width / patch {
            return Err(PropagationError::invalid_input(format!(
                "feature extractor returned {:?} for a batch of {:?}, expected [{}, {}, {}, {}]",
                out.dims(),
                batch.dims(),
                b,
                extractor.embed_dim(),
                height / patch,
                width / patch
            )));
        }

        for i in 0..b {
            embeddings.push(out.get(i)?);
        }
    }

    tracing::trace!(frames = frames.len(), batch_size, "extracted patch embeddings");
    Ok(embeddings)
}

/// Embeds each patch as its flattened `channels x p x p` pixel block.
///
/// Cosine similarity between such embeddings is a plain appearance match, so
/// this extractor is useful for smoke tests and synthetic videos.
#[derive(Debug, Clone)]
pub struct PixelPatchExtractor {
    patch_size: usize,
    channels: usize,
}

impl PixelPatchExtractor {
    pub fn new(patch_size: usize, channels: usize) -> Result<Self> {
        if patch_size == 0 {
            return Err(PropagationError::invalid_config("patch_size", "must be >= 1"));
        }
        if channels == 0 {
            return Err(PropagationError::invalid_input("channels must be >= 1"));
        }
        Ok(Self {
            patch_size,
            channels,
        })
    }

    /// RGB frames.
    pub fn rgb(patch_size: usize) -> Result<Self> {
        Self::new(patch_size, 3)
    }
}

impl FeatureExtractor for PixelPatchExtractor {
    fn patch_size(&self) -> usize {
        self.patch_size
    }

    fn embed_dim(&self) -> usize {
        self.channels * self.patch_size * self.patch_size
    }

    fn extract(&self, images: &Tensor) -> Result<Tensor> {
        let (b, c, height, width) = images.dims4()?;
        if c != self.channels {
            return Err(PropagationError::invalid_input(format!(
                "expected {} channels, got {}",
                self.channels, c
            )));
        }
        let p = self.patch_size;
        let (gh, gw) = (height / p, width / p);
        let dim = self.embed_dim();

        let data = images
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        // out[b, (c, dy, dx), gy, gx] = in[b, c, gy * p + dy, gx * p + dx]
        let mut out = vec![0f32; b * dim * gh * gw];
        for bi in 0..b {
            for ci in 0..c {
                for dy in 0..p {
                    for dx in 0..p {
                        let d = (ci * p + dy) * p + dx;
                        for gy in 0..gh {
                            for gx in 0..gw {
                                let src = ((bi * c + ci) * height + gy * p + dy) * width + gx * p + dx;
                                let dst = ((bi * dim + d) * gh + gy) * gw + gx;
                                out[dst] = data[src];
                            }
                        }
                    }
                }
            }
        }

        Ok(Tensor::from_vec(out, (b, dim, gh, gw), images.device())?)
    }
}
