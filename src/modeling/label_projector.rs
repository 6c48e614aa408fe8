use candle_core::{DType, Tensor};

use crate::error::{PropagationError, Result};
use crate::modeling::affinity::AffinityMatrix;

/// Projects context soft labels onto the target frame through an [`AffinityMatrix`].
///
/// Every target patch receives the convex combination of the class
/// distributions of its selected source patches. Context frames are pooled:
/// a patch from the first frame and a patch from the previous frame vote on
/// equal terms.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelProjector;

impl LabelProjector {
    pub fn new() -> Self {
        LabelProjector
    }

    /// `labels[c]` is the `[1, num_classes, h, w]` soft label of context frame `c`,
    /// in the same order the affinity was computed with.
    ///
    /// Returns the target's `[1, num_classes, h, w]` soft label.
    pub fn project(&self, affinity: &AffinityMatrix, labels: &[&Tensor]) -> Result<Tensor> {
        let (h, w) = affinity.grid();
        let hw = h * w;
        let ncontext = affinity.num_contexts();
        if labels.len() != ncontext {
            return Err(PropagationError::invalid_input(format!(
                "affinity was computed over {} context frames but {} labels were given",
                ncontext,
                labels.len()
            )));
        }

        let (_, num_classes, _, _) = labels[0].dims4()?;
        for (i, label) in labels.iter().enumerate() {
            if label.dims() != [1, num_classes, h, w] {
                return Err(PropagationError::invalid_input(format!(
                    "context label {i} has shape {:?}, expected [1, {num_classes}, {h}, {w}]",
                    label.dims()
                )));
            }
        }

        // [C, n * hw], column order matches the affinity rows
        let segs = Tensor::cat(labels, 0)?
            .to_dtype(DType::F32)?
            .reshape((ncontext, num_classes, hw))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((ncontext * hw, num_classes))?
            .t()?
            .contiguous()?;

        let seg_tar = segs.matmul(affinity.weights())?;
        Ok(seg_tar.reshape((1, num_classes, h, w))?)
    }
}
