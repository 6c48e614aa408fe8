//! Sparse affinity between a target frame and its context frames.
//!
//! For every target patch the engine scores every source patch of every
//! context frame, keeps the `topk` best scores and turns them into convex
//! voting weights.

use std::cmp::Ordering;

use candle_core::Tensor;

use crate::config::TrackingConfig;
use crate::error::{PropagationError, Result};
use crate::modeling::neighborhood::NeighborhoodMask;

const NORM_EPS: f64 = 1e-12;

/// Column-normalized `[num_contexts * h * w, h * w]` voting weights.
///
/// Row `c * h * w + s` is source patch `s` of context frame `c`; column `t`
/// is target patch `t`. Each column has at most `topk` non-zero entries and
/// sums to one.
#[derive(Debug, Clone)]
pub struct AffinityMatrix {
    weights: Tensor,
    num_contexts: usize,
    grid: (usize, usize),
}

impl AffinityMatrix {
    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    pub fn num_contexts(&self) -> usize {
        self.num_contexts
    }

    /// `(grid_h, grid_w)` shared by target and context frames.
    pub fn grid(&self) -> (usize, usize) {
        self.grid
    }
}

#[derive(Debug, Clone)]
pub struct AffinityEngine {
    topk: usize,
    temperature: f64,
}

impl AffinityEngine {
    /// `topk == 0` is rejected here, before any similarity is computed.
    pub fn new(topk: usize, temperature: f64) -> Result<Self> {
        if topk == 0 {
            return Err(PropagationError::invalid_config("topk", "must be >= 1"));
        }
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(PropagationError::invalid_config(
                "temperature",
                format!("must be a positive finite number, got {temperature}"),
            ));
        }
        Ok(Self { topk, temperature })
    }

    pub fn from_config(config: &TrackingConfig) -> Result<Self> {
        Self::new(config.topk, config.temperature)
    }

    pub fn topk(&self) -> usize {
        self.topk
    }

    /// Affinity of `target` (`[dim, h, w]`) against each of `contexts` (`[dim, h, w]` each).
    pub fn compute(
        &self,
        target: &Tensor,
        contexts: &[Tensor],
        mask: &NeighborhoodMask,
    ) -> Result<AffinityMatrix> {
        let (dim, h, w) = target.dims3()?;
        let hw = h * w;
        let ncontext = contexts.len();
        if ncontext == 0 {
            return Err(PropagationError::invalid_input(
                "label propagation needs at least one context frame",
            ));
        }
        for (i, ctx) in contexts.iter().enumerate() {
            if ctx.dims() != target.dims() {
                return Err(PropagationError::invalid_input(format!(
                    "context embedding {i} has shape {:?}, target has {:?}",
                    ctx.dims(),
                    target.dims()
                )));
            }
        }
        if self.topk > ncontext * hw {
            return Err(PropagationError::invalid_config(
                "topk",
                format!(
                    "{} exceeds the {} available source patches",
                    self.topk,
                    ncontext * hw
                ),
            ));
        }
        if let Some(m) = mask.tensor() {
            if m.dims() != [hw, hw] {
                return Err(PropagationError::invalid_input(format!(
                    "neighborhood mask has shape {:?}, grid needs [{hw}, {hw}]",
                    m.dims()
                )));
            }
        }

        // [hw, dim]
        let feat_tar = l2_normalize(&target.reshape((dim, hw))?.t()?.contiguous()?, 1)?;
        // [n, dim, hw]
        let feat_sources = l2_normalize(&Tensor::stack(contexts, 0)?.reshape((ncontext, dim, hw))?, 1)?;

        // [n, hw (target), hw (source)]
        let feat_tar = feat_tar
            .unsqueeze(0)?
            .broadcast_as((ncontext, hw, dim))?
            .contiguous()?;
        let similarity = feat_tar.matmul(&feat_sources)?;
        let mut aff = (similarity / self.temperature)?.exp()?;

        if let Some(m) = mask.tensor() {
            aff = aff.broadcast_mul(m)?;
        }

        // [n * hw (source), hw (target)]
        let aff = aff.transpose(1, 2)?.contiguous()?.reshape((ncontext * hw, hw))?;

        let weights = self.sparsify_and_normalize(&aff)?;
        Ok(AffinityMatrix {
            weights,
            num_contexts: ncontext,
            grid: (h, w),
        })
    }

    /// Keep the `topk` largest entries of every column and rescale the column to sum to one.
    ///
    /// Exactly `topk` entries survive. When several rows tie at the boundary
    /// value the lower row index wins, i.e. earlier context frames first, then
    /// lower source patch index.
    fn sparsify_and_normalize(&self, aff: &Tensor) -> Result<Tensor> {
        let (rows, cols) = aff.dims2()?;
        let data = aff.flatten_all()?.to_vec1::<f32>()?;
        let mut out = vec![0f32; rows * cols];
        let mut column: Vec<(f32, usize)> = Vec::with_capacity(rows);

        for c in 0..cols {
            column.clear();
            column.extend((0..rows).map(|r| (data[r * cols + c], r)));
            if self.topk < rows {
                column.select_nth_unstable_by(self.topk - 1, rank_desc);
            }
            let kept = &column[..self.topk];

            let total: f32 = kept.iter().map(|(v, _)| *v).sum();
            if !(total.is_finite() && total > 0.0) {
                return Err(PropagationError::DegenerateAffinity { column: c, total });
            }
            for &(v, r) in kept {
                out[r * cols + c] = v / total;
            }
        }

        Ok(Tensor::from_vec(out, (rows, cols), aff.device())?)
    }
}

/// Descending by value, ascending by row on ties; a total order so selection is deterministic.
fn rank_desc(a: &(f32, usize), b: &(f32, usize)) -> Ordering {
    b.0.total_cmp(&a.0).then(a.1.cmp(&b.1))
}

/// Unit-length vectors along `dim`.
fn l2_normalize(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let norm = (xs.sqr()?.sum_keepdim(dim)?.sqrt()? + NORM_EPS)?;
    Ok(xs.broadcast_div(&norm)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    fn embedding(dim: usize, h: usize, w: usize, seed: f32) -> Tensor {
        let data: Vec<f32> = (0..dim * h * w)
            .map(|i| ((i as f32) * 0.37 + seed).sin())
            .collect();
        Tensor::from_vec(data, (dim, h, w), &Device::Cpu).unwrap()
    }

    fn columns(aff: &AffinityMatrix) -> Vec<Vec<f32>> {
        let rows = aff.weights().to_vec2::<f32>().unwrap();
        let cols = rows[0].len();
        (0..cols)
            .map(|c| rows.iter().map(|r| r[c]).collect())
            .collect()
    }

    #[test]
    fn test_zero_topk_is_invalid_configuration() {
        assert!(matches!(
            AffinityEngine::new(0, 0.1),
            Err(PropagationError::InvalidConfiguration { field: "topk", .. })
        ));
    }

    #[test]
    fn test_columns_sum_to_one_with_at_most_k_nonzeros() {
        let (dim, h, w) = (6, 4, 5);
        let target = embedding(dim, h, w, 0.0);
        let contexts = vec![embedding(dim, h, w, 1.0), embedding(dim, h, w, 2.0)];
        let mask = NeighborhoodMask::new(h, w, 1, &Device::Cpu).unwrap();
        let engine = AffinityEngine::new(3, 0.1).unwrap();

        let aff = engine.compute(&target, &contexts, &mask).unwrap();
        assert_eq!(aff.weights().dims(), &[2 * h * w, h * w]);
        assert_eq!(aff.num_contexts(), 2);
        assert_eq!(aff.grid(), (h, w));
        for col in columns(&aff) {
            let sum: f32 = col.iter().sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-5);
            assert!(col.iter().filter(|v| **v > 0.0).count() <= 3);
        }
    }

    #[test]
    fn test_mask_excludes_distant_sources() {
        let (dim, h, w) = (4, 5, 5);
        let target = embedding(dim, h, w, 0.5);
        let contexts = vec![embedding(dim, h, w, 3.0)];
        let mask = NeighborhoodMask::new(h, w, 1, &Device::Cpu).unwrap();
        let engine = AffinityEngine::new(4, 0.1).unwrap();
        let aff = engine.compute(&target, &contexts, &mask).unwrap();

        for (t, col) in columns(&aff).iter().enumerate() {
            let (ti, tj) = (t / w, t % w);
            for (s, v) in col.iter().enumerate() {
                let (si, sj) = (s / w, s % w);
                if ti.abs_diff(si) > 1 || tj.abs_diff(sj) > 1 {
                    assert_eq!(*v, 0.0, "source {s} outside the box of target {t}");
                }
            }
        }
    }

    #[test]
    fn test_ties_keep_exactly_k_lowest_rows() {
        // identical constant embeddings: every score ties
        let target = Tensor::ones((3, 2, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let contexts = vec![target.clone(), target.clone()];
        let engine = AffinityEngine::new(2, 0.1).unwrap();
        let aff = engine
            .compute(&target, &contexts, &NeighborhoodMask::Disabled)
            .unwrap();
        for col in columns(&aff) {
            assert_eq!(col.iter().filter(|v| **v > 0.0).count(), 2);
            assert_abs_diff_eq!(col[0], 0.5, epsilon = 1e-6);
            assert_abs_diff_eq!(col[1], 0.5, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_identical_frame_selects_itself_at_top1() {
        let (dim, h, w) = (8, 3, 3);
        let target = embedding(dim, h, w, 0.0);
        let engine = AffinityEngine::new(1, 0.1).unwrap();
        let aff = engine
            .compute(&target, &[target.clone()], &NeighborhoodMask::Disabled)
            .unwrap();
        for (t, col) in columns(&aff).iter().enumerate() {
            assert_abs_diff_eq!(col[t], 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_topk_larger_than_sources_rejected() {
        let target = embedding(2, 2, 2, 0.0);
        let engine = AffinityEngine::new(9, 0.1).unwrap();
        let res = engine.compute(&target, &[target.clone()], &NeighborhoodMask::Disabled);
        assert!(matches!(
            res,
            Err(PropagationError::InvalidConfiguration { field: "topk", .. })
        ));
    }

    #[test]
    fn test_zero_embeddings_surface_degenerate_affinity() {
        // every similarity is -1 and exp(-1 / 1e-3) underflows to zero
        let target = Tensor::ones((2, 2, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let context = target.neg().unwrap();
        let engine = AffinityEngine::new(1, 1e-3).unwrap();
        let res = engine.compute(&target, &[context], &NeighborhoodMask::Disabled);
        assert!(matches!(res, Err(PropagationError::DegenerateAffinity { .. })));
    }

    #[test]
    fn test_mismatched_context_shape_rejected() {
        let target = embedding(4, 2, 2, 0.0);
        let context = embedding(4, 2, 3, 0.0);
        let engine = AffinityEngine::new(1, 0.1).unwrap();
        let res = engine.compute(&target, &[context], &NeighborhoodMask::Disabled);
        assert!(matches!(res, Err(PropagationError::InvalidInput(_))));
    }
}
