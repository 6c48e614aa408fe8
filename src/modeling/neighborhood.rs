//! Spatial locality restriction ("local attention") for the affinity matrix.
//!
//! A source patch may only vote for a target patch that lies inside the box of
//! radius `R` around it. The mask depends on the grid size alone, which is
//! fixed for a video, so masks are built once and kept in a
//! [`NeighborhoodMaskCache`].

use std::collections::HashMap;

use candle_core::{Device, Tensor};

use crate::error::Result;

#[derive(Debug, Clone)]
pub enum NeighborhoodMask {
    /// Full connectivity; the multiply is skipped entirely.
    Disabled,
    /// `[h * w, h * w]` f32 matrix of zeros and ones, rows = target, columns = source.
    Restricted(Tensor),
}

impl NeighborhoodMask {
    pub fn new(grid_h: usize, grid_w: usize, radius: usize, device: &Device) -> Result<Self> {
        if radius == 0 {
            return Ok(NeighborhoodMask::Disabled);
        }
        let hw = grid_h * grid_w;
        let data = box_neighborhood(grid_h, grid_w, radius);
        Ok(NeighborhoodMask::Restricted(Tensor::from_vec(
            data,
            (hw, hw),
            device,
        )?))
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, NeighborhoodMask::Disabled)
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            NeighborhoodMask::Disabled => None,
            NeighborhoodMask::Restricted(t) => Some(t),
        }
    }
}

/// Row-major `[h * w, h * w]` indicator of `|i - i'| <= r && |j - j'| <= r`.
fn box_neighborhood(h: usize, w: usize, r: usize) -> Vec<f32> {
    let hw = h * w;
    let mut mask = vec![0f32; hw * hw];
    for i in 0..h {
        for j in 0..w {
            let row = (i * w + j) * hw;
            for ni in i.saturating_sub(r)..=(i + r).min(h - 1) {
                for nj in j.saturating_sub(r)..=(j + r).min(w - 1) {
                    mask[row + ni * w + nj] = 1.0;
                }
            }
        }
    }
    mask
}

/// Masks keyed by `(grid_h, grid_w, radius)`.
///
/// Entries are never invalidated. The cache is owned by one tracker and used
/// through `&mut`; a driver tracking videos in parallel gives each worker its
/// own cache.
#[derive(Debug)]
pub struct NeighborhoodMaskCache {
    device: Device,
    masks: HashMap<(usize, usize, usize), NeighborhoodMask>,
}

impl NeighborhoodMaskCache {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            masks: HashMap::new(),
        }
    }

    pub fn get_or_build(
        &mut self,
        grid_h: usize,
        grid_w: usize,
        radius: usize,
    ) -> Result<NeighborhoodMask> {
        let key = (grid_h, grid_w, radius);
        if let Some(mask) = self.masks.get(&key) {
            return Ok(mask.clone());
        }
        tracing::debug!(grid_h, grid_w, radius, "building neighborhood mask");
        let mask = NeighborhoodMask::new(grid_h, grid_w, radius, &self.device)?;
        self.masks.insert(key, mask.clone());
        Ok(mask)
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(h: usize, w: usize, r: usize) -> Vec<Vec<f32>> {
        NeighborhoodMask::new(h, w, r, &Device::Cpu)
            .unwrap()
            .tensor()
            .unwrap()
            .to_vec2::<f32>()
            .unwrap()
    }

    #[test]
    fn test_mask_is_symmetric() {
        for &(h, w, r) in &[(3, 5, 1), (4, 4, 2), (6, 2, 1), (1, 7, 3)] {
            let m = dense(h, w, r);
            for a in 0..h * w {
                for b in 0..h * w {
                    assert_eq!(m[a][b], m[b][a], "asymmetric at ({a}, {b}) for {h}x{w} r={r}");
                }
            }
        }
    }

    #[test]
    fn test_mask_is_a_box_not_a_disk() {
        let (h, w) = (5, 5);
        let m = dense(h, w, 1);
        let center = 2 * w + 2;
        // the diagonal corner is inside a Chebyshev box of radius 1
        assert_eq!(m[center][w + 1], 1.0);
        assert_eq!(m[center][3 * w + 3], 1.0);
        // two steps away is outside
        assert_eq!(m[center][2], 0.0);
        assert_eq!(m[center][2 * w + 4], 0.0);
        let row_sum: f32 = m[center].iter().sum();
        assert_eq!(row_sum, 9.0);
        // corners are clipped at the border
        let corner_sum: f32 = m[0].iter().sum();
        assert_eq!(corner_sum, 4.0);
    }

    #[test]
    fn test_zero_radius_disables() {
        let mask = NeighborhoodMask::new(4, 4, 0, &Device::Cpu).unwrap();
        assert!(mask.is_disabled());
        assert!(mask.tensor().is_none());
    }

    #[test]
    fn test_cache_builds_once_per_key() {
        let mut cache = NeighborhoodMaskCache::new(&Device::Cpu);
        assert!(cache.is_empty());
        cache.get_or_build(4, 6, 2).unwrap();
        cache.get_or_build(4, 6, 2).unwrap();
        assert_eq!(cache.len(), 1);
        cache.get_or_build(6, 4, 2).unwrap();
        cache.get_or_build(4, 6, 1).unwrap();
        assert_eq!(cache.len(), 3);
    }
}
