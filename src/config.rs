//! Tracking configuration.
//!
//! A [`TrackingConfig`] is built once (defaults, JSON file, or CLI overrides),
//! validated, and then passed explicitly into every component that needs it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PropagationError, Result};

/// Temperature applied to cosine similarities before exponentiation.
pub const DEFAULT_TEMPERATURE: f64 = 0.1;

/// Target size for frames before feature extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSize {
    /// Resize so the shorter side equals this value, keeping the aspect ratio.
    ShorterSide(u32),
    /// Resize to exactly `(width, height)`.
    Exact(u32, u32),
}

impl InputSize {
    /// Size of an image of `(width, height)` after resizing.
    pub fn resized_dims(&self, width: u32, height: u32) -> (u32, u32) {
        match *self {
            InputSize::Exact(w, h) => (w, h),
            InputSize::ShorterSide(size) => {
                let (w, h) = (width as u64, height as u64);
                let size = size as u64;
                if h > w {
                    (size as u32, (size * h / w.max(1)) as u32)
                } else {
                    ((size * w / h.max(1)) as u32, size as u32)
                }
            }
        }
    }

    fn smallest_side(&self) -> u32 {
        match *self {
            InputSize::ShorterSide(size) => size,
            InputSize::Exact(w, h) => w.min(h),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Number of preceding propagated frames kept as context (first frame excluded).
    pub n_last_frames: usize,
    /// Box radius, in patches, of the spatial neighborhood. 0 disables the restriction.
    pub size_mask_neighborhood: usize,
    /// Number of source patches that vote for each target patch.
    pub topk: usize,
    /// Frames per feature-extractor call.
    pub batch_size: usize,
    pub input_size: InputSize,
    /// Must equal the backbone's patch stride.
    pub patch_size: usize,
    pub temperature: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfig {
            n_last_frames: 7,
            size_mask_neighborhood: 12,
            topk: 5,
            batch_size: 6,
            input_size: InputSize::ShorterSide(480),
            patch_size: 16,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

impl TrackingConfig {
    /// Load and validate a configuration from a JSON file.
    ///
    /// Missing fields fall back to [`TrackingConfig::default`].
    pub fn from_json(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| PropagationError::io(path, source))?;
        let cfg: TrackingConfig = serde_json::from_str(&contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PropagationError::io(parent, source))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| PropagationError::io(path, source))
    }

    /// Check that the values can drive a propagation.
    ///
    /// Whether `topk` fits the number of source patches depends on the video's
    /// grid size and is checked again by the affinity engine.
    pub fn validate(&self) -> Result<()> {
        if self.topk == 0 {
            return Err(PropagationError::invalid_config("topk", "must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(PropagationError::invalid_config("batch_size", "must be >= 1"));
        }
        if self.patch_size == 0 {
            return Err(PropagationError::invalid_config("patch_size", "must be >= 1"));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(PropagationError::invalid_config(
                "temperature",
                format!("must be a positive finite number, got {}", self.temperature),
            ));
        }
        if let InputSize::Exact(w, h) = self.input_size {
            if w == 0 || h == 0 {
                return Err(PropagationError::invalid_config(
                    "input_size",
                    "width and height must be > 0",
                ));
            }
        }
        if (self.input_size.smallest_side() as usize) < self.patch_size {
            return Err(PropagationError::invalid_config(
                "input_size",
                format!(
                    "smallest side {} is below patch_size {}",
                    self.input_size.smallest_side(),
                    self.patch_size
                ),
            ));
        }
        Ok(())
    }

    pub fn neighborhood_enabled(&self) -> bool {
        self.size_mask_neighborhood > 0
    }
}
