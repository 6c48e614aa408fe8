//! Error types for label propagation.
//!
//! Every failure is fatal to the video being tracked: the tracker never
//! retries and never writes a frame it could not compute.

use std::path::PathBuf;

use thiserror::Error;

/// `Result` alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PropagationError>;

#[derive(Debug, Error)]
pub enum PropagationError {
    /// Malformed input data: wrong tensor shape, non-2D segmentation, empty video.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A configuration value that cannot produce a valid propagation.
    #[error("invalid configuration for `{field}`: {reason}")]
    InvalidConfiguration { field: &'static str, reason: String },

    /// A target patch ended up with zero (or non-finite) total voting weight.
    #[error("degenerate affinity: target patch {column} has total weight {total}")]
    DegenerateAffinity { column: usize, total: f32 },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to decode png {path}: {source}")]
    PngDecode {
        path: PathBuf,
        #[source]
        source: png::DecodingError,
    },

    #[error("failed to encode png {path}: {source}")]
    PngEncode {
        path: PathBuf,
        #[source]
        source: png::EncodingError,
    },

    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PropagationError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        PropagationError::InvalidInput(message.into())
    }

    pub fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        PropagationError::InvalidConfiguration {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PropagationError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display_names_field() {
        let err = PropagationError::invalid_config("topk", "must be >= 1");
        assert_eq!(
            err.to_string(),
            "invalid configuration for `topk`: must be >= 1"
        );
    }

    #[test]
    fn test_candle_error_converts() {
        let err: PropagationError = candle_core::Error::Msg("boom".into()).into();
        assert!(matches!(err, PropagationError::Tensor(_)));
        assert!(err.to_string().contains("boom"));
    }
}
