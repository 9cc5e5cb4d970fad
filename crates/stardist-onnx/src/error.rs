//! Error types for segmentation runs

use std::path::PathBuf;

/// Errors that can occur while preparing, running, or post-processing a
/// segmentation request
#[derive(Debug, thiserror::Error)]
pub enum SegmentationError {
    #[error("Unsupported task '{0}' (only 'nuclear' is available)")]
    UnsupportedTask(String),

    #[error("Variant '{variant}' expects a {expected}D image ({label}), got {actual}D")]
    DimensionMismatch {
        variant: String,
        expected: usize,
        actual: usize,
        label: String,
    },

    #[error("Unknown model variant: {0}")]
    UnknownVariant(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Object diameter must be a positive number of pixels, got {0}")]
    InvalidDiameter(f32),

    #[error("Rescaling by {factor} collapses an axis of shape {shape:?} to zero voxels")]
    EmptyAfterScaling { factor: f32, shape: Vec<usize> },

    #[error("No ONNX model found for variant '{variant}' under {}", .root.display())]
    ModelNotFound { variant: String, root: PathBuf },

    #[error("Multiple ONNX files found, cannot pick a default: {0:?}")]
    AmbiguousModel(Vec<PathBuf>),

    #[error("Failed to load ONNX model from {path}: {error}")]
    ModelLoad { path: String, error: String },

    #[error("Failed to parse ONNX graph: {0}")]
    GraphParse(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Invalid model output: {0}")]
    InvalidOutput(String),

    #[error("{0}")]
    CompiledOpsRequired(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
}

pub type Result<T> = std::result::Result<T, SegmentationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SegmentationError::UnsupportedTask("cytoplasmic".to_string());
        assert_eq!(
            err.to_string(),
            "Unsupported task 'cytoplasmic' (only 'nuclear' is available)"
        );

        let err = SegmentationError::ModelLoad {
            path: "default_2d.onnx".to_string(),
            error: "invalid format".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to load ONNX model from default_2d.onnx: invalid format"
        );
    }

    #[test]
    fn test_dimension_mismatch_mentions_label() {
        let err = SegmentationError::DimensionMismatch {
            variant: "default_3d".to_string(),
            expected: 3,
            actual: 2,
            label: "(Z, Y, X)".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3D"));
        assert!(msg.contains("(Z, Y, X)"));
    }
}
