// Error types for the segmentation workflow
//
// Request-level failures live in PipelineError and map onto HTTP statuses.
// Collaborator failures (model, storage, config) have their own enums and
// are folded into PipelineError at the stage boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

use crate::core::types::FailureReason;

/// Segmentation model errors
#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Model could not be loaded: {0}")]
    LoadFailed(String),

    #[error("Scale factor {scale} reduces {width}x{height} image to zero pixels")]
    ScaleTooSmall { scale: f32, width: u32, height: u32 },

    #[error("Unexpected model output shape {0:?}")]
    UnexpectedOutputShape(Vec<usize>),

    #[error("Tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Result storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Path escapes the storage root: {0}")]
    OutsideRoot(String),

    #[error("Cannot build public URL for {path}: {reason}")]
    InvalidUrl { path: String, reason: String },
}

/// Request pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No image, archive or dataset reference was supplied")]
    MissingInput,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Dataset file not found: {0}")]
    NotFound(String),

    #[error("Archive is corrupt or unreadable: {0}")]
    ArchiveCorrupt(String),

    #[error("Archive exceeds extraction limits: {0}")]
    ArchiveTooLarge(String),

    #[error("Image could not be decoded: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Segmentation failed: {0}")]
    Inference(#[from] SegmentationError),

    #[error("Result could not be encoded: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Failed to publish result: {0}")]
    Publish(#[from] StorageError),

    #[error("No valid images in batch ({failed} failed)")]
    NoValidResults { failed: usize },

    #[error("Scratch area unavailable: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingInput | Self::InvalidParameter(_) | Self::ArchiveCorrupt(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ArchiveTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Decode(_) | Self::NoValidResults { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Inference(_)
            | Self::Encode(_)
            | Self::Publish(_)
            | Self::Scratch(_)
            | Self::TaskJoinFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classify an item-level error for batch accounting.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::Decode(_) => FailureReason::Decode,
            Self::Inference(_) => FailureReason::Inference,
            Self::Encode(_) => FailureReason::Encode,
            Self::Publish(_) => FailureReason::Publish,
            _ => FailureReason::Internal,
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid mask values: {0}")]
    InvalidMaskValues(String),

    #[error("Invalid model config: {0}")]
    InvalidModelConfig(String),

    #[error("Invalid storage config: {0}")]
    InvalidStorageConfig(String),

    #[error("Upload limit must be > 0 MB, got {0}")]
    InvalidUploadLimit(usize),

    #[error("Archive limits must be > 0, got {0}")]
    InvalidArchiveLimit(String),

    #[error("Environment variable parsing failed: {0}")]
    EnvVarError(String),
}

pub type SegmentationResult<T> = Result<T, SegmentationError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_level_status_codes() {
        assert_eq!(PipelineError::MissingInput.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            PipelineError::NotFound("datasets/missing.png".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PipelineError::NoValidResults { failed: 3 }.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            PipelineError::ArchiveTooLarge("10001 entries".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            PipelineError::Inference(SegmentationError::LoadFailed("gone".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_failure_reason_mapping() {
        let err = PipelineError::Publish(StorageError::OutsideRoot("../x".into()));
        assert_eq!(err.failure_reason(), FailureReason::Publish);

        let err = PipelineError::Inference(SegmentationError::UnexpectedOutputShape(vec![3]));
        assert_eq!(err.failure_reason(), FailureReason::Inference);
    }
}
