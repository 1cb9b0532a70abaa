use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for tiled segmentation jobs.
///
/// Every fatal condition a job can hit has its own variant so the runner can
/// report a precise diagnostic on stderr and the supervisor can surface it
/// without parsing strings. None of these are retried.
#[derive(Error, Debug)]
pub enum SegError {
    #[error("Invalid argument: {field} {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Model not found: {path:?}")]
    ModelNotFound { path: PathBuf },

    #[error("Unsupported model format: failed to load {path:?}")]
    UnsupportedFormat {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Prediction failed: {operation}")]
    PredictionFailure {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Network failure calling {url}: {reason}")]
    NetworkFailure {
        url: String,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Input export failed: {operation} failed for {path:?}")]
    ExportFailure {
        path: PathBuf,
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Inference job failed ({status}): {stderr}")]
    JobFailed { status: ExitStatus, stderr: String },

    #[error("Inference job was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SegError>;

impl SegError {
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn prediction(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::PredictionFailure {
            operation: operation.into(),
            source: source.into(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should construct
/// `SegError::FileSystem` directly; this is the fallback for the rest.
impl From<std::io::Error> for SegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to export failures.
impl From<image::ImageError> for SegError {
    fn from(err: image::ImageError) -> Self {
        Self::ExportFailure {
            path: PathBuf::from("unknown"),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors raised while a graph runs.
///
/// Load-time errors are mapped to `UnsupportedFormat` by the resolver before
/// they reach this conversion.
impl From<ort::Error> for SegError {
    fn from(err: ort::Error) -> Self {
        Self::PredictionFailure {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors only occur while reshaping tensors around a prediction call.
impl From<ndarray::ShapeError> for SegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::PredictionFailure {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_json::Error> for SegError {
    fn from(err: serde_json::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}
