//! Error types
//!
//! Item-level failures are recoverable and only counted by the stage that
//! produced them. Store failures abort a single stage. `PipelineFailure` is the
//! one error a caller ever sees from a run.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Recoverable failure while processing a single image
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("could not read image {path:?}: {source}")]
    ImageUnreadable {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("no four-sided contour found")]
    NoQuadrilateral,

    #[error("no vehicles detected")]
    NoVehicles,

    #[error("degenerate quadrilateral: {0}")]
    DegenerateQuadrilateral(String),

    #[error("empty crop for box {index}")]
    EmptyCrop { index: usize },

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("remote call failed: {0}")]
    RemoteCall(String),

    /// Raised by vehicle detector and local recognizer engines
    #[allow(dead_code)]
    #[error("recognition engine failed: {0}")]
    Engine(String),

    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("could not write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ItemError {
    /// Whether the failure means the image was missing rather than broken
    pub fn is_not_found(&self) -> bool {
        matches!(self, ItemError::ImageNotFound(_))
    }
}

/// Failure to read or write an intermediate stage file
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("intermediate file not found: {0:?}")]
    Missing(PathBuf),

    #[error("invalid JSON in {path:?}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not serialize {path:?}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Terminal failure of a whole run, carrying the run log collected so far
#[derive(Debug, Error, Serialize)]
#[error("{message}")]
pub struct PipelineFailure {
    /// Human readable description
    pub message: String,
    /// Full run log content at the time of failure
    pub log_details: String,
}

impl PipelineFailure {
    pub fn new(message: impl Into<String>, log_details: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            log_details: log_details.into(),
        }
    }
}
