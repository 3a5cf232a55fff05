use std::{io, result, sync::Arc};

use cid::Cid;
use thiserror::Error;

/// Errors produced anywhere in the storage and array pipeline.
///
/// `Error` is `Clone` so that the outcome of a single shared load can be handed to every caller
/// waiting on it. Foreign error sources are kept behind an `Arc` for that reason.
///
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("content not found: {0}")]
    NotFound(Cid),

    #[error("fetch failed after {attempts} attempt(s): {reason}")]
    FetchFailed { attempts: usize, reason: String },

    #[error("store has no write endpoint configured")]
    StoreReadOnly,

    #[error("attempt to modify read-only store (key: {0})")]
    ReadOnlyViolation(String),

    #[error("invalid root descriptor: {0}")]
    InvalidRoot(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("label {label} not found in coordinate {dim}")]
    LabelNotFound { dim: String, label: String },

    #[error("index {index} is out of range for dimension {dim} of size {size}")]
    IndexOutOfRange {
        dim: String,
        index: usize,
        size: usize,
    },

    #[error("nearest label to {label} in {dim} is {distance} away, tolerance is {tolerance}")]
    ToleranceExceeded {
        dim: String,
        label: String,
        distance: f64,
        tolerance: f64,
    },

    #[error("coordinates for dimension {0} do not match")]
    CoordinateMismatch(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("dimension {dim} has size {existing}, variable {variable} wants size {requested}")]
    DimensionSizeConflict {
        dim: String,
        variable: String,
        existing: usize,
        requested: usize,
    },

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("no dimension named {0}")]
    DimensionNotFound(String),

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("coordinate {0} is not monotonically increasing")]
    NonMonotonicCoordinate(String),

    #[error("unable to decode: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(Arc<io::Error>),

    #[error(transparent)]
    Json(Arc<serde_json::Error>),

    #[error(transparent)]
    Cid(Arc<cid::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<cid::Error> for Error {
    fn from(err: cid::Error) -> Self {
        Self::Cid(Arc::new(err))
    }
}

impl Error {
    /// Whether retrying the operation that produced this error might succeed.
    ///
    /// Only failures of the transport are transient. A definitive absence is not.
    ///
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::FetchFailed { .. } | Error::Io(_))
    }
}

pub type Result<T> = result::Result<T, Error>;
