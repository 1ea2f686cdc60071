//! Error types for the aggregation pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Caller configuration rejected before any geometry work starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required name was empty.
    #[error("{what} cannot be empty")]
    Empty { what: &'static str },

    /// Field names are limited to ten characters.
    #[error("field name '{name}' cannot exceed {max} characters")]
    FieldNameTooLong { name: String, max: usize },

    /// Punctuation (including underscores) is not allowed.
    #[error("{what} '{value}' cannot include special characters or underscores (found '{found}')")]
    Punctuation {
        what: &'static str,
        value: String,
        found: char,
    },

    /// Whitespace is not allowed.
    #[error("{what} '{value}' cannot contain whitespace")]
    Whitespace { what: &'static str, value: String },

    /// The field already exists on the grid being appended to.
    #[error("field '{field}' already exists on grid '{grid}'")]
    FieldExists { field: String, grid: String },

    /// The name clashes with a storage system field such as `FID` or `SHAPE`.
    #[error("field name '{0}' is reserved by layer storage")]
    ReservedFieldName(String),

    /// Acre and mile conversions assume a metric projection.
    #[error("layer '{layer}' uses linear unit {unit}; a metre-based projection is required")]
    NonMetricUnit { layer: String, unit: String },

    /// Fishnet construction parameters are unusable.
    #[error("invalid fishnet: {0}")]
    InvalidFishnet(String),
}

/// Errors surfaced by a pipeline run.
#[derive(Error, Debug)]
pub enum FishnetError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Any failure inside the geometry engine (invalid geometry, wrong kind).
    #[error("geometry operation '{operation}' failed: {reason}")]
    GeometryOperation {
        operation: &'static str,
        reason: String,
    },

    /// Input geometry type is outside Polygon, Line/Polyline, Point, Multipoint.
    #[error("unsupported geometry type: {0}")]
    UnsupportedGeometryType(String),

    #[error("layer not found: {0}")]
    LayerNotFound(String),

    #[error("field '{field}' not found on layer '{layer}'")]
    FieldNotFound { layer: String, field: String },

    #[error("I/O error on {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored layer could not be decoded or encoded.
    #[error("malformed layer {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },
}

impl FishnetError {
    pub(crate) fn geometry(operation: &'static str, reason: impl Into<String>) -> Self {
        FishnetError::GeometryOperation {
            operation,
            reason: reason.into(),
        }
    }
}

/// Result type for fishnet operations.
pub type Result<T> = std::result::Result<T, FishnetError>;
