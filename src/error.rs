use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the masking/reduction core.
pub type Result<T> = std::result::Result<T, RoiError>;

// ---------------------------------------------------------------------------
// RoiError – failures of mask extraction, reduction and decomposition
// ---------------------------------------------------------------------------

/// Errors raised by the core pipeline.
///
/// An empty binary-mask selection for a single subject is *not* an error:
/// it is recovered locally as `f64::NAN` in the result matrix.
#[derive(Debug, Error)]
pub enum RoiError {
    /// Inputs are not spatially conformant (wrong rank or grid size).
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Thresholding produced an unusable (all-zero) mask, or the
    /// threshold itself could not be interpreted.
    #[error("invalid threshold: {reason}")]
    InvalidThreshold { reason: String },

    /// A weighted mask whose weights sum to zero.
    #[error("degenerate mask: total weight is {total_weight}")]
    DegenerateMask { total_weight: f64 },

    /// A failure while processing one component of a pipeline run.
    #[error("component {index} ({policy}): {source}")]
    Component {
        index: usize,
        policy: &'static str,
        #[source]
        source: Box<RoiError>,
    },

    /// A result row was committed twice.
    #[error("result row {0} is already committed")]
    RowCommitted(usize),

    /// The component decomposer could not produce the requested components.
    #[error("decomposition failed: {0}")]
    Decomposition(String),

    /// Writing an intermediate artifact failed.
    #[error("failed to persist {}: {message}", .path.display())]
    Persist { path: PathBuf, message: String },
}

impl RoiError {
    pub(crate) fn shape(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        RoiError::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Wrap this error with the component index and mask policy name.
    pub fn in_component(self, index: usize, policy: &'static str) -> Self {
        RoiError::Component {
            index,
            policy,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through `Component` wrappers.
    pub fn root(&self) -> &RoiError {
        match self {
            RoiError::Component { source, .. } => source.root(),
            other => other,
        }
    }
}
