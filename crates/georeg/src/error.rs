//! Crate-level error taxonomy.

use crate::geo::GeoBounds;
use crate::homography::HomographyError;
use crate::transform::TransformError;

/// Errors surfaced by the registration pipeline and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No reference imagery after every source and time-window fallback.
    #[error("no reference imagery available for {bounds}")]
    ReferenceUnavailable { bounds: GeoBounds },

    /// Feature matching produced no usable transform.
    #[error("feature matching failed: {reason}")]
    MatchFailed { reason: String },

    /// Too few valid grid points to fit a geographic transform.
    #[error("geo-transform composition failed: {valid_points} valid grid points, need {required}")]
    GeoCompositionFailed {
        valid_points: usize,
        required: usize,
    },

    /// A correspondence set too small for the requested model.
    #[error("degenerate correspondence set: {got} points")]
    DegenerateCorrespondenceSet { got: usize },

    /// A collaborator failed in a way that may succeed on retry.
    #[error("transient failure in {operation}: {message}")]
    Transient { operation: String, message: String },

    /// The job was cancelled before it started.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Homography(#[from] HomographyError),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether a retry may help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Short stable label used in logs and batch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ReferenceUnavailable { .. } => "reference_unavailable",
            Error::MatchFailed { .. } => "match_failed",
            Error::GeoCompositionFailed { .. } => "geo_composition_failed",
            Error::DegenerateCorrespondenceSet { .. } => "degenerate_correspondence_set",
            Error::Transient { .. } => "transient",
            Error::Cancelled => "cancelled",
            Error::Transform(_) => "transform",
            Error::Homography(_) => "homography",
            Error::Image(_) => "image",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
