//! Error types for teletrack-core.

use crate::geometry::LayerId;
use thiserror::Error;

/// Result type alias for teletrack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
///
/// Only setup failures surface as errors. Per-event problems are either
/// reported as [`Error::DataUnavailable`] so the caller can skip the event, or
/// degrade silently to "this candidate contributes nothing".
#[derive(Error, Debug)]
pub enum Error {
    /// Geometry is absent or inconsistent.
    #[error("geometry error: {0}")]
    Geometry(String),

    /// No resolution table was configured for any layer.
    #[error("no resolution table configured for any layer")]
    MissingResolution,

    /// Invalid resolution table for a layer.
    #[error("invalid resolution table for layer {layer}: {reason}")]
    InvalidResolution { layer: LayerId, reason: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Layer referenced by the configuration does not exist in the geometry.
    #[error("unknown layer id {0}")]
    UnknownLayer(LayerId),

    /// Expected hit collection missing for an event.
    #[error("no hits available for event {event}")]
    DataUnavailable { event: u64 },

    /// Cluster has no pixels.
    #[error("cannot compute centroid of empty cluster")]
    EmptyCluster,
}
