//! Fit error types.

use thiserror::Error;

/// Reasons a trajectory could not be fitted.
///
/// A failed fit is never fatal: the candidate is rejected and processing
/// continues with the next one.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// Fewer than two measurement nodes.
    #[error("underdetermined fit: {measurements} measurement node(s), need at least 2")]
    Underdetermined {
        /// Measured nodes found.
        measurements: usize,
    },

    /// A pivot of the band decomposition vanished.
    #[error("singular band matrix at parameter {0}")]
    Singular(usize),

    /// A pivot of the band decomposition became negative.
    #[error("band matrix not positive definite at parameter {0}")]
    NotPositiveDefinite(usize),
}
