//! Error types for geometry construction and material mapping.
//!
//! Navigation misses (no compatible surface, no next layer, no boundary hit)
//! are not errors and never show up here: they are reported as `false`,
//! `None` or an empty list by the navigation routines themselves.

use thiserror::Error;


/// Result type for geometry operations.
pub type Result<T> = std::result::Result<T, GeometryError>;

/// Errors raised while building or wiring up the geometry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),

    #[error("Invalid binning: {0}")]
    InvalidBinning(String),

    /// A set-once back-reference was assigned a second time.
    #[error("{0} has already been set and cannot be reassigned")]
    AlreadySet(&'static str),

    #[error("Layer ordering failed: {0}")]
    LayerOrdering(String),
}

/// Errors raised by a material mapping job.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("No extrapolation engine given")]
    MissingExtrapolationEngine,

    #[error("Layer material finalized before averaging")]
    NotAveraged,

    #[error("Material mapping job already finalized")]
    AlreadyFinalized,
}
