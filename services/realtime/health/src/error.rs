//! Error types for the health crate.

use thiserror::Error;

/// Health configuration errors
#[derive(Debug, Error)]
pub enum HealthError {
    /// Risk tier name not recognised
    #[error("unknown risk tier: {0} (expected low, medium or high)")]
    UnknownTier(String),
}
