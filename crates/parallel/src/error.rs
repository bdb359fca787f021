//! Error types for the parallel coordination layer.
//!
//! Recovery is not attempted across ranks: any of these surfacing from
//! [`crate::manager::ParallelManager::update`] leaves the simulation invalid
//! and callers are expected to abort the job.

use particles::ParticlesError;
use thiserror::Error;

/// Result alias for the parallel crate.
pub type Result<T> = std::result::Result<T, ParallelError>;

/// Failure taxonomy of the coordination layer.
#[derive(Debug, Error)]
pub enum ParallelError {
    /// Invalid configuration: unknown load-balance property, bad domain,
    /// unusable radius scale. Detected at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// A structural invariant does not hold (duplicate gid, cell/row
    /// disagreement, unassigned partition object).
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The underlying transport failed (channel closed, MPI error).
    #[error("transport failure: {0}")]
    Transport(String),

    /// A count expectation disagrees with what was actually received.
    #[error("size mismatch: {0}")]
    SizeMismatch(String),
}

impl ParallelError {
    /// Configuration error with a formatted message.
    pub fn config(msg: impl Into<String>) -> Self {
        ParallelError::Config(msg.into())
    }

    /// Invariant violation with a formatted message.
    pub fn invariant(msg: impl Into<String>) -> Self {
        ParallelError::Invariant(msg.into())
    }

    /// Transport failure with a formatted message.
    pub fn transport(msg: impl Into<String>) -> Self {
        ParallelError::Transport(msg.into())
    }

    /// Size mismatch with a formatted message.
    pub fn size_mismatch(msg: impl Into<String>) -> Self {
        ParallelError::SizeMismatch(msg.into())
    }
}

impl From<ParticlesError> for ParallelError {
    fn from(err: ParticlesError) -> Self {
        match err {
            // An unknown property name means the configured lb_props list
            // does not match the bound arrays.
            ParticlesError::UnknownProperty { .. } => ParallelError::Config(err.to_string()),
            other => ParallelError::Invariant(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_property_maps_to_config() {
        let pa = particles::ParticleArray::new("fluid");
        let err: ParallelError = pa.get_carray("missing").unwrap_err().into();
        assert!(matches!(err, ParallelError::Config(_)));
    }

    #[test]
    fn kind_mismatch_maps_to_invariant() {
        let pa = particles::ParticleArray::new("fluid");
        let err: ParallelError = pa.doubles("tag").unwrap_err().into();
        assert!(matches!(err, ParallelError::Invariant(_)));
    }
}
