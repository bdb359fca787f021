//! Particle Array Container
//!
//! This crate provides the struct-of-arrays particle storage consumed by the
//! parallel coordination layer. A [`ParticleArray`] is a named mapping from
//! property name to a dense, homogeneously-typed vector; all vectors share one
//! length (the current particle count).
//!
//! # Modules
//! - [`property`] -- Tagged-variant property vectors and element kinds.
//! - [`array`] -- The `ParticleArray` container and its row operations.

#![warn(missing_docs)]

pub mod array;
pub mod property;

pub use array::{ParticleArray, ParticleTag};
pub use property::{PropertyData, PropertyKind};

use thiserror::Error;

/// Errors produced by the particle container.
#[derive(Debug, Error)]
pub enum ParticlesError {
    /// A property name was looked up that does not exist on the array.
    #[error("unknown property '{name}' on particle array '{array}'")]
    UnknownProperty {
        /// Name of the owning particle array.
        array: String,
        /// The missing property name.
        name: String,
    },

    /// A property exists but holds a different element kind than requested.
    #[error("property '{name}' is {actual:?}, requested {requested:?}")]
    KindMismatch {
        /// The property name.
        name: String,
        /// The kind actually stored.
        actual: PropertyKind,
        /// The kind the caller asked for.
        requested: PropertyKind,
    },

    /// A property was added under a name that is already in use.
    #[error("property '{name}' already exists on particle array '{array}'")]
    DuplicateProperty {
        /// Name of the owning particle array.
        array: String,
        /// The clashing property name.
        name: String,
    },
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, ParticlesError>;
