//! Core data structures and traits for alignkit
//!
//! This crate provides the fundamental types used throughout the registration
//! pipeline: point aliases, point clouds with optional per-point attributes,
//! rigid transformations, and the nearest-neighbor search trait.

pub mod point;
pub mod point_cloud;
pub mod traits;
pub mod transform;
pub mod error;

pub use point::*;
pub use point_cloud::*;
pub use traits::*;
pub use transform::*;
pub use error::*;

/// Re-export commonly used types from nalgebra
pub use nalgebra::{Point3, Vector3, Matrix3, Matrix4, Isometry3, UnitQuaternion};

/// Common result type for alignkit operations
pub type Result<T> = std::result::Result<T, Error>;
