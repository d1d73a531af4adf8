//! Error types for alignkit

use thiserror::Error;

/// Main error type for alignkit operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("missing attribute: {0}")]
    MissingAttribute(String),

    #[error("no correspondences found under the initial transform")]
    NoCorrespondences,

    #[error("algorithm error: {0}")]
    Algorithm(String),
}

/// Result type alias for alignkit operations
pub type Result<T> = std::result::Result<T, Error>;
