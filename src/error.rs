//! Error types for the admission crate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for admission operations.
///
/// Rate-limiting decisions are never errors; these variants cover
/// precondition violations and setup failures only.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A permit request of zero
    #[error("Requested permits ({0}) must be positive")]
    InvalidPermits(u32),

    /// A rate that is zero, negative, NaN or infinite
    #[error("Rate must be positive and finite, got {0}")]
    InvalidRate(f64),

    /// A bucket capacity of zero
    #[error("Capacity must be positive")]
    InvalidCapacity,

    /// A window limit of zero
    #[error("Limit must be positive")]
    InvalidLimit,

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for admission operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
