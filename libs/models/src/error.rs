//! Error types for model parsing.

use thiserror::Error;

/// Errors that can occur when parsing model values from text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Unknown access control mode.
    #[error("invalid access mode '{0}': expected 'open' or 'restricted'")]
    InvalidAccessMode(String),

    /// Unknown proxy status.
    #[error("invalid proxy status '{0}'")]
    InvalidStatus(String),
}
