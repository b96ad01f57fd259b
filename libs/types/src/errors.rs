//! Error types for identifier validation
//!
//! Identifiers arrive from clients as plain strings; these errors describe
//! why one was refused before it reached any engine state.

use thiserror::Error;

/// Identifier validation error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },

    #[error("{kind} exceeds {max} characters: {len}")]
    TooLong {
        kind: &'static str,
        max: usize,
        len: usize,
    },

    #[error("{kind} contains whitespace: {value:?}")]
    Whitespace { kind: &'static str, value: String },
}
