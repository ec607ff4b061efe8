//! Error taxonomy for the profiling engine
//!
//! There is no stack underflow variant: popping an empty stack is the
//! expected outcome of unwinds the event source could not report, and
//! returns `None`.

use thiserror::Error;

/// Errors that can occur while driving or reading a profile session
#[derive(Error, Debug)]
pub enum ProfileError {
    /// Operation invalid for the current session state
    #[error("cannot {operation} while {state}")]
    IllegalState {
        operation: &'static str,
        state: &'static str,
    },

    /// A handle refers to storage that was already released
    #[error("{what} has already been freed")]
    AlreadyFreed { what: &'static str },

    /// Configuration rejected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Dump could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The profiled block failed and `allow_exceptions` was set
    #[error("profiled block failed: {0}")]
    Profiled(#[source] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProfileError {
    pub(crate) fn illegal(operation: &'static str, state: &'static str) -> Self {
        ProfileError::IllegalState { operation, state }
    }
}

/// Result type for profiling operations
pub type Result<T> = std::result::Result<T, ProfileError>;
