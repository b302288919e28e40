//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A version-checked or conditional write matched no rows. Callers decide
    /// whether to reload and retry or to give up.
    #[error("changed concurrently: {0}")]
    ConcurrentModification(String),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, Error::ConcurrentModification(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
