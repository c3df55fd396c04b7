//! Error types for the service layer.
//!
//! Errors are classified by how the caller should react:
//! - Storage errors are fatal to the enclosing operation and propagate.
//! - Collaborator errors (LLM, a single source) are caught at the smallest
//!   enclosing scope and recorded on the outcome, never aborting a cycle.
//! - Configuration errors surface immediately and distinctly.

use thiserror::Error;

use crate::store::DbError;

#[derive(Debug, Error)]
pub enum EmmaError {
    /// Ledger storage failure. Callers must not mark the enclosing cycle
    /// successful when they see this.
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient collaborator failure (LLM backend, a single source poll).
    #[error("{0}")]
    Collaborator(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from LLM backends, kept separate from `EmmaError` so the prompt
/// layer can react to individual failure modes before they are folded into
/// a collaborator error.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM backend returned empty response after retries")]
    EmptyResponse,

    #[error("LLM API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Could not parse JSON from LLM response: {0}")]
    Parse(String),
}

impl From<LlmError> for EmmaError {
    fn from(err: LlmError) -> Self {
        EmmaError::Collaborator(err.to_string())
    }
}
