//! Error taxonomy for the incant core.
//!
//! Every failure a caller can observe maps onto one of these variants:
//!
//! - `Validation`: malformed or unnormalizable request/context; never reaches
//!   the store.
//! - `Dependency`: isolated-environment setup or install failure; retried once
//!   by the runner, then surfaced.
//! - `Network`: generation backend unreachable or timed out after the retry
//!   budget.
//! - `Exec`: the sandboxed process crashed, timed out, or produced an
//!   unparseable result. Carries the raw captured output for diagnosis and is
//!   never auto-regenerated without an explicit invalidation decision.
//! - `Template`: a candidate from the generation backend failed hash or
//!   permission verification; rejected before admission to the store.
//! - `Conflict` / `Corruption`: store integrity failures, always surfaced and
//!   never silently repaired.

use thiserror::Error;

/// Raw output captured from a sandboxed process, attached to execution errors.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Error, Debug)]
pub enum IncantError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("dependency setup failed: {0}")]
    Dependency(String),

    #[error("generation backend error: {0}")]
    Network(String),

    #[error("execution failed: {reason}")]
    Exec {
        reason: String,
        raw: CapturedOutput,
    },

    #[error("candidate rejected: {0}")]
    Template(String),

    #[error("conflicting cache entry for {fingerprint}: existing content {existing}, incoming {incoming}")]
    Conflict {
        fingerprint: String,
        existing: String,
        incoming: String,
    },

    #[error("corrupted cache entry {fingerprint}: manifest records {recorded}, recomputed {actual}")]
    Corruption {
        fingerprint: String,
        recorded: String,
        actual: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl IncantError {
    /// Shorthand for execution failures without captured output.
    pub fn exec(reason: impl Into<String>) -> Self {
        IncantError::Exec {
            reason: reason.into(),
            raw: CapturedOutput::default(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IncantError>;
