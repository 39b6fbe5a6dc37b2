// Library interface for incant
// This allows integration tests and external code to use incant's modules

pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod generate;
pub mod invalidate;
pub mod logging;
pub mod sandbox;
pub mod store;

// Re-export commonly used types
pub use client::{Incant, RunOptions, RunOutcome};
pub use config::IncantConfig;
pub use error::{IncantError, Result};
pub use fingerprint::Fingerprint;
pub use sandbox::{ExecutionResult, ResultStatus};
pub use store::{ArtifactStore, Manifest};
