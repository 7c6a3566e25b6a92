//! Error types for pipe-zip

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::orchestrator::Participant;

/// Result type for pipe-zip operations
pub type Result<T> = std::result::Result<T, PipeZipError>;

/// Error types that can occur while registering entries or building an archive
#[derive(Debug, Error)]
pub enum PipeZipError {
    /// An argument does not have the shape the pipeline accepts
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The entry name is already registered or already exists in the workspace
    #[error("duplicate entry: {name}")]
    DuplicateEntry { name: String },

    /// The entry name resolves outside of the workspace
    #[error("entry path escapes the workspace: {name}")]
    PathEscape { name: String },

    /// A directory or named pipe could not be created
    #[error("failed to provision {}: {source}", .path.display())]
    Provisioning {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A feeder or the archiver did not finish successfully
    #[error("{participant} failed ({reason}): {command}{}", stderr_suffix(.stderr))]
    ProcessFailure {
        participant: Participant,
        command: String,
        code: Option<i32>,
        reason: String,
        stderr: String,
    },

    /// The workspace could not be removed
    #[error("failed to remove workspace {}: {source}", .path.display())]
    Teardown {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The host cannot run the pipeline (no FIFOs, missing compressor, missing options)
    #[error("unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    /// The produced archive is malformed or does not match what was fed
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PipeZipError {
    /// The participant responsible for a [`PipeZipError::ProcessFailure`]
    pub fn participant(&self) -> Option<&Participant> {
        match self {
            PipeZipError::ProcessFailure { participant, .. } => Some(participant),
            _ => None,
        }
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n{}", trimmed)
    }
}
