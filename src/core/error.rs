//! SH-002: Error taxonomy for workflows.
//!
//! Precondition and config errors abort immediately. Provider errors are the
//! only retryable class. Convergence errors abort apply and trigger the
//! fallback on destroy. Cleanup errors never surface here: they are logged
//! into the cleanup report instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StackError {
    /// Missing tool, credentials, or directory.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("config error: {0}")]
    Config(String),

    /// Provider CLI call failed; may be eventual consistency or throttling.
    #[error("{operation} failed: {message}")]
    Provider { operation: String, message: String },

    /// The target resource does not exist (already deleted).
    #[error("{0} not found")]
    NotFound(String),

    #[error("{step} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        step: String,
        attempts: u32,
        last: Box<StackError>,
    },

    /// Convergence engine exited non-zero.
    #[error("terraform {command} exited with code {code}: {stderr}")]
    Convergence {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("state error: {0}")]
    State(String),

    #[error("post-apply hook {index} exited with code {code}: {stderr}")]
    Hook {
        index: usize,
        code: i32,
        stderr: String,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StackError {
    pub fn provider(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Only provider failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
