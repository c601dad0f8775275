//! Error taxonomy for the provisioning engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can end a host's pipeline.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Missing or inconsistent configuration, detected before any tool runs.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An external command exited non-zero.
    #[error("Command failed ({exit_code}): {command}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        /// Last lines the command printed, kept for diagnostics.
        output_tail: String,
    },

    /// An external command exceeded its deadline and was killed.
    #[error("Command timed out after {}s: {command}", timeout.as_secs())]
    CommandTimedOut { command: String, timeout: Duration },

    /// The run was cancelled while the command was in flight.
    #[error("Command cancelled: {command}")]
    Cancelled { command: String },

    /// The command could not be started at all.
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Dynamic addressing was selected but no usable address was reported.
    #[error("Could not resolve address for {host}: {reason}")]
    AddressResolution { host: String, reason: String },

    /// The workspace lock could not be taken.
    #[error("Failed to lock workspace for {host}: {source}")]
    Lock {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem error on a workspace path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The task processing a host panicked.
    #[error("Provisioning task for {host} panicked")]
    TaskPanicked { host: String },
}

impl ProvisionError {
    /// Shorthand for [`ProvisionError::Configuration`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the infra apply loop may retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CommandFailed { .. } | Self::CommandTimedOut { .. }
        )
    }

    /// Message plus captured tool output, used to classify failures.
    #[must_use]
    pub fn diagnostic_text(&self) -> String {
        match self {
            Self::CommandFailed { output_tail, .. } if !output_tail.is_empty() => {
                format!("{self}\n{output_tail}")
            }
            _ => self.to_string(),
        }
    }
}

/// Result alias used across the engine.
pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
