//! Domain-specific error types for pvestrap.
//!
//! This module defines `ProvisionError`, a `thiserror`-based enum that
//! provides typed error variants for every failure class of a provisioning
//! run. Component contracts (resolver, locator, fetcher, sequencer) return
//! `Result<T, ProvisionError>`, while trait boundaries such as the command
//! executor continue to use `anyhow::Result`.
//!
//! `ProvisionError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at boundaries that return `anyhow::Result`, and
//! callers can still recover the typed error with `downcast_ref`.

use std::io;

use crate::host::VmId;
use crate::sequencer::{ProvisionState, Step};

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)").
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::StorageFull => "I/O error: no space left on device".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Domain-specific error type for pvestrap.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// An input field was malformed or violated a constraint.
    ///
    /// Recoverable by re-prompting in interactive mode, fatal otherwise.
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested identifier or storage is not available on the host.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Resolving the image schematic or downloading the artifact failed.
    #[error("fetch error: {message}")]
    Fetch {
        /// Description including the URL and the HTTP status or transport error.
        message: String,
        /// Whether the failure was a transient network condition worth retrying.
        retryable: bool,
    },

    /// A named provisioning step failed.
    ///
    /// Carries the state accumulated before the failure so the operator can
    /// see exactly how far the run got.
    #[error("step '{step}' failed for resource {vmid}: {source}")]
    Step {
        step: Step,
        vmid: VmId,
        state: ProvisionState,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// A command execution failed (non-zero exit, timeout, spawn failure, etc.).
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command that was executed, with arguments.
        command: String,
        /// Human-readable reason: exit code, timeout or internal failure.
        status: String,
    },

    /// The run was stopped by SIGINT or SIGTERM.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// The command was not found in PATH.
    #[error("command not found: {command}: not found in PATH")]
    CommandNotFound { command: String },

    /// A configuration file could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        context: String,
        message: String,
        #[source]
        source: io::Error,
    },
}

impl ProvisionError {
    /// Creates an `Io` variant with the `message` derived from the `source`.
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Creates a non-retryable `Fetch` variant.
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true for fetch failures caused by transient network conditions.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch { retryable: true, .. })
    }

    /// Returns the provisioning state attached to a step failure, if any.
    pub fn state(&self) -> Option<&ProvisionState> {
        match self {
            Self::Step { state, .. } => Some(state),
            _ => None,
        }
    }
}
