//! Error types for the session layer.

use std::io;

use thiserror::Error;

use crate::session::{SessionId, SessionState};

/// Synchronous failure to start a PTY process. Never retried by this layer.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("executable not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("resource limit reached: {0}")]
    ResourceLimit(String),

    #[error("PTY spawn failed: {0}")]
    Other(String),
}

impl SpawnError {
    /// Classify a spawn failure reported by the native layer.
    ///
    /// `portable-pty` surfaces most failures as `anyhow::Error`, so the
    /// underlying `io::Error` is recovered by downcasting when present and by
    /// inspecting the message otherwise.
    pub(crate) fn classify(context: &str, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(e) = cause {
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                return Self::from_io(context, io_err);
            }
            cause = e.source();
        }

        let message = format!("{context}: {err}");
        let lower = message.to_ascii_lowercase();
        if lower.contains("no such file")
            || lower.contains("not found")
            || lower.contains("exist")
        {
            SpawnError::NotFound(message)
        } else if lower.contains("permission denied") {
            SpawnError::PermissionDenied(message)
        } else if lower.contains("too many") || lower.contains("resource") {
            SpawnError::ResourceLimit(message)
        } else {
            SpawnError::Other(message)
        }
    }

    pub(crate) fn from_io(context: &str, err: &io::Error) -> Self {
        let message = format!("{context}: {err}");
        match err.kind() {
            io::ErrorKind::NotFound => SpawnError::NotFound(message),
            io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied(message),
            io::ErrorKind::OutOfMemory | io::ErrorKind::WouldBlock => {
                SpawnError::ResourceLimit(message)
            }
            _ if is_resource_limit(err) => SpawnError::ResourceLimit(message),
            _ => SpawnError::Other(message),
        }
    }
}

#[cfg(unix)]
fn is_resource_limit(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EAGAIN || code == libc::ENFILE || code == libc::EMFILE
    )
}

#[cfg(not(unix))]
fn is_resource_limit(_err: &io::Error) -> bool {
    false
}

/// Failure on an established PTY.
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("PTY I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),

    #[error("PTY write endpoint is closed")]
    WriteClosed,

    #[error("PTY terminate failed: {0}")]
    TerminateFailed(String),
}

/// Rejected lifecycle transition.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("session {id}: invalid transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub id: SessionId,
    pub from: SessionState,
    pub to: SessionState,
}

/// Errors returned synchronously by [`crate::Registry`] operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("invalid dimensions {rows}x{cols}: rows and columns must be positive")]
    InvalidDimensions { rows: i64, cols: i64 },

    #[error("session {id} input queue full, accepted {accepted} bytes")]
    Backpressure { id: SessionId, accepted: usize },

    #[error("session {id}: {source}")]
    Io {
        id: SessionId,
        #[source]
        source: PtyError,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("session {0} lock poisoned")]
    Poisoned(SessionId),
}

impl RegistryError {
    /// Stable machine-readable kind, used by the host protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Spawn(_) => "spawn_error",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::InvalidDimensions { .. } => "invalid_dimensions",
            RegistryError::Backpressure { .. } => "backpressure",
            RegistryError::Io { .. } | RegistryError::Transition(_) | RegistryError::Poisoned(_) => {
                "io_error"
            }
        }
    }
}
