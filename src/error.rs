//! Error types surfaced by the request manager.
//!
//! Recoverable read failures are never surfaced to callers; they are retried
//! against a replacement source. What does surface is either an open-side
//! failure (terminal open, excluded-source violation, open timeout) or the
//! invalid-response read path, and every surfaced error carries the full open
//! parameters plus the source pools at the time of failure.

use crate::client::{AccessMode, OpenFlags, Status};
use std::fmt;
use thiserror::Error;

/// Diagnostic context carried by every surfaced error.
#[derive(Debug, Clone)]
pub struct ErrorDetails {
    /// Operation that failed (`open`, `read`, `readv`).
    pub operation: String,
    /// Requested file name / URL.
    pub name: String,
    pub flags: OpenFlags,
    pub perms: AccessMode,
    /// Underlying client-library status.
    pub status: Status,
    /// Ids of the active sources at the time of failure.
    pub active_sources: Vec<String>,
    /// Ids of the disabled sources at the time of failure.
    pub disabled_sources: Vec<String>,
    /// Additional context lines, most recent last.
    pub info: Vec<String>,
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(name='{}', flags={}, permissions={}) => error '{}' (errno={}, code={:?})",
            self.operation,
            self.name,
            self.flags,
            self.perms,
            self.status.message,
            self.status.errno,
            self.status.code
        )?;
        for source in &self.active_sources {
            write!(f, "; active source: {}", source)?;
        }
        for source in &self.disabled_sources {
            write!(f, "; disabled source: {}", source)?;
        }
        for line in &self.info {
            write!(f, "; {}", line)?;
        }
        Ok(())
    }
}

/// Errors raised by the request manager.
#[derive(Debug, Clone, Error)]
pub enum XrdError {
    /// Terminal open failure, excluded-source violation, or open timeout.
    #[error("file open error: {0}")]
    FileOpen(Box<ErrorDetails>),

    /// Structurally invalid read response, surfaced on its own path.
    #[error("file read error: {0}")]
    FileRead(Box<ErrorDetails>),
}

impl XrdError {
    /// The diagnostic context, whichever variant carries it.
    pub fn details(&self) -> &ErrorDetails {
        match self {
            XrdError::FileOpen(details) => details,
            XrdError::FileRead(details) => details,
        }
    }
}
