//! Remote-file client library abstraction.
//!
//! The request manager never talks to the wire itself; it drives an external
//! XRootD-style client library through the narrow traits in this module. The
//! abstraction allows for dependency injection and easier testing by enabling
//! mock client libraries in tests.
//!
//! The client library is expected to provide:
//!
//! - redirected opens ([`FileClient::open`]), where the redirector maps a
//!   logical URL onto a concrete data server,
//! - positioned and scatter reads on an open handle ([`RemoteFile`]),
//! - property queries (`DataServer`, `LastURL`) on an open handle,
//! - a filesystem-level channel for out-of-band info ([`FilesystemClient`]).

pub mod url;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::request::IoSegment;

/// Outcome classification reported by the client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Operation succeeded.
    Ok,
    /// Transport-level failure (connection lost, refused, reset).
    ConnectionError,
    /// The operation did not complete within the client library's window.
    Timeout,
    /// The server's response was structurally invalid.
    InvalidResponse,
    /// The server reported an error for a well-formed exchange.
    ServerError,
}

/// Status of a client-library operation: a code, the originating errno when
/// one exists, and the library's human-readable rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub errno: i32,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            errno: 0,
            message: String::new(),
        }
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            errno: 0,
            message: message.into(),
        }
    }

    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = errno;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Open mode bits passed through to the client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const NONE: OpenFlags = OpenFlags(0);
    pub const READ: OpenFlags = OpenFlags(0x01);
}

impl std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Permission bits passed through to the client library, octal on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessMode(pub u32);

impl AccessMode {
    pub const NONE: AccessMode = AccessMode(0);
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0{:o}", self.0)
    }
}

/// Error returned by a failed open attempt.
///
/// A redirected open can fail after the redirector has already routed the
/// attempt to a concrete data server; the error carries where the attempt
/// ended up so the caller can exclude that server from the next try.
#[derive(Debug, Clone)]
pub struct OpenError {
    /// Status reported by the client library.
    pub status: Status,
    /// `DataServer` property of the failed attempt, when known.
    pub data_server: Option<String>,
    /// `LastURL` property of the failed attempt, when known.
    pub last_url: Option<String>,
}

/// An open remote file handle.
///
/// Reads resolve to the byte count actually transferred; delivery into the
/// caller's buffers is the client library's concern.
#[async_trait]
pub trait RemoteFile: Send + Sync {
    /// Reads `len` bytes at `offset`.
    async fn read(&self, offset: u64, len: u64) -> Result<u64, Status>;

    /// Issues a scatter read for `segments`, returning total bytes read.
    async fn vector_read(&self, segments: &[IoSegment]) -> Result<u64, Status>;

    /// Queries a named handle property (`DataServer`, `LastURL`, ...).
    fn property(&self, name: &str) -> Option<String>;
}

/// Filesystem-level channel to one storage server.
#[async_trait]
pub trait FilesystemClient: Send + Sync {
    /// Submits an out-of-band info string (monitoring id) to the server.
    async fn send_info(&self, info: &str) -> Result<(), Status>;
}

/// Entry point into the client library.
#[async_trait]
pub trait FileClient: Send + Sync {
    /// Opens `url` through the redirector, resolving when the open completes
    /// on a concrete data server.
    async fn open(
        &self,
        url: &str,
        flags: OpenFlags,
        perms: AccessMode,
    ) -> Result<Arc<dyn RemoteFile>, OpenError>;

    /// Constructs a filesystem client for the server named by `url`.
    fn filesystem(&self, url: &str) -> Arc<dyn FilesystemClient>;
}
