//! xrdmux - adaptive multi-source reads over redirected storage
//!
//! This library multiplexes reads on one logical remote file across up to two
//! replicas ("sources") of an XRootD-style redirected storage federation. The
//! replica pool is rebalanced continuously from per-source quality measured
//! on the live traffic, vector reads are split between replicas in proportion
//! to quality, and a replica that fails a read is disabled and transparently
//! replaced through the redirector.
//!
//! The wire protocol itself lives behind the narrow traits in [`client`]; any
//! client-library binding that can open, read, and answer property queries
//! plugs in there.
//!
//! # High-Level API
//!
//! ```ignore
//! use std::sync::Arc;
//! use xrdmux::{AccessMode, IoSegment, OpenFlags, RequestManager};
//!
//! let client = Arc::new(MyXrootdBinding::new()?);
//! let manager = RequestManager::open(
//!     "root://redirector.example/store/file.dat",
//!     OpenFlags::READ,
//!     AccessMode::NONE,
//!     client,
//! )
//! .await?;
//!
//! let bytes = manager.read(0, 1 << 20).await?;
//! let scattered = manager
//!     .read_vector(vec![IoSegment::new(0, 65536), IoSegment::new(1 << 20, 65536)])
//!     .await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
mod monitor;
pub mod request;
pub mod source;
pub mod split;

pub use client::{
    AccessMode, FileClient, FilesystemClient, OpenError, OpenFlags, RemoteFile, Status, StatusCode,
};
pub use config::Settings;
pub use error::{ErrorDetails, XrdError};
pub use manager::RequestManager;
pub use request::IoSegment;
pub use source::Source;

/// Version of the xrdmux library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
