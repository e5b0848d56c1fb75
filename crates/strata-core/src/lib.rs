//! strata-core: remote filesystem with versioned files and an HTTP cache
//!
//! Provides a filesystem-agnostic path model, a client that talks to a file
//! server over HTTP through a semantic response cache, and the server side:
//! a directory-backed store whose versioned files keep every revision.
//!
//! # Quick Start
//!
//! ```no_run
//! use strata_core::{FileSystem, FsConfig, OpenOption, RemoteFileSystem};
//!
//! #[tokio::main]
//! async fn main() -> strata_core::Result<()> {
//!     let fs = RemoteFileSystem::open(FsConfig::new("localhost", 8080))?;
//!     let notes = fs.path("/notes.txt");
//!     fs.write_bytes(&notes, b"first draft\n", &[OpenOption::CreateOrUpdate]).await?;
//!     fs.write_bytes(&notes, b"second draft\n", &[]).await?;
//!
//!     // the first revision, by path syntax
//!     let first = fs.read_bytes(&fs.path("/notes(1).txt"), &[]).await?;
//!     assert_eq!(first, b"first draft\n");
//!     fs.close()
//! }
//! ```
//!
//! [`RemoteFileSystem::path`](vfs::FileSystem::path) comes from the
//! [`FileSystem`] trait, which the server's [`LocalFileSystem`] implements too.

pub mod config;
pub mod diff;
pub mod error;
pub mod http_cache;
pub mod protocol;
pub mod remote;
pub mod safe_io;
pub mod server;
pub mod store;
pub mod vfs;

pub use config::{CacheConfig, CacheMode, FallbackPolicy, FsConfig};
pub use diff::{DiffEngine, UnifiedDiff};
pub use error::{Error, ErrorKind, Result};
pub use http_cache::{CacheEntry, HttpCache};
pub use remote::{RemoteFileSystem, RemoteReader, RemoteWriter, WriteOutcome};
pub use server::FileServer;
pub use store::VersionedFile;
pub use vfs::{
    Attributes, FileMetadata, FileSystem, FsPath, LocalFileSystem, OpenOption, VersionSet,
    VersionToken,
};
