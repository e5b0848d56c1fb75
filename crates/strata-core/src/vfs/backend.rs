//! The filesystem trait: path operations independent of the backing store.
//!
//! Both the remote client and the server's local store implement it, so
//! code written against [`FileSystem`] works unchanged over HTTP or on disk.
//!
//! # Dyn-compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of `impl Future` so that
//! `Box<dyn FileSystem>` works. All input references share a single
//! lifetime `'a` so the returned future can borrow from both `&self` and
//! any path arguments.

use std::future::Future;
use std::pin::Pin;

use super::path::FsPath;
use super::types::FileMetadata;
use crate::error::Result;

/// Boxed, Send future returned by every trait method.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A hierarchical store addressed by [`FsPath`] values it creates itself.
pub trait FileSystem: Send + Sync {
    /// Path factory: parse a `/`-separated string into a path on this
    /// filesystem.
    fn path(&self, raw: &str) -> FsPath;

    /// Children of a directory, one path per entry.
    fn list<'a>(&'a self, dir: &'a FsPath) -> BoxFuture<'a, Result<Vec<FsPath>>>;

    fn metadata<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<FileMetadata>>;

    /// Whole contents of a file. Versioned files yield their default revision.
    fn read<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Replace (or create) a file's contents. Versioned files gain a revision.
    fn write<'a>(&'a self, path: &'a FsPath, data: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Create a single directory; the parent must exist.
    fn create_directory<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<()>>;

    /// Delete a file, an empty directory, or a whole versioned file.
    fn delete<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<()>>;

    /// Move `src` to `dst`. Fails if `dst` exists.
    fn rename<'a>(&'a self, src: &'a FsPath, dst: &'a FsPath) -> BoxFuture<'a, Result<()>>;

    fn exists<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<bool>>;
}
