//! Filesystem abstraction: paths, revision addressing, metadata, and the
//! [`FileSystem`] trait with its local implementation.
//!
//! # Overview
//!
//! - [`FsPath`] is the path value; every filesystem hands out paths bound to
//!   its own [`PathFactory`] so that paths from different filesystems never
//!   compare equal.
//! - [`split_versioned_path`] interprets `name(version).ext` names.
//! - [`FileSystem`] is implemented by [`LocalFileSystem`] (a directory on
//!   disk) and by the remote client in `crate::remote`.

mod backend;
pub(crate) mod local;
mod options;
pub(crate) mod path;
mod types;
mod version;

pub use backend::{BoxFuture, FileSystem};
pub use local::LocalFileSystem;
pub use options::{DEFAULT_DIFF_CONTEXT, OpenOption, ReadOptions, WriteOptions};
pub use path::{FsPath, PathFactory, SEPARATOR};
pub use types::{Attributes, EntryKind, FileMetadata, VersionEntry, VersionSet};
pub use version::{VersionToken, split_versioned_name, split_versioned_path};
