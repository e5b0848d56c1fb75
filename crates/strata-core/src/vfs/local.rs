//! Local filesystem backed by a directory on disk.
//!
//! Maps `FsPath` values to OS paths under a root directory. This is what the
//! file server serves; versioned files appear as [`VersionedFile`]
//! directories that are reported as single "other" entries.
//!
//! The inherent methods are blocking. The [`FileSystem`] impl moves them onto
//! tokio's blocking pool.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::backend::{BoxFuture, FileSystem};
use super::path::{FsPath, PathFactory};
use super::types::FileMetadata;
use super::version::{VersionToken, split_versioned_path};
use crate::error::{Error, Result};
use crate::safe_io;
use crate::store::VersionedFile;

struct LocalIdentity(String);

impl PathFactory for LocalIdentity {
    fn identity(&self) -> &str {
        &self.0
    }
}

/// Convert OS metadata into the wire form.
pub(crate) fn metadata_from_fs(name: &str, meta: &fs::Metadata) -> FileMetadata {
    let file_type = meta.file_type();
    FileMetadata {
        name: name.to_string(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        creation_time: meta.created().ok().map(DateTime::<Utc>::from),
        last_modified_time: meta.modified().ok().map(DateTime::<Utc>::from),
        last_access_time: meta.accessed().ok().map(DateTime::<Utc>::from),
        is_regular_file: file_type.is_file(),
        is_directory: file_type.is_dir(),
        is_symbolic_link: file_type.is_symlink(),
        is_other: !(file_type.is_file() || file_type.is_dir() || file_type.is_symlink()),
        file_key: file_key(meta),
        children: None,
        is_versioned_file: false,
    }
}

#[cfg(unix)]
fn file_key(meta: &fs::Metadata) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    Some(format!("{}:{}", meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_key(_meta: &fs::Metadata) -> Option<String> {
    None
}

/// Directory-backed filesystem.
///
/// All paths resolve relative to `root`: with `root = /srv/files`, the path
/// `/shared/a.txt` maps to `/srv/files/shared/a.txt`.
#[derive(Clone)]
pub struct LocalFileSystem {
    factory: Arc<dyn PathFactory>,
    root: PathBuf,
}

impl LocalFileSystem {
    /// Open (creating if needed) a filesystem rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        let factory: Arc<dyn PathFactory> =
            Arc::new(LocalIdentity(format!("file://{}", root.display())));
        Ok(Self { factory, root })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// Map a path to an OS path under the root.
    ///
    /// Relative paths are taken from the root. Paths from another
    /// filesystem, paths that climb above the root, and names containing
    /// NUL are rejected. So is anything inside a versioned file: its
    /// revisions and pointers are only reachable through [`VersionedFile`].
    pub(crate) fn os_path(&self, path: &FsPath) -> Result<PathBuf> {
        if path.identity() != self.factory.identity() {
            return Err(Error::IncompatiblePath(format!(
                "{path} belongs to {}",
                path.identity()
            )));
        }
        let normalized = path.to_absolute_path().normalize();
        let mut os = self.root.clone();
        for (depth, segment) in normalized.segments().iter().enumerate() {
            if segment == ".." || segment.contains('\0') {
                return Err(Error::NotFound(format!("invalid path {path}")));
            }
            if depth > 0 && VersionedFile::is_versioned(&os) {
                let parent = normalized.segments()[..depth].join("/");
                return Err(Error::NotDirectory(format!("/{parent}")));
            }
            os.push(segment);
        }
        Ok(os)
    }

    fn label(path: &FsPath) -> String {
        path.to_absolute_path().normalize().to_string()
    }

    /// Metadata of one entry. Versioned files report their default revision.
    pub fn stat(&self, path: &FsPath) -> Result<FileMetadata> {
        let os = self.os_path(path)?;
        self.describe(&os, &Self::label(path))
    }

    fn describe(&self, os: &Path, label: &str) -> Result<FileMetadata> {
        let meta = fs::symlink_metadata(os).map_err(|e| Error::from_io(e, label))?;
        if meta.is_dir() && VersionedFile::is_versioned(os) {
            return VersionedFile::open(os, label)?.summary_metadata();
        }
        let name = os
            .file_name()
            .filter(|_| os != self.root)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(metadata_from_fs(&name, &meta))
    }

    /// Metadata of every child of `dir`, sorted by name.
    ///
    /// In-flight temporary files are skipped. A versioned file is not a
    /// directory for listing purposes.
    pub fn list_dir(&self, dir: &FsPath) -> Result<Vec<FileMetadata>> {
        let os = self.os_path(dir)?;
        let label = Self::label(dir);
        let meta = fs::metadata(&os).map_err(|e| Error::from_io(e, &label))?;
        if !meta.is_dir() || VersionedFile::is_versioned(&os) {
            return Err(Error::NotDirectory(label));
        }

        let mut children = Vec::new();
        for entry in fs::read_dir(&os)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if safe_io::is_temporary_name(&name) {
                continue;
            }
            let child_label = format!("{}/{}", label.trim_end_matches('/'), name);
            match self.describe(&entry.path(), &child_label) {
                Ok(metadata) => children.push(metadata),
                // removed between read_dir and stat
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    /// Whole file contents.
    ///
    /// A versioned file yields its default revision; a missing path of the
    /// form `name(version).ext` yields that revision of `name.ext`.
    pub fn read_file(&self, path: &FsPath) -> Result<Vec<u8>> {
        let os = self.os_path(path)?;
        let label = Self::label(path);
        match fs::symlink_metadata(&os) {
            Ok(meta) if meta.is_dir() => {
                if VersionedFile::is_versioned(&os) {
                    VersionedFile::open(&os, &label)?.read(VersionToken::Default)
                } else {
                    Err(Error::IsDirectory(label))
                }
            }
            Ok(_) => fs::read(&os).map_err(|e| Error::from_io(e, &label)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => match split_versioned_path(path) {
                Ok((base, Some(token))) => self.versioned_file(&base)?.read(token),
                _ => Err(Error::NotFound(label)),
            },
            Err(e) => Err(Error::from_io(e, label)),
        }
    }

    /// Write a whole file; the parent directory must exist.
    ///
    /// Writing onto a versioned file adds a revision and returns its number.
    /// With `create_new`, an existing target fails with
    /// [`Error::AlreadyExists`].
    pub fn write_file(&self, path: &FsPath, data: &[u8], create_new: bool) -> Result<Option<u32>> {
        let os = self.os_path(path)?;
        let label = Self::label(path);
        if os == self.root {
            return Err(Error::IsDirectory(label));
        }
        self.require_parent(&os, path)?;

        match fs::symlink_metadata(&os) {
            Ok(_) if create_new => Err(Error::AlreadyExists(label)),
            Ok(meta) if meta.is_dir() => {
                if VersionedFile::is_versioned(&os) {
                    let version = VersionedFile::open(&os, &label)?.add_version(data, false)?;
                    Ok(Some(version))
                } else {
                    Err(Error::IsDirectory(label))
                }
            }
            Ok(_) => {
                safe_io::atomic_write(&os, data)?;
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                safe_io::atomic_write(&os, data)?;
                Ok(None)
            }
            Err(e) => Err(Error::from_io(e, label)),
        }
    }

    /// Create a single directory.
    pub fn mkdir(&self, path: &FsPath) -> Result<()> {
        let os = self.os_path(path)?;
        fs::create_dir(&os).map_err(|e| Error::from_io(e, Self::label(path)))
    }

    /// Delete a file, an empty directory, or a versioned file with all its
    /// revisions.
    pub fn remove(&self, path: &FsPath) -> Result<()> {
        let os = self.os_path(path)?;
        let label = Self::label(path);
        if os == self.root {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "the root cannot be deleted",
            )));
        }
        let meta = fs::symlink_metadata(&os).map_err(|e| Error::from_io(e, &label))?;
        if meta.is_dir() {
            if VersionedFile::is_versioned(&os) {
                VersionedFile::open(&os, &label)?.delete()
            } else {
                fs::remove_dir(&os).map_err(|e| Error::from_io(e, label))
            }
        } else {
            fs::remove_file(&os).map_err(|e| Error::from_io(e, label))
        }
    }

    /// Move `src` to `dst`; `dst` must not exist.
    pub fn move_entry(&self, src: &FsPath, dst: &FsPath) -> Result<()> {
        let src_os = self.os_path(src)?;
        let dst_os = self.os_path(dst)?;
        fs::symlink_metadata(&src_os).map_err(|e| Error::from_io(e, Self::label(src)))?;
        if fs::symlink_metadata(&dst_os).is_ok() {
            return Err(Error::AlreadyExists(Self::label(dst)));
        }
        self.require_parent(&dst_os, dst)?;
        fs::rename(&src_os, &dst_os)?;
        Ok(())
    }

    pub fn contains(&self, path: &FsPath) -> Result<bool> {
        let os = self.os_path(path)?;
        Ok(fs::symlink_metadata(os).is_ok())
    }

    /// Open the versioned file at `path`.
    pub fn versioned_file(&self, path: &FsPath) -> Result<VersionedFile> {
        VersionedFile::open(&self.os_path(path)?, &Self::label(path))
    }

    /// Create a versioned file whose first revision is `content`.
    pub fn create_versioned(&self, path: &FsPath, content: &[u8]) -> Result<VersionedFile> {
        let os = self.os_path(path)?;
        self.require_parent(&os, path)?;
        VersionedFile::create(&os, &Self::label(path), content)
    }

    /// Convert the plain file at `path` in place.
    pub fn convert_to_versioned(&self, path: &FsPath) -> Result<VersionedFile> {
        VersionedFile::convert(&self.os_path(path)?, &Self::label(path))
    }

    fn require_parent(&self, os: &Path, path: &FsPath) -> Result<()> {
        match os.parent() {
            Some(parent) if parent.is_dir() && !VersionedFile::is_versioned(parent) => Ok(()),
            _ => Err(Error::NotFound(
                path.parent()
                    .map(|p| Self::label(&p))
                    .unwrap_or_else(|| Self::label(path)),
            )),
        }
    }

    fn blocking<'a, T, F>(&'a self, f: F) -> BoxFuture<'a, Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(&LocalFileSystem) -> Result<T> + Send + 'static,
    {
        let fs = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || f(&fs))
                .await
                .map_err(|e| Error::Io(io::Error::other(format!("join error: {e}"))))?
        })
    }
}

impl FileSystem for LocalFileSystem {
    fn path(&self, raw: &str) -> FsPath {
        FsPath::parse(Arc::clone(&self.factory), raw)
    }

    fn list<'a>(&'a self, dir: &'a FsPath) -> BoxFuture<'a, Result<Vec<FsPath>>> {
        let dir = dir.clone();
        self.blocking(move |fs| {
            let names = fs.list_dir(&dir)?;
            Ok(names.into_iter().map(|m| dir.join(&m.name)).collect())
        })
    }

    fn metadata<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<FileMetadata>> {
        let path = path.clone();
        self.blocking(move |fs| fs.stat(&path))
    }

    fn read<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<Vec<u8>>> {
        let path = path.clone();
        self.blocking(move |fs| fs.read_file(&path))
    }

    fn write<'a>(&'a self, path: &'a FsPath, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        let path = path.clone();
        // the blocking closure needs 'static data
        let data = data.to_vec();
        self.blocking(move |fs| fs.write_file(&path, &data, false).map(|_| ()))
    }

    fn create_directory<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<()>> {
        let path = path.clone();
        self.blocking(move |fs| fs.mkdir(&path))
    }

    fn delete<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<()>> {
        let path = path.clone();
        self.blocking(move |fs| fs.remove(&path))
    }

    fn rename<'a>(&'a self, src: &'a FsPath, dst: &'a FsPath) -> BoxFuture<'a, Result<()>> {
        let (src, dst) = (src.clone(), dst.clone());
        self.blocking(move |fs| fs.move_entry(&src, &dst))
    }

    fn exists<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<bool>> {
        let path = path.clone();
        self.blocking(move |fs| fs.contains(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::path::tests::NamedFs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalFileSystem) {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new(dir.path()).unwrap();
        (dir, fs)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (_dir, fs) = setup();
        let path = fs.path("/test.txt");
        fs.write(&path, b"hello").await.unwrap();
        assert_eq!(fs.read(&path).await.unwrap(), b"hello");
        assert!(fs.exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_requires_parent() {
        let (_dir, fs) = setup();
        let err = fs.write(&fs.path("/missing/file.txt"), b"x").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(ref m) if m == "/missing"));
    }

    #[test]
    fn test_write_create_new_rejects_existing() {
        let (_dir, fs) = setup();
        let path = fs.path("/a.txt");
        fs.write_file(&path, b"1", true).unwrap();
        assert!(matches!(fs.write_file(&path, b"2", true), Err(Error::AlreadyExists(_))));
        assert_eq!(fs.read_file(&path).unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_list_sorted_and_skips_temporary_files() {
        let (dir, fs) = setup();
        fs.create_directory(&fs.path("/docs")).await.unwrap();
        fs.write(&fs.path("/docs/b.txt"), b"b").await.unwrap();
        fs.write(&fs.path("/docs/a.txt"), b"a").await.unwrap();
        std::fs::write(dir.path().join("docs/.c.txt.99.0.strata-tmp"), b"partial").unwrap();
        // an ordinary dot-file that happens to end in .tmp is user data
        std::fs::write(dir.path().join("docs/.draft.tmp"), b"mine").unwrap();

        let listed = fs.list(&fs.path("/docs")).await.unwrap();
        assert_eq!(
            listed,
            vec![fs.path("/docs/.draft.tmp"), fs.path("/docs/a.txt"), fs.path("/docs/b.txt")]
        );
    }

    #[test]
    fn test_list_file_is_not_directory() {
        let (_dir, fs) = setup();
        fs.write_file(&fs.path("/a.txt"), b"a", false).unwrap();
        assert!(matches!(fs.list_dir(&fs.path("/a.txt")), Err(Error::NotDirectory(_))));
        assert!(matches!(fs.list_dir(&fs.path("/nope")), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_versioned_file_reported_as_other() {
        let (_dir, fs) = setup();
        let path = fs.path("/v.txt");
        fs.create_versioned(&path, b"first").unwrap();

        let meta = fs.stat(&path).unwrap();
        assert!(meta.is_versioned_file);
        assert!(meta.is_other);
        assert_eq!(meta.name, "v.txt");

        let children = fs.list_dir(&fs.path("/")).unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].is_versioned_file);
        assert!(matches!(fs.list_dir(&path), Err(Error::NotDirectory(_))));
    }

    #[test]
    fn test_write_onto_versioned_adds_revision() {
        let (_dir, fs) = setup();
        let path = fs.path("/v.txt");
        fs.create_versioned(&path, b"first").unwrap();
        assert_eq!(fs.write_file(&path, b"second", false).unwrap(), Some(2));

        // plain reads see the default revision, which is still 1
        assert_eq!(fs.read_file(&path).unwrap(), b"first");
        assert_eq!(fs.read_file(&fs.path("/v(latest).txt")).unwrap(), b"second");
        assert_eq!(fs.read_file(&fs.path("/v(2).txt")).unwrap(), b"second");
        assert!(matches!(
            fs.read_file(&fs.path("/v(5).txt")),
            Err(Error::InvalidVersion(_))
        ));
        assert_eq!(
            fs.versioned_file(&path).unwrap().read(VersionToken::Explicit(1)).unwrap(),
            b"first"
        );
    }

    #[test]
    fn test_versioned_internals_unreachable() {
        let (_dir, fs) = setup();
        let path = fs.path("/v.txt");
        fs.create_versioned(&path, b"first").unwrap();
        fs.write_file(&path, b"second", false).unwrap();
        fs.write_file(&fs.path("/plain"), b"p", false).unwrap();

        for inner in ["/v.txt/1", "/v.txt/default", "/v.txt/.meta.json", "/v.txt/x/y"] {
            let inner = fs.path(inner);
            assert!(matches!(fs.os_path(&inner), Err(Error::NotDirectory(ref m)) if m == "/v.txt"));
            assert!(fs.remove(&inner).is_err());
            assert!(fs.read_file(&inner).is_err());
        }
        assert!(fs.mkdir(&fs.path("/v.txt/x")).is_err());
        assert!(fs.move_entry(&fs.path("/v.txt/2"), &fs.path("/stolen")).is_err());
        assert!(fs.move_entry(&fs.path("/plain"), &fs.path("/v.txt/3")).is_err());
        assert!(!fs.contains(&fs.path("/stolen")).unwrap());

        let versioned = fs.versioned_file(&path).unwrap();
        assert_eq!(versioned.revisions().unwrap(), vec![1, 2]);
        assert_eq!(versioned.latest().unwrap(), 2);
        // the versioned file itself stays addressable
        assert!(fs.os_path(&path).is_ok());
    }

    #[test]
    fn test_convert_and_delete_versioned() {
        let (_dir, fs) = setup();
        let path = fs.path("/plain.txt");
        fs.write_file(&path, b"data", false).unwrap();
        fs.convert_to_versioned(&path).unwrap();
        assert!(fs.stat(&path).unwrap().is_versioned_file);
        fs.remove(&path).unwrap();
        assert!(!fs.contains(&path).unwrap());
    }

    #[tokio::test]
    async fn test_delete_non_empty_directory_fails() {
        let (_dir, fs) = setup();
        fs.create_directory(&fs.path("/d")).await.unwrap();
        fs.write(&fs.path("/d/x"), b"x").await.unwrap();
        assert!(fs.delete(&fs.path("/d")).await.is_err());
        fs.delete(&fs.path("/d/x")).await.unwrap();
        fs.delete(&fs.path("/d")).await.unwrap();
        assert!(!fs.exists(&fs.path("/d")).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_refuses_existing_target() {
        let (_dir, fs) = setup();
        fs.write(&fs.path("/a"), b"a").await.unwrap();
        fs.write(&fs.path("/b"), b"b").await.unwrap();
        let err = fs.rename(&fs.path("/a"), &fs.path("/b")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        fs.rename(&fs.path("/a"), &fs.path("/c")).await.unwrap();
        assert_eq!(fs.read(&fs.path("/c")).await.unwrap(), b"a");
        assert!(!fs.exists(&fs.path("/a")).await.unwrap());
    }

    #[test]
    fn test_os_path_rejects_escape_and_foreign_paths() {
        let (dir, fs) = setup();
        assert!(fs.os_path(&fs.path("/../etc/passwd")).is_err());
        assert_eq!(
            fs.os_path(&fs.path("/a/./b/../c")).unwrap(),
            dir.path().canonicalize().unwrap().join("a").join("c")
        );
        let foreign = FsPath::parse(Arc::new(NamedFs("other")), "/a");
        assert!(matches!(fs.os_path(&foreign), Err(Error::IncompatiblePath(_))));
    }

    #[tokio::test]
    async fn test_usable_as_trait_object() {
        let (_dir, local) = setup();
        let fs: Box<dyn FileSystem> = Box::new(local);
        let path = fs.path("/obj.txt");
        fs.write(&path, b"dyn").await.unwrap();
        assert_eq!(fs.metadata(&path).await.unwrap().size, 3);
    }
}
