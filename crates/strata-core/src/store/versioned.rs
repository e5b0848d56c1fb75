//! On-disk versioned files.
//!
//! A versioned file is a directory:
//!
//! ```text
//! report.txt/
//! ├── .versioned     # marker; only directories carrying it are versioned files
//! ├── .meta.json     # hidden flags and comments per revision
//! ├── .lock          # writer lock (fs2)
//! ├── 1, 2, 3, ...   # immutable, read-only revisions
//! ├── latest         # pointer: number of the newest revision
//! └── default        # pointer: number of the canonical revision
//! ```
//!
//! Pointers are small files replaced by atomic rename, so a concurrent reader
//! of `default` sees either the old or the new number. Mutations serialise on
//! the writer lock; readers never take it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::diff::DiffEngine;
use crate::error::{Error, Result};
use crate::safe_io::{self, FileLock};
use crate::vfs::local::metadata_from_fs;
use crate::vfs::{FileMetadata, VersionEntry, VersionSet, VersionToken};

const MARKER: &str = ".versioned";
const NOTES: &str = ".meta.json";
const LOCK: &str = ".lock";
const LATEST: &str = "latest";
const DEFAULT: &str = "default";

/// Per-revision annotations that never create a new revision.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RevisionNotes {
    #[serde(default)]
    hidden: BTreeSet<u32>,
    #[serde(default)]
    comments: BTreeMap<u32, String>,
}

/// Handle on one versioned file directory.
///
/// `label` is the caller-facing name used in error messages, so server
/// paths never leak to clients.
#[derive(Debug, Clone)]
pub struct VersionedFile {
    dir: PathBuf,
    label: String,
}

impl VersionedFile {
    /// Whether `dir` carries the versioned-file marker.
    pub fn is_versioned(dir: &Path) -> bool {
        dir.join(MARKER).is_file()
    }

    /// Open an existing versioned file.
    pub fn open(dir: &Path, label: &str) -> Result<Self> {
        match fs::metadata(dir) {
            Err(e) => Err(Error::from_io(e, label)),
            Ok(meta) if meta.is_dir() && Self::is_versioned(dir) => Ok(Self {
                dir: dir.to_path_buf(),
                label: label.to_string(),
            }),
            Ok(_) => Err(Error::NotVersionedFile(label.to_string())),
        }
    }

    /// Create a new versioned file whose revision 1 is `content`.
    ///
    /// Fails with [`Error::AlreadyExists`] if anything exists at `dir`.
    pub fn create(dir: &Path, label: &str, content: &[u8]) -> Result<Self> {
        fs::create_dir(dir).map_err(|e| Error::from_io(e, label))?;
        let file = Self {
            dir: dir.to_path_buf(),
            label: label.to_string(),
        };
        file.write_revision(1, content)?;
        file.initialise()?;
        log::debug!("created versioned file {label}");
        Ok(file)
    }

    /// Turn the plain file at `path` into a versioned file with a single
    /// revision holding its bytes.
    pub fn convert(path: &Path, label: &str) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|e| Error::from_io(e, label))?;
        if meta.is_dir() {
            return Err(if Self::is_versioned(path) {
                Error::AlreadyExists(format!("{label} is already a versioned file"))
            } else {
                Error::IsDirectory(label.to_string())
            });
        }
        if path.file_name().is_none() {
            return Err(Error::NotFound(label.to_string()));
        }

        // Assemble the directory beside the file, then swap it in by rename.
        let staging = safe_io::temporary_sibling(path);
        fs::create_dir(&staging)?;
        let staged = Self {
            dir: staging.clone(),
            label: label.to_string(),
        };
        let revision = staged.revision_path(1);
        if let Err(e) = fs::rename(path, &revision) {
            let _ = fs::remove_dir_all(&staging);
            return Err(Error::from_io(e, label));
        }
        // a concurrent conversion finished first and we moved its directory
        if revision.is_dir() {
            if fs::rename(&revision, path).is_ok() {
                let _ = fs::remove_dir_all(&staging);
            }
            return Err(Error::AlreadyExists(format!(
                "{label} is already a versioned file"
            )));
        }
        let swapped = make_read_only(&revision)
            .map_err(Error::from)
            .and_then(|()| staged.initialise())
            .and_then(|()| fs::rename(&staging, path).map_err(Error::from));
        if let Err(e) = swapped {
            // put the original bytes back where the caller left them
            if restore_plain(&revision, path, meta.permissions()) {
                let _ = fs::remove_dir_all(&staging);
            }
            return Err(e);
        }

        log::debug!("converted {label} to a versioned file");
        Ok(Self {
            dir: path.to_path_buf(),
            label: label.to_string(),
        })
    }

    /// Point both pointers at revision 1 and mark the directory. The marker
    /// goes last so a half-built directory never qualifies.
    fn initialise(&self) -> Result<()> {
        self.write_pointer(LATEST, 1)?;
        self.write_pointer(DEFAULT, 1)?;
        fs::write(self.dir.join(MARKER), b"")?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// File name of the versioned file itself.
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn revision_path(&self, version: u32) -> PathBuf {
        self.dir.join(version.to_string())
    }

    pub fn latest(&self) -> Result<u32> {
        self.read_pointer(LATEST)
    }

    pub fn default_version(&self) -> Result<u32> {
        self.read_pointer(DEFAULT)
    }

    /// Existing revision numbers, ascending.
    pub fn revisions(&self) -> Result<Vec<u32>> {
        let mut revisions: Vec<u32> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|n| *n >= 1)
            .collect();
        revisions.sort_unstable();
        Ok(revisions)
    }

    /// Revision number a token selects.
    pub fn resolve(&self, token: VersionToken) -> Result<u32> {
        match token {
            VersionToken::Latest => self.latest(),
            VersionToken::Default => self.default_version(),
            VersionToken::Explicit(n) if n >= 1 && self.revision_path(n).is_file() => Ok(n),
            VersionToken::Explicit(n) => Err(Error::InvalidVersion(format!(
                "{} has no revision {n}",
                self.label
            ))),
        }
    }

    pub fn read(&self, token: VersionToken) -> Result<Vec<u8>> {
        let version = self.resolve(token)?;
        Ok(fs::read(self.revision_path(version))?)
    }

    /// Append a revision and repoint `latest`; `default` is untouched.
    ///
    /// With `only_if_changed`, content identical to the latest revision
    /// writes nothing and returns the latest number.
    pub fn add_version(&self, content: &[u8], only_if_changed: bool) -> Result<u32> {
        let _lock = self.lock()?;
        let latest = self.latest()?;
        if only_if_changed && fs::read(self.revision_path(latest))? == content {
            log::debug!("{}: content unchanged, keeping revision {latest}", self.label);
            return Ok(latest);
        }
        let highest = self.revisions()?.last().copied().unwrap_or(0);
        let next = highest.max(latest) + 1;
        self.write_revision(next, content)?;
        self.write_pointer(LATEST, next)?;
        log::debug!("{}: added revision {next}", self.label);
        Ok(next)
    }

    /// Repoint `default` at an existing revision.
    pub fn set_default_version(&self, version: u32) -> Result<()> {
        let _lock = self.lock()?;
        let version = self.resolve(VersionToken::Explicit(version))?;
        self.write_pointer(DEFAULT, version)
    }

    pub fn set_hidden(&self, version: u32, hidden: bool) -> Result<()> {
        let _lock = self.lock()?;
        let version = self.resolve(VersionToken::Explicit(version))?;
        let mut notes = self.read_notes()?;
        if hidden {
            notes.hidden.insert(version);
        } else {
            notes.hidden.remove(&version);
        }
        self.write_notes(&notes)
    }

    /// Set or, with an empty string, clear a revision's comment.
    pub fn set_comment(&self, version: u32, comment: &str) -> Result<()> {
        let _lock = self.lock()?;
        let version = self.resolve(VersionToken::Explicit(version))?;
        let mut notes = self.read_notes()?;
        if comment.is_empty() {
            notes.comments.remove(&version);
        } else {
            notes.comments.insert(version, comment.to_string());
        }
        self.write_notes(&notes)
    }

    pub fn revision_metadata(&self, version: u32) -> Result<FileMetadata> {
        let meta = fs::metadata(self.revision_path(version))?;
        Ok(metadata_from_fs(&self.name(), &meta))
    }

    /// Metadata reported for the versioned file as a whole: the default
    /// revision's size and times, flagged as "other" and versioned.
    pub fn summary_metadata(&self) -> Result<FileMetadata> {
        let mut metadata = self.revision_metadata(self.default_version()?)?;
        let dir_meta = fs::metadata(&self.dir)?;
        metadata.file_key = metadata_from_fs(&self.name(), &dir_meta).file_key;
        metadata.is_regular_file = false;
        metadata.is_other = true;
        metadata.is_versioned_file = true;
        Ok(metadata)
    }

    pub fn version_set(&self) -> Result<VersionSet> {
        let notes = self.read_notes()?;
        let versions = self
            .revisions()?
            .into_iter()
            .map(|version| {
                Ok(VersionEntry {
                    version,
                    metadata: self.revision_metadata(version)?,
                    hidden: notes.hidden.contains(&version),
                    comment: notes.comments.get(&version).cloned().unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(VersionSet {
            default: self.default_version()?,
            latest: self.latest()?,
            versions,
        })
    }

    /// Unified diff between two revisions, line by line.
    pub fn diff(
        &self,
        from: VersionToken,
        to: VersionToken,
        context: usize,
        engine: &dyn DiffEngine,
    ) -> Result<Vec<String>> {
        let (a, b) = (self.resolve(from)?, self.resolve(to)?);
        let lines_a = text_lines(&fs::read(self.revision_path(a))?);
        let lines_b = text_lines(&fs::read(self.revision_path(b))?);
        let name = self.name();
        Ok(engine.diff(
            &format!("{name}({a})"),
            &lines_a,
            &format!("{name}({b})"),
            &lines_b,
            context,
        ))
    }

    /// Remove the directory and every revision.
    pub fn delete(self) -> Result<()> {
        fs::remove_dir_all(&self.dir)?;
        log::debug!("deleted versioned file {}", self.label);
        Ok(())
    }

    fn lock(&self) -> Result<FileLock> {
        Ok(FileLock::acquire(&self.dir.join(LOCK))?)
    }

    fn write_revision(&self, version: u32, content: &[u8]) -> Result<()> {
        let path = self.revision_path(version);
        if path.exists() {
            return Err(Error::AlreadyExists(format!(
                "{} revision {version}",
                self.label
            )));
        }
        safe_io::atomic_write(&path, content)?;
        make_read_only(&path)?;
        Ok(())
    }

    fn read_pointer(&self, name: &str) -> Result<u32> {
        let raw = fs::read_to_string(self.dir.join(name)).map_err(|e| Error::from_io(e, &self.label))?;
        raw.trim().parse::<u32>().map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: corrupt {name} pointer {raw:?}", self.label),
            ))
        })
    }

    fn write_pointer(&self, name: &str, version: u32) -> Result<()> {
        safe_io::atomic_write(&self.dir.join(name), version.to_string().as_bytes())?;
        Ok(())
    }

    fn read_notes(&self) -> Result<RevisionNotes> {
        match fs::read(self.dir.join(NOTES)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RevisionNotes::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_notes(&self, notes: &RevisionNotes) -> Result<()> {
        safe_io::atomic_write_json(&self.dir.join(NOTES), notes)?;
        Ok(())
    }
}

fn make_read_only(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

/// Move a staged revision back to its plain location with its old permissions.
/// Leaves the staging directory alone and returns false if the move fails.
fn restore_plain(revision: &Path, path: &Path, permissions: fs::Permissions) -> bool {
    if revision.is_file() {
        let _ = fs::set_permissions(revision, permissions);
    }
    match fs::rename(revision, path) {
        Ok(()) => true,
        Err(e) => {
            log::warn!(
                "could not restore {} from {} after a failed conversion: {e}",
                path.display(),
                revision.display()
            );
            false
        }
    }
}

fn text_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}
