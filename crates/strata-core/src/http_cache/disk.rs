//! Disk persistence for the HTTP cache.
//!
//! Layout under the cache location:
//!
//! ```text
//! .lock          # held for the store's whole lifetime
//! index.jsonl    # one record per entry
//! blobs/<sha256> # content, shared by identical bodies
//! ```
//!
//! The index is rewritten atomically on save; blobs no record references are
//! removed afterwards.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::entry::{CacheEntry, CacheKey};
use crate::error::{Error, Result};
use crate::safe_io::{self, FileLock};

const LOCK_FILE: &str = ".lock";
const INDEX_FILE: &str = "index.jsonl";
const BLOB_DIR: &str = "blobs";

/// Alternate locations tried when the primary one is locked.
const MAX_ALTERNATES: u32 = 16;

#[derive(Serialize, Deserialize)]
struct IndexRecord {
    uri: String,
    region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
    #[serde(default)]
    update_count: u64,
    blob: String,
}

fn blob_name(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// An exclusively locked cache directory.
pub(crate) struct DiskStore {
    root: PathBuf,
    _lock: FileLock,
}

impl DiskStore {
    /// Lock `location`, or with `allow_alternate` the first free
    /// `location-1` .. `location-16` sibling.
    pub(crate) fn open(location: &Path, allow_alternate: bool) -> Result<Self> {
        if let Some(store) = Self::try_lock(location)? {
            return Ok(store);
        }
        if !allow_alternate {
            return Err(Error::CacheLocationInUse(location.to_path_buf()));
        }
        for n in 1..=MAX_ALTERNATES {
            let mut name = OsString::from(location.as_os_str());
            name.push(format!("-{n}"));
            let alternate = PathBuf::from(name);
            if let Some(store) = Self::try_lock(&alternate)? {
                log::info!(
                    "cache location {} is in use, using {}",
                    location.display(),
                    alternate.display()
                );
                return Ok(store);
            }
        }
        Err(Error::CacheLocationInUse(location.to_path_buf()))
    }

    fn try_lock(dir: &Path) -> Result<Option<Self>> {
        fs::create_dir_all(dir)?;
        Ok(FileLock::try_acquire(&dir.join(LOCK_FILE))?.map(|lock| Self {
            root: dir.to_path_buf(),
            _lock: lock,
        }))
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    /// Read every persisted entry. Unreadable records and records whose blob
    /// is missing are dropped.
    pub(crate) fn load(&self) -> Result<HashMap<CacheKey, CacheEntry>> {
        let index = match fs::read_to_string(self.root.join(INDEX_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = HashMap::new();
        for line in index.lines().filter(|l| !l.trim().is_empty()) {
            let record: IndexRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("skipping unreadable cache index record: {e}");
                    continue;
                }
            };
            let content: Arc<[u8]> = match fs::read(self.blob_path(&record.blob)) {
                Ok(bytes) => bytes.into(),
                Err(e) => {
                    log::warn!("dropping cache entry {}: {e}", record.uri);
                    continue;
                }
            };
            entries.insert(
                CacheKey::new(record.uri, record.region),
                CacheEntry::restore(
                    content,
                    record.content_type,
                    record.etag,
                    record.last_modified,
                    record.update_count,
                ),
            );
        }
        Ok(entries)
    }

    /// Persist `entries`, replacing whatever was saved before.
    pub(crate) fn save(&self, entries: &HashMap<CacheKey, CacheEntry>) -> Result<()> {
        fs::create_dir_all(self.root.join(BLOB_DIR))?;

        let mut referenced = HashSet::new();
        let mut lines = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            let blob = blob_name(entry.content());
            let path = self.blob_path(&blob);
            if !path.exists() {
                safe_io::atomic_write(&path, entry.content())?;
            }
            lines.push(serde_json::to_string(&IndexRecord {
                uri: key.uri.clone(),
                region: key.region.clone(),
                content_type: entry.content_type().map(str::to_string),
                etag: entry.etag().map(str::to_string),
                last_modified: entry.last_modified().map(str::to_string),
                update_count: entry.update_count(),
                blob: blob.clone(),
            })?);
            referenced.insert(blob);
        }
        lines.sort();
        safe_io::atomic_write(&self.root.join(INDEX_FILE), lines.join("\n").as_bytes())?;

        self.collect_garbage(&referenced)?;
        Ok(())
    }

    fn blob_path(&self, blob: &str) -> PathBuf {
        self.root.join(BLOB_DIR).join(blob)
    }

    fn collect_garbage(&self, referenced: &HashSet<String>) -> io::Result<()> {
        for entry in fs::read_dir(self.root.join(BLOB_DIR))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !referenced.contains(&name) && !safe_io::is_temporary_name(&name) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}
