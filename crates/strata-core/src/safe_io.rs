//! Safe file I/O utilities: atomic writes and file locking.
//!
//! - [`atomic_write()`] / [`atomic_write_json()`] write to a hidden temporary
//!   sibling, fsync, then rename over the target. Readers observe either the
//!   old or the new contents, never a partial write. The versioned store's
//!   `latest`/`default` pointers rely on this for their swap.
//! - [`FileLock`] is an RAII exclusive advisory lock (fs2). The disk cache
//!   holds one for its whole lifetime; the versioned store takes one around
//!   each mutation.

use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Suffix shared by every temporary file and directory this crate creates.
const TMP_SUFFIX: &str = ".strata-tmp";

/// Per-process sequence keeping concurrent temporary names apart.
static TMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Whether a directory entry name is one of our in-flight temporary files.
pub fn is_temporary_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TMP_SUFFIX)
}

/// Temporary sibling for `path`: `.<name>.<pid>.<seq>.strata-tmp` in the same
/// directory, so the final rename never crosses a filesystem boundary. Every
/// call yields a fresh name.
pub fn temporary_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = TMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(
        ".{}.{}.{}{}",
        name,
        std::process::id(),
        seq,
        TMP_SUFFIX
    ))
}

/// Atomically write JSON to a file.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    atomic_write(path, &json)
}

/// Atomically write bytes to a file.
///
/// # Errors
///
/// Returns an error if the temporary file cannot be created, written, synced,
/// or renamed. The temporary file is removed on failure.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = temporary_sibling(path);
    let result = write_and_rename(&tmp_path, path, contents);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_and_rename(tmp_path: &Path, path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp_path)?;

    {
        let mut writer = BufWriter::new(&mut file);
        writer.write_all(contents)?;
        writer.flush()?;
    }

    // Sync to disk before rename
    file.sync_all()?;

    fs::rename(tmp_path, path)
}

/// RAII file lock using fs2 exclusive locking.
///
/// The lock is released when dropped. Locks are per open file description,
/// so two `FileLock`s on the same path conflict even inside one process.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock on the given path, blocking if necessary.
    ///
    /// Creates the lock file (and its parents) if it doesn't exist.
    pub fn acquire(lock_path: &Path) -> io::Result<Self> {
        let file = Self::open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self {
            file,
            path: lock_path.to_path_buf(),
        })
    }

    /// Try to acquire an exclusive lock without blocking.
    ///
    /// Returns `Ok(None)` if the lock is held elsewhere.
    pub fn try_acquire(lock_path: &Path) -> io::Result<Option<Self>> {
        let file = Self::open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: lock_path.to_path_buf(),
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // fs2 reports contention as a raw OS error on some platforms
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(lock_path: &Path) -> io::Result<File> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_basic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.txt");

        atomic_write(&path, b"hello world").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "hello world");
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("test.txt");

        atomic_write(&path, b"nested content").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "nested content");
    }

    #[test]
    fn test_atomic_write_overwrites_existing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("latest");

        atomic_write(&path, b"1").unwrap();
        atomic_write(&path, b"2").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "2");
    }

    #[test]
    fn test_atomic_write_keeps_extension_of_neighbours() {
        // a.tmp must survive a write to a.txt
        let temp_dir = TempDir::new().unwrap();
        let neighbour = temp_dir.path().join("a.tmp");
        fs::write(&neighbour, b"keep").unwrap();

        atomic_write(&temp_dir.path().join("a.txt"), b"new").unwrap();

        assert_eq!(fs::read_to_string(&neighbour).unwrap(), "keep");
    }

    #[test]
    fn test_atomic_write_no_tmp_file_left() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.txt");

        atomic_write(&path, b"content").unwrap();

        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| is_temporary_name(n))
            .collect();
        assert!(leftovers.is_empty(), "temp file should be cleaned up");
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.json");

        atomic_write_json(&path, &serde_json::json!({"hidden": [2]})).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["hidden"][0], 2);
    }

    #[test]
    fn test_is_temporary_name() {
        assert!(is_temporary_name(".notes.txt.42.7.strata-tmp"));
        assert!(!is_temporary_name("notes.strata-tmp"));
        assert!(!is_temporary_name(".hidden"));
        // user files that merely look temporary stay visible
        assert!(!is_temporary_name(".draft.tmp"));
    }

    #[test]
    fn test_temporary_sibling_unique_per_call() {
        let path = Path::new("/data/notes.txt");
        let a = temporary_sibling(path);
        let b = temporary_sibling(path);
        assert_ne!(a, b);
        assert_eq!(a.parent(), path.parent());
        assert!(is_temporary_name(&a.file_name().unwrap().to_string_lossy()));
    }

    #[test]
    fn test_atomic_write_concurrent_writers_same_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shared.bin");
        let large = vec![b'L'; 4 * 1024 * 1024];
        let small = vec![b's'; 16];

        for _ in 0..20 {
            let handles: Vec<_> = [large.clone(), small.clone()]
                .into_iter()
                .map(|data| {
                    let path = path.clone();
                    thread::spawn(move || atomic_write(&path, &data))
                })
                .collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }

            let written = fs::read(&path).unwrap();
            assert!(written == large || written == small, "torn write of {} bytes", written.len());
        }

        let leftovers = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter(|e| is_temporary_name(&e.as_ref().unwrap().file_name().to_string_lossy()))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_file_lock_try_acquire_when_locked() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("test.lock");

        let _lock1 = FileLock::acquire(&lock_path).unwrap();
        let result = FileLock::try_acquire(&lock_path).unwrap();
        assert!(result.is_none(), "should fail to acquire when already locked");
    }

    #[test]
    fn test_file_lock_released_after_drop() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("test.lock");

        {
            let lock = FileLock::acquire(&lock_path).unwrap();
            assert_eq!(lock.path(), lock_path.as_path());
        }
        let result = FileLock::try_acquire(&lock_path).unwrap();
        assert!(result.is_some(), "should acquire after previous lock dropped");
    }

    #[test]
    fn test_file_lock_blocks_across_threads() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("test.lock");
        let lock_path_clone = lock_path.clone();

        let lock_held = Arc::new(AtomicBool::new(false));
        let lock_held_clone = Arc::clone(&lock_held);

        let handle = thread::spawn(move || {
            let _lock = FileLock::acquire(&lock_path_clone).unwrap();
            lock_held_clone.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
        });

        while !lock_held.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(10));
        }

        assert!(FileLock::try_acquire(&lock_path).unwrap().is_none());

        handle.join().unwrap();

        assert!(FileLock::try_acquire(&lock_path).unwrap().is_some());
    }
}
