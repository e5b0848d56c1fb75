//! HTTP semantic cache.
//!
//! Caches GET responses per (URI, region) and decides, per the configured
//! [`FallbackPolicy`], whether a request may be answered from the cache,
//! must be revalidated, or bypasses the cache:
//!
//! | policy          | entry present              | no entry, server unreachable |
//! |-----------------|----------------------------|------------------------------|
//! | `Never`         | ignored                    | transport error              |
//! | `Offline`       | revalidate; serve if down  | offline error                |
//! | `Always`        | served, no network         | offline error                |
//! | `WhenPossible`  | served, no network         | transport error              |
//!
//! With [`CacheMode::MemoryAndDisk`] the entries persist to a disk location
//! that only one instance may hold open at a time.

mod disk;
mod entry;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use reqwest::Method;

use crate::config::{CacheConfig, CacheMode, FallbackPolicy};
use crate::error::{Error, Result};
use disk::DiskStore;
pub use entry::{CacheEntry, CacheKey};

/// What to do with a GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Answer from this entry without touching the network.
    Fresh(CacheEntry),
    /// Send a conditional request built from this entry.
    Revalidate(CacheEntry),
    /// Nothing cached; fetch and store.
    Miss,
    /// The cache is disabled for this request; fetch, do not store.
    Bypass,
}

pub struct HttpCache {
    config: CacheConfig,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    disk: Option<DiskStore>,
    reachable: AtomicBool,
    dirty: AtomicBool,
}

impl HttpCache {
    /// Open a cache. With a disk mode this locks the disk location and loads
    /// what a previous instance saved there.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let disk = match config.mode {
            CacheMode::MemoryAndDisk => {
                let location = config.disk_location().ok_or_else(|| {
                    Error::InvalidConfig("no cache location and no user cache directory".into())
                })?;
                Some(DiskStore::open(&location, config.allow_alternate_location)?)
            }
            CacheMode::None | CacheMode::MemoryOnly => None,
        };
        let entries = match &disk {
            Some(store) => store.load()?,
            None => HashMap::new(),
        };
        if let Some(store) = &disk {
            log::info!(
                "opened http cache at {} ({} entries)",
                store.root().display(),
                entries.len()
            );
        }
        Ok(Self {
            config,
            entries: Mutex::new(entries),
            disk,
            reachable: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Disk location actually in use, which may be an alternate one.
    pub fn location(&self) -> Option<&Path> {
        self.disk.as_ref().map(DiskStore::root)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(&self, uri: &str) -> CacheKey {
        CacheKey::new(uri, self.config.region.as_str())
    }

    fn trace(&self, message: std::fmt::Arguments<'_>) {
        if self.config.verbose {
            log::info!("http cache: {message}");
        } else {
            log::debug!("http cache: {message}");
        }
    }

    /// Decide how to serve a GET of `uri`.
    pub fn lookup(&self, uri: &str) -> Lookup {
        if !self.config.is_enabled() {
            return Lookup::Bypass;
        }
        let Some(entry) = self.entries().get(&self.key(uri)).cloned() else {
            self.trace(format_args!("miss {uri}"));
            return Lookup::Miss;
        };
        match self.config.fallback {
            FallbackPolicy::Always | FallbackPolicy::WhenPossible => {
                self.trace(format_args!("hit {uri}"));
                Lookup::Fresh(entry)
            }
            FallbackPolicy::Offline if entry.has_validator() => {
                self.trace(format_args!("revalidate {uri}"));
                Lookup::Revalidate(entry)
            }
            // nothing to revalidate with, so this is a plain refetch
            FallbackPolicy::Offline => Lookup::Miss,
            FallbackPolicy::Never => Lookup::Bypass,
        }
    }

    /// Cached entry for `uri`, if any, regardless of policy.
    pub fn get(&self, uri: &str) -> Option<CacheEntry> {
        self.entries().get(&self.key(uri)).cloned()
    }

    /// Record a full response, replacing any previous entry.
    pub fn store(&self, uri: &str, entry: CacheEntry) {
        if !self.config.is_enabled() {
            return;
        }
        self.trace(format_args!("store {uri} ({} bytes)", entry.content().len()));
        self.entries().insert(self.key(uri), entry);
        self.dirty.store(true, Ordering::Release);
    }

    /// The server answered 304: keep the content, count the confirmation.
    pub fn confirm(&self, uri: &str) -> Option<CacheEntry> {
        let mut entries = self.entries();
        let key = self.key(uri);
        let next = entries.get(&key)?.revalidated();
        entries.insert(key, next.clone());
        drop(entries);
        self.trace(format_args!("confirmed {uri} (update {})", next.update_count()));
        self.dirty.store(true, Ordering::Release);
        Some(next)
    }

    /// Drop every entry of this region whose URI matches. Returns how many
    /// were dropped.
    pub fn invalidate(&self, matches: impl Fn(&str) -> bool) -> usize {
        let region = self.config.region.as_str();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| key.region != region || !matches(&key.uri));
        let dropped = before - entries.len();
        drop(entries);
        if dropped > 0 {
            self.trace(format_args!("invalidated {dropped} entries"));
            self.dirty.store(true, Ordering::Release);
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Record the outcome of the last network attempt.
    pub fn mark_reachable(&self, reachable: bool) {
        let was = self.reachable.swap(reachable, Ordering::AcqRel);
        if was != reachable {
            log::info!(
                "server is {}",
                if reachable { "reachable again" } else { "unreachable" }
            );
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    /// Non-GET requests fail fast while the server is known to be unreachable.
    pub fn check_method(&self, method: &Method) -> Result<()> {
        if *method != Method::GET && !self.is_reachable() {
            return Err(Error::Offline(format!("illegal method while offline: {method}")));
        }
        Ok(())
    }

    /// Resolve a GET of `uri` whose network attempt failed with `err`.
    ///
    /// Under `Offline` a cached entry is served. A miss becomes an offline
    /// error under `Offline` and `Always`; otherwise `err` is returned.
    pub fn fallback(&self, uri: &str, err: Error) -> Result<CacheEntry> {
        match self.config.fallback {
            FallbackPolicy::Never => Err(err),
            _ if self.config.mode == CacheMode::None => Err(err),
            FallbackPolicy::Offline | FallbackPolicy::Always => match self.get(uri) {
                Some(entry) => {
                    self.trace(format_args!("serving {uri} while offline"));
                    Ok(entry)
                }
                None => Err(Error::Offline(format!("{uri} is not cached ({err})"))),
            },
            FallbackPolicy::WhenPossible => Err(err),
        }
    }

    /// Persist to disk, when a disk location is configured.
    pub fn flush(&self) -> Result<()> {
        let Some(store) = &self.disk else {
            return Ok(());
        };
        let snapshot = self.entries().clone();
        store.save(&snapshot)?;
        self.dirty.store(false, Ordering::Release);
        log::debug!("flushed {} cache entries to {}", snapshot.len(), store.root().display());
        Ok(())
    }
}

impl Drop for HttpCache {
    fn drop(&mut self) {
        if self.disk.is_some()
            && self.dirty.load(Ordering::Acquire)
            && let Err(e) = self.flush()
        {
            log::warn!("failed to persist http cache: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache(fallback: FallbackPolicy) -> HttpCache {
        HttpCache::open(CacheConfig {
            fallback,
            ..CacheConfig::default()
        })
        .unwrap()
    }

    fn entry(body: &[u8]) -> CacheEntry {
        CacheEntry::new(body, None, Some(format!("\"{}\"", body.len())), None)
    }

    #[test]
    fn test_lookup_per_policy() {
        for (policy, expect_fresh) in [
            (FallbackPolicy::Always, true),
            (FallbackPolicy::WhenPossible, true),
            (FallbackPolicy::Offline, false),
        ] {
            let cache = cache(policy);
            assert_eq!(cache.lookup("u"), Lookup::Miss);
            cache.store("u", entry(b"x"));
            match cache.lookup("u") {
                Lookup::Fresh(_) => assert!(expect_fresh, "{policy}"),
                Lookup::Revalidate(_) => assert!(!expect_fresh, "{policy}"),
                other => panic!("{policy}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_never_bypasses_and_stores_nothing() {
        let cache = cache(FallbackPolicy::Never);
        cache.store("u", entry(b"x"));
        assert!(cache.is_empty());
        assert_eq!(cache.lookup("u"), Lookup::Bypass);
    }

    #[test]
    fn test_mode_none_bypasses() {
        let cache = HttpCache::open(CacheConfig {
            mode: CacheMode::None,
            ..CacheConfig::default()
        })
        .unwrap();
        cache.store("u", entry(b"x"));
        assert_eq!(cache.lookup("u"), Lookup::Bypass);
    }

    #[test]
    fn test_confirm_counts_and_keeps_content() {
        let cache = cache(FallbackPolicy::Offline);
        cache.store("u", entry(b"body"));
        assert_eq!(cache.confirm("u").unwrap().update_count(), 1);
        let again = cache.confirm("u").unwrap();
        assert_eq!(again.update_count(), 2);
        assert_eq!(again.content(), b"body");
        assert!(cache.confirm("missing").is_none());
    }

    #[test]
    fn test_regions_are_separate() {
        let docs = HttpCache::open(CacheConfig {
            region: "docs".into(),
            ..CacheConfig::default()
        })
        .unwrap();
        docs.store("u", entry(b"x"));
        assert!(docs.get("u").is_some());
        assert_eq!(docs.invalidate(|uri| uri == "u"), 1);
        assert!(docs.get("u").is_none());
    }

    #[test]
    fn test_fallback_classification() {
        let transport = || Error::Transport("connection refused".into());

        let offline = cache(FallbackPolicy::Offline);
        assert!(matches!(offline.fallback("u", transport()), Err(Error::Offline(_))));
        offline.store("u", entry(b"cached"));
        assert_eq!(offline.fallback("u", transport()).unwrap().content(), b"cached");

        let always = cache(FallbackPolicy::Always);
        assert!(matches!(always.fallback("u", transport()), Err(Error::Offline(_))));

        let when_possible = cache(FallbackPolicy::WhenPossible);
        assert!(matches!(when_possible.fallback("u", transport()), Err(Error::Transport(_))));

        let never = cache(FallbackPolicy::Never);
        assert!(matches!(never.fallback("u", transport()), Err(Error::Transport(_))));
    }

    #[test]
    fn test_non_get_refused_while_unreachable() {
        let cache = cache(FallbackPolicy::Offline);
        assert!(cache.check_method(&Method::POST).is_ok());
        cache.mark_reachable(false);
        assert!(matches!(cache.check_method(&Method::DELETE), Err(Error::Offline(_))));
        assert!(cache.check_method(&Method::GET).is_ok());
        cache.mark_reachable(true);
        assert!(cache.check_method(&Method::PUT).is_ok());
    }

    #[test]
    fn test_disk_entries_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig {
            mode: CacheMode::MemoryAndDisk,
            location: Some(tmp.path().join("cache")),
            ..CacheConfig::default()
        };
        {
            let cache = HttpCache::open(config.clone()).unwrap();
            cache.store("u", entry(b"persisted"));
        }
        let cache = HttpCache::open(config).unwrap();
        assert_eq!(cache.get("u").unwrap().content(), b"persisted");
    }

    #[test]
    fn test_disk_location_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig {
            mode: CacheMode::MemoryAndDisk,
            location: Some(tmp.path().join("cache")),
            ..CacheConfig::default()
        };
        let _first = HttpCache::open(config.clone()).unwrap();
        assert!(matches!(
            HttpCache::open(config.clone()),
            Err(Error::CacheLocationInUse(_))
        ));

        let alternate = HttpCache::open(CacheConfig {
            allow_alternate_location: true,
            ..config
        })
        .unwrap();
        assert_eq!(alternate.location(), Some(tmp.path().join("cache-1").as_path()));
    }
}
