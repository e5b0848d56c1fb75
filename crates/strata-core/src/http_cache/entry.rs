use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Cache key: a request URI inside a region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub uri: String,
    pub region: String,
}

impl CacheKey {
    pub fn new(uri: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            region: region.into(),
        }
    }
}

/// One cached GET response.
///
/// The bytes are immutable once stored: a changed representation becomes a
/// new entry. Revalidation produces a copy that shares the same bytes with a
/// higher update count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    content: Arc<[u8]>,
    content_type: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,
    update_count: u64,
}

impl CacheEntry {
    pub fn new(
        content: impl Into<Arc<[u8]>>,
        content_type: Option<String>,
        etag: Option<String>,
        last_modified: Option<String>,
    ) -> Self {
        Self {
            content: content.into(),
            content_type,
            etag,
            last_modified,
            update_count: 0,
        }
    }

    /// Rebuild a persisted entry.
    pub(crate) fn restore(
        content: Arc<[u8]>,
        content_type: Option<String>,
        etag: Option<String>,
        last_modified: Option<String>,
        update_count: u64,
    ) -> Self {
        Self {
            content,
            content_type,
            etag,
            last_modified,
            update_count,
        }
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// The bytes without copying them.
    pub fn shared_content(&self) -> Arc<[u8]> {
        Arc::clone(&self.content)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    /// How many times the server confirmed this entry was still fresh.
    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// Whether a conditional request can be built from this entry.
    pub fn has_validator(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }

    pub(crate) fn revalidated(&self) -> Self {
        Self {
            content: Arc::clone(&self.content),
            content_type: self.content_type.clone(),
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
            update_count: self.update_count + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revalidated_shares_content() {
        let entry = CacheEntry::new(b"body".to_vec(), None, Some("\"x\"".into()), None);
        let next = entry.revalidated();
        assert_eq!(next.update_count(), 1);
        assert!(Arc::ptr_eq(&entry.shared_content(), &next.shared_content()));
        assert_eq!(next.etag(), Some("\"x\""));
        assert!(next.has_validator());
    }

    #[test]
    fn test_without_validators() {
        let entry = CacheEntry::new(Vec::new(), Some("text/plain".into()), None, None);
        assert!(!entry.has_validator());
        assert_eq!(entry.content_type(), Some("text/plain"));
        assert!(entry.content().is_empty());
    }
}
