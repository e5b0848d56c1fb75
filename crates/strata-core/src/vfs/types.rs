//! Metadata types shared by the client and the server (wire DTOs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::version::VersionToken;
use crate::error::{Error, Result};

/// Kind of entry, derived from the metadata flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Anything else; versioned files are reported this way.
    Other,
}

/// Metadata for one filesystem entry.
///
/// A versioned file is reported as "other" with `is_versioned_file` set,
/// never as a regular file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_regular_file: bool,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub is_symbolic_link: bool,
    #[serde(default)]
    pub is_other: bool,
    /// Opaque identity of the underlying object, when the server has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    /// Directory listings only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileMetadata>>,
    #[serde(default)]
    pub is_versioned_file: bool,
}

impl FileMetadata {
    pub fn kind(&self) -> EntryKind {
        if self.is_directory {
            EntryKind::Directory
        } else if self.is_symbolic_link {
            EntryKind::Symlink
        } else if self.is_regular_file {
            EntryKind::File
        } else {
            EntryKind::Other
        }
    }
}

/// One revision inside a [`VersionSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub version: u32,
    pub metadata: FileMetadata,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub comment: String,
}

/// All revisions of a versioned file plus its two pointers.
///
/// Versions are numbered contiguously from 1, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSet {
    pub default: u32,
    pub latest: u32,
    pub versions: Vec<VersionEntry>,
}

impl VersionSet {
    pub fn version_numbers(&self) -> Vec<u32> {
        self.versions.iter().map(|v| v.version).collect()
    }

    pub fn get(&self, version: u32) -> Option<&VersionEntry> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub fn default_entry(&self) -> Option<&VersionEntry> {
        self.get(self.default)
    }

    pub fn latest_entry(&self) -> Option<&VersionEntry> {
        self.get(self.latest)
    }

    /// Revision number a token selects.
    pub fn resolve(&self, token: VersionToken) -> Result<u32> {
        match token {
            VersionToken::Latest => Ok(self.latest),
            VersionToken::Default => Ok(self.default),
            VersionToken::Explicit(n) if self.get(n).is_some() => Ok(n),
            VersionToken::Explicit(n) => Err(Error::InvalidVersion(format!(
                "{n} is not in 1..={}",
                self.versions.len()
            ))),
        }
    }
}

/// Attribute view of a path: plain metadata, or the full revision history
/// of a versioned file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attributes {
    Plain(FileMetadata),
    Versioned {
        metadata: FileMetadata,
        versions: VersionSet,
    },
}

impl Attributes {
    /// Top-level metadata for either view.
    pub fn metadata(&self) -> &FileMetadata {
        match self {
            Attributes::Plain(metadata) | Attributes::Versioned { metadata, .. } => metadata,
        }
    }

    pub fn versions(&self) -> Option<&VersionSet> {
        match self {
            Attributes::Plain(_) => None,
            Attributes::Versioned { versions, .. } => Some(versions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: u32) -> VersionEntry {
        VersionEntry {
            version,
            metadata: FileMetadata {
                name: "a.txt".into(),
                size: u64::from(version),
                is_regular_file: true,
                ..Default::default()
            },
            hidden: false,
            comment: String::new(),
        }
    }

    fn set() -> VersionSet {
        VersionSet {
            default: 1,
            latest: 3,
            versions: vec![entry(1), entry(2), entry(3)],
        }
    }

    #[test]
    fn test_kind_from_flags() {
        let versioned = FileMetadata {
            is_other: true,
            is_versioned_file: true,
            ..Default::default()
        };
        assert_eq!(versioned.kind(), EntryKind::Other);
        let dir = FileMetadata {
            is_directory: true,
            ..Default::default()
        };
        assert_eq!(dir.kind(), EntryKind::Directory);
    }

    #[test]
    fn test_version_set_resolve() {
        let set = set();
        assert_eq!(set.resolve(VersionToken::Latest).unwrap(), 3);
        assert_eq!(set.resolve(VersionToken::Default).unwrap(), 1);
        assert_eq!(set.resolve(VersionToken::Explicit(2)).unwrap(), 2);
        assert!(matches!(
            set.resolve(VersionToken::Explicit(9)),
            Err(Error::InvalidVersion(_))
        ));
        assert_eq!(set.version_numbers(), vec![1, 2, 3]);
        assert_eq!(set.latest_entry().unwrap().metadata.size, 3);
    }

    #[test]
    fn test_metadata_json_uses_camel_case() {
        let meta = FileMetadata {
            name: "x".into(),
            is_versioned_file: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["isVersionedFile"], true);
        assert!(json.get("children").is_none());
    }

    #[test]
    fn test_attributes_accessors() {
        let attrs = Attributes::Versioned {
            metadata: FileMetadata::default(),
            versions: set(),
        };
        assert_eq!(attrs.versions().unwrap().latest, 3);
        assert!(Attributes::Plain(FileMetadata::default()).versions().is_none());
    }
}
