//! Open options for reads and writes.
//!
//! Options are plain tagged variants; callers pass a slice and each operation
//! folds the ones it understands into a typed summary.

use super::version::VersionToken;

/// Number of unchanged lines around each diff hunk when none is requested.
pub const DEFAULT_DIFF_CONTEXT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOption {
    /// Address a specific revision of a versioned file.
    Version(VersionToken),
    /// Read the unified diff between two revisions instead of content.
    Diff {
        from: VersionToken,
        to: VersionToken,
        context: usize,
    },
    /// Fail if the target already exists.
    CreateNew,
    /// Create a versioned file when missing, add a revision otherwise.
    CreateOrUpdate,
    /// Write as a versioned file.
    Versioned,
    /// Skip creating a revision whose content equals the latest one.
    OnlyIfChanged,
    /// Comment recorded on the revision being written.
    Comment(String),
}

/// Read-side summary of a slice of [`OpenOption`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub version: Option<VersionToken>,
    pub diff: Option<(VersionToken, VersionToken, usize)>,
}

impl ReadOptions {
    pub fn from_options(options: &[OpenOption]) -> Self {
        let mut read = ReadOptions::default();
        for option in options {
            match option {
                OpenOption::Version(token) => read.version = Some(*token),
                OpenOption::Diff { from, to, context } => read.diff = Some((*from, *to, *context)),
                _ => {}
            }
        }
        read
    }
}

/// Write-side summary of a slice of [`OpenOption`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub create_new: bool,
    pub create_or_update: bool,
    pub versioned: bool,
    pub only_if_changed: bool,
    pub comment: Option<String>,
}

impl WriteOptions {
    pub fn from_options(options: &[OpenOption]) -> Self {
        let mut write = WriteOptions::default();
        for option in options {
            match option {
                OpenOption::CreateNew => write.create_new = true,
                OpenOption::CreateOrUpdate => write.create_or_update = true,
                OpenOption::Versioned => write.versioned = true,
                OpenOption::OnlyIfChanged => write.only_if_changed = true,
                OpenOption::Comment(text) => write.comment = Some(text.clone()),
                OpenOption::Version(_) | OpenOption::Diff { .. } => {}
            }
        }
        write
    }

    /// Whether any option only makes sense for a versioned file.
    pub fn requests_versioning(&self) -> bool {
        self.versioned || self.create_or_update || self.only_if_changed || self.comment.is_some()
    }
}
