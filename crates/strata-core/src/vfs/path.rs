//! Filesystem-agnostic path values.
//!
//! `FsPath` is an immutable sequence of segments plus an absolute flag. It is
//! tied to the filesystem that produced it through a shared [`PathFactory`],
//! which is the only thing a concrete filesystem has to provide for the path
//! algebra (resolve, relativize, normalize, ...) to work on its paths.
//! Every operation returns a new value.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Segment separator for all paths.
pub const SEPARATOR: char = '/';

const CURRENT_DIR: &str = ".";
const PARENT_DIR: &str = "..";

/// Identity capability injected into every path a filesystem creates.
pub trait PathFactory: Send + Sync {
    /// Stable identity of the owning filesystem. Paths whose factories report
    /// the same identity belong to the same filesystem.
    fn identity(&self) -> &str;
}

/// An absolute or relative path on some filesystem.
///
/// Invariants (enforced at construction):
/// - no segment is empty or contains [`SEPARATOR`]
/// - an empty segment list is the root when absolute, the empty path otherwise
#[derive(Clone)]
pub struct FsPath {
    factory: Arc<dyn PathFactory>,
    segments: Vec<String>,
    absolute: bool,
}

impl FsPath {
    /// Parse a `/`-separated string. Repeated and trailing separators are
    /// ignored; a leading separator makes the path absolute.
    pub fn parse(factory: Arc<dyn PathFactory>, raw: &str) -> FsPath {
        let absolute = raw.starts_with(SEPARATOR);
        let segments = raw
            .split(SEPARATOR)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        FsPath {
            factory,
            segments,
            absolute,
        }
    }

    /// Build a path from segments, splitting any that embed a separator.
    pub fn from_segments<I, S>(factory: Arc<dyn PathFactory>, absolute: bool, segments: I) -> FsPath
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let segments = segments
            .into_iter()
            .flat_map(|s| {
                s.as_ref()
                    .split(SEPARATOR)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        FsPath {
            factory,
            segments,
            absolute,
        }
    }

    fn derive(&self, absolute: bool, segments: Vec<String>) -> FsPath {
        FsPath {
            factory: Arc::clone(&self.factory),
            segments,
            absolute,
        }
    }

    /// Identity of the filesystem this path belongs to.
    pub fn identity(&self) -> &str {
        self.factory.identity()
    }

    /// The factory that produced this path.
    pub fn factory(&self) -> &Arc<dyn PathFactory> {
        &self.factory
    }

    /// Whether `other` was produced by the same filesystem.
    pub fn same_filesystem(&self, other: &FsPath) -> bool {
        self.identity() == other.identity()
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn is_root(&self) -> bool {
        self.absolute && self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn name_count(&self) -> usize {
        self.segments.len()
    }

    /// The root of this path's filesystem, or `None` for relative paths.
    pub fn root(&self) -> Option<FsPath> {
        self.absolute.then(|| self.derive(true, Vec::new()))
    }

    /// Final segment, or `None` for the root and the empty path.
    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Parent path. The parent of a single-segment absolute path is the root;
    /// a single-segment relative path has no parent.
    pub fn parent(&self) -> Option<FsPath> {
        match self.segments.len() {
            0 => None,
            1 if self.absolute => self.root(),
            1 => None,
            n => Some(self.derive(self.absolute, self.segments[..n - 1].to_vec())),
        }
    }

    /// The segment at `index` as a relative single-segment path.
    pub fn name(&self, index: usize) -> Option<FsPath> {
        self.segments
            .get(index)
            .map(|s| self.derive(false, vec![s.clone()]))
    }

    /// Relative path made of segments `begin..end`.
    pub fn subpath(&self, begin: usize, end: usize) -> Option<FsPath> {
        (begin < end && end <= self.segments.len())
            .then(|| self.derive(false, self.segments[begin..end].to_vec()))
    }

    /// Same directory, different final segment.
    pub fn with_file_name(&self, name: &str) -> FsPath {
        let mut segments = self.segments.clone();
        segments.pop();
        segments.extend(
            name.split(SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        self.derive(self.absolute, segments)
    }

    /// Segment-wise prefix test. Both paths must be on the same filesystem
    /// and agree on absoluteness.
    pub fn starts_with(&self, other: &FsPath) -> bool {
        self.same_filesystem(other)
            && self.absolute == other.absolute
            && self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// Segment-wise suffix test. An absolute `other` must equal this path.
    pub fn ends_with(&self, other: &FsPath) -> bool {
        if !self.same_filesystem(other) {
            return false;
        }
        if other.absolute {
            return self.absolute && self.segments == other.segments;
        }
        if other.segments.is_empty() {
            return self.segments.is_empty() && !self.absolute;
        }
        let n = self.segments.len();
        let m = other.segments.len();
        n >= m && self.segments[n - m..] == other.segments[..]
    }

    /// Drop `.` segments and collapse `<x>/..` pairs where `x` is not `..`.
    ///
    /// Leading `..` segments survive, on absolute paths too.
    pub fn normalize(&self) -> FsPath {
        let mut out: Vec<String> = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment.as_str() {
                CURRENT_DIR => {}
                PARENT_DIR => match out.last() {
                    Some(last) if last != PARENT_DIR => {
                        out.pop();
                    }
                    _ => out.push(PARENT_DIR.to_string()),
                },
                _ => out.push(segment.clone()),
            }
        }
        self.derive(self.absolute, out)
    }

    /// `other` if it is absolute, otherwise `other` appended to this path.
    pub fn resolve(&self, other: &FsPath) -> FsPath {
        if other.absolute {
            return other.clone();
        }
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        self.derive(self.absolute, segments)
    }

    /// Parse `other` with this path's factory and resolve it.
    pub fn join(&self, other: &str) -> FsPath {
        self.resolve(&FsPath::parse(Arc::clone(&self.factory), other))
    }

    /// Resolve `other` against this path's parent.
    pub fn resolve_sibling(&self, other: &FsPath) -> FsPath {
        match self.parent() {
            Some(parent) => parent.resolve(other),
            None => other.clone(),
        }
    }

    /// Relative path that leads from this path to `other`.
    ///
    /// Both paths are made absolute first; the result climbs out of this
    /// path's unshared segments with `..` and descends into `other`'s.
    pub fn relativize(&self, other: &FsPath) -> Result<FsPath> {
        if !self.same_filesystem(other) {
            return Err(Error::IncompatiblePath(format!(
                "{} ({}) and {} ({})",
                self,
                self.identity(),
                other,
                other.identity()
            )));
        }
        let from = self.to_absolute_path();
        let to = other.to_absolute_path();
        let common = from
            .segments
            .iter()
            .zip(&to.segments)
            .take_while(|(a, b)| a == b)
            .count();
        let mut segments: Vec<String> = std::iter::repeat_n(
            PARENT_DIR.to_string(),
            from.segments.len() - common,
        )
        .collect();
        segments.extend(to.segments[common..].iter().cloned());
        Ok(self.derive(false, segments))
    }

    /// Absolute form; relative paths are taken relative to the root.
    pub fn to_absolute_path(&self) -> FsPath {
        if self.absolute {
            self.clone()
        } else {
            self.derive(true, self.segments.clone())
        }
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            write!(f, "{}", SEPARATOR)?;
        }
        write!(f, "{}", self.segments.join("/"))
    }
}

impl fmt::Debug for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsPath")
            .field("fs", &self.identity())
            .field("path", &self.to_string())
            .finish()
    }
}

impl PartialEq for FsPath {
    fn eq(&self, other: &Self) -> bool {
        self.absolute == other.absolute
            && self.segments == other.segments
            && self.same_filesystem(other)
    }
}

impl Eq for FsPath {}

impl Hash for FsPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
        self.segments.hash(state);
        self.absolute.hash(state);
    }
}
