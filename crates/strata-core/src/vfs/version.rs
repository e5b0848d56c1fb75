//! Revision addressing: version tokens and the `name(version).ext` syntax.
//!
//! A file name such as `report(3).txt` addresses revision 3 of the versioned
//! file `report.txt`; `report(default).txt` and `report(latest).txt` address
//! its two pointers. Names that do not match the pattern are left alone.

use std::fmt;
use std::io;
use std::str::FromStr;

use regex::Regex;

use super::path::FsPath;
use crate::error::{Error, Result};

/// `<base>(<version>)[.<ext>]`. The base is matched lazily so that only the
/// last parenthesised group before the extension is taken as the version.
const VERSIONED_NAME: &str = r"^(?P<base>.+?)\((?P<version>[^()]+)\)(?P<ext>\.[^.()]*)?$";

/// Which revision of a versioned file to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionToken {
    /// The most recently added revision.
    Latest,
    /// The revision the `default` pointer selects.
    Default,
    /// A specific revision number, starting at 1.
    Explicit(u32),
}

impl FromStr for VersionToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "latest" => Ok(VersionToken::Latest),
            "d" | "default" => Ok(VersionToken::Default),
            other => match other.parse::<u32>() {
                Ok(n) if n >= 1 => Ok(VersionToken::Explicit(n)),
                _ => Err(Error::InvalidVersion(s.to_string())),
            },
        }
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionToken::Latest => write!(f, "latest"),
            VersionToken::Default => write!(f, "default"),
            VersionToken::Explicit(n) => write!(f, "{n}"),
        }
    }
}

/// Split a file name into its base name and optional version token.
///
/// `name(7).ext` yields `("name.ext", Some(Explicit(7)))`; `plain.txt`
/// yields `("plain.txt", None)`. A matching name with an unparsable token
/// fails with [`Error::InvalidVersion`].
pub fn split_versioned_name(file_name: &str) -> Result<(String, Option<VersionToken>)> {
    let pattern = Regex::new(VERSIONED_NAME).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid versioned name pattern: {e}"),
        )
    })?;
    let Some(caps) = pattern.captures(file_name) else {
        return Ok((file_name.to_string(), None));
    };
    let token = caps["version"].parse::<VersionToken>()?;
    let ext = caps.name("ext").map(|m| m.as_str()).unwrap_or("");
    Ok((format!("{}{}", &caps["base"], ext), Some(token)))
}

/// Apply [`split_versioned_name`] to the final segment of `path`.
pub fn split_versioned_path(path: &FsPath) -> Result<(FsPath, Option<VersionToken>)> {
    let Some(name) = path.file_name() else {
        return Ok((path.clone(), None));
    };
    match split_versioned_name(name)? {
        (_, None) => Ok((path.clone(), None)),
        (base, Some(token)) => Ok((path.with_file_name(&base), Some(token))),
    }
}
