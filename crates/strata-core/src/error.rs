//! Error taxonomy shared by the path layer, the cache, the client and the server.
//!
//! Every failure that crosses a module boundary is an [`Error`]. On the wire a
//! failure travels as an [`ErrorKind`] tag plus a message; the client rebuilds
//! the typed variant from that pair through a fixed table
//! ([`Error::from_remote`]).

use std::io;
use std::path::PathBuf;

use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Flat classification of an [`Error`], used as the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    NotDirectory,
    IsDirectory,
    NotVersionedFile,
    InvalidVersion,
    IncompatiblePath,
    Offline,
    CacheLocationInUse,
    Transport,
    Remote,
    Protocol,
    InvalidConfig,
    Io,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotDirectory(String),
    #[error("is a directory: {0}")]
    IsDirectory(String),
    #[error("not a versioned file: {0}")]
    NotVersionedFile(String),
    #[error("invalid version: {0}")]
    InvalidVersion(String),
    #[error("incompatible path: {0}")]
    IncompatiblePath(String),
    #[error("offline: {0}")]
    Offline(String),
    #[error("cache location in use by another instance: {}", .0.display())]
    CacheLocationInUse(PathBuf),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote failure ({classification}): {message}")]
    Remote {
        classification: String,
        message: String,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The wire classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NotDirectory(_) => ErrorKind::NotDirectory,
            Error::IsDirectory(_) => ErrorKind::IsDirectory,
            Error::NotVersionedFile(_) => ErrorKind::NotVersionedFile,
            Error::InvalidVersion(_) => ErrorKind::InvalidVersion,
            Error::IncompatiblePath(_) => ErrorKind::IncompatiblePath,
            Error::Offline(_) => ErrorKind::Offline,
            Error::CacheLocationInUse(_) => ErrorKind::CacheLocationInUse,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Remote { .. } => ErrorKind::Remote,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// The message carried on the wire, without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            Error::NotFound(m)
            | Error::AlreadyExists(m)
            | Error::NotDirectory(m)
            | Error::IsDirectory(m)
            | Error::NotVersionedFile(m)
            | Error::InvalidVersion(m)
            | Error::IncompatiblePath(m)
            | Error::Offline(m)
            | Error::Transport(m)
            | Error::Protocol(m)
            | Error::InvalidConfig(m) => m.clone(),
            Error::CacheLocationInUse(p) => p.display().to_string(),
            Error::Remote { message, .. } => message.clone(),
            Error::Io(e) => e.to_string(),
        }
    }

    /// Rebuild a typed error from a server-reported classification tag.
    ///
    /// Unknown tags are preserved verbatim as [`Error::Remote`].
    pub fn from_remote(classification: &str, message: String) -> Self {
        match classification.parse::<ErrorKind>() {
            Ok(ErrorKind::NotFound) => Error::NotFound(message),
            Ok(ErrorKind::AlreadyExists) => Error::AlreadyExists(message),
            Ok(ErrorKind::NotDirectory) => Error::NotDirectory(message),
            Ok(ErrorKind::IsDirectory) => Error::IsDirectory(message),
            Ok(ErrorKind::NotVersionedFile) => Error::NotVersionedFile(message),
            Ok(ErrorKind::InvalidVersion) => Error::InvalidVersion(message),
            Ok(ErrorKind::IncompatiblePath) => Error::IncompatiblePath(message),
            Ok(ErrorKind::Offline) => Error::Offline(message),
            Ok(ErrorKind::CacheLocationInUse) => Error::CacheLocationInUse(PathBuf::from(message)),
            Ok(ErrorKind::Transport) => Error::Transport(message),
            Ok(ErrorKind::Protocol) => Error::Protocol(message),
            Ok(ErrorKind::InvalidConfig) => Error::InvalidConfig(message),
            Ok(ErrorKind::Io) => Error::Io(io::Error::other(message)),
            Ok(ErrorKind::Remote) | Err(_) => Error::Remote {
                classification: classification.to_string(),
                message,
            },
        }
    }

    /// Map an I/O error on `subject` to the matching typed variant.
    pub fn from_io(err: io::Error, subject: impl std::fmt::Display) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(subject.to_string()),
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(subject.to_string()),
            io::ErrorKind::NotADirectory => Error::NotDirectory(subject.to_string()),
            io::ErrorKind::IsADirectory => Error::IsDirectory(subject.to_string()),
            _ => Error::Io(err),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::Protocol(err.to_string())
        } else {
            Error::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}
