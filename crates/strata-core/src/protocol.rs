//! Wire protocol shared by the client and the server.
//!
//! Endpoints live under a configurable root as `<endpoint>/<path segments>`;
//! metadata travels as JSON, content as octet streams, diffs as plain text.
//! Failures use a single status code with an [`ErrorPayload`] body.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};

use crate::error::Error;
use crate::vfs::{FileMetadata, VersionEntry, VersionSet};

/// Request header selecting the version-info response shape.
pub const HEADER_PROTOCOL_VERSION: &str = "x-protocol-version";
/// Protocol version this crate speaks.
pub const PROTOCOL_VERSION: &str = "2";
/// Status of every structured failure response.
pub const ERROR_STATUS: u16 = 500;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_OCTET: &str = "application/octet-stream";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

// Query parameters.
pub const PARAM_VERSION: &str = "version";
pub const PARAM_V1: &str = "v1";
pub const PARAM_V2: &str = "v2";
pub const PARAM_CONTEXT: &str = "context";
pub const PARAM_TARGET: &str = "target";
pub const PARAM_CREATE_NEW: &str = "createNew";
pub const PARAM_MODE: &str = "mode";
pub const PARAM_ONLY_IF_CHANGED: &str = "onlyIfChanged";
pub const PARAM_COMMENT: &str = "comment";
pub const PARAM_HIDDEN: &str = "hidden";

// ============================================================================
// Endpoints
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    List,
    Info,
    Download,
    Upload,
    CreateDirectory,
    DeleteFile,
    Move,
    VersionInfo,
    VersionDownload,
    VersionUpload,
    VersionSet,
    VersionDiff,
    VersionDelete,
    VersionHide,
    VersionComment,
    VersionConvert,
}

impl Endpoint {
    pub const ALL: [Endpoint; 16] = [
        Endpoint::List,
        Endpoint::Info,
        Endpoint::Download,
        Endpoint::Upload,
        Endpoint::CreateDirectory,
        Endpoint::DeleteFile,
        Endpoint::Move,
        Endpoint::VersionInfo,
        Endpoint::VersionDownload,
        Endpoint::VersionUpload,
        Endpoint::VersionSet,
        Endpoint::VersionDiff,
        Endpoint::VersionDelete,
        Endpoint::VersionHide,
        Endpoint::VersionComment,
        Endpoint::VersionConvert,
    ];

    /// URL path prefix, before the file path segments.
    pub fn prefix(self) -> &'static str {
        match self {
            Endpoint::List => "list",
            Endpoint::Info => "info",
            Endpoint::Download => "download",
            Endpoint::Upload => "upload",
            Endpoint::CreateDirectory => "createDirectory",
            Endpoint::DeleteFile => "deleteFile",
            Endpoint::Move => "move",
            Endpoint::VersionInfo => "version/info",
            Endpoint::VersionDownload => "version/download",
            Endpoint::VersionUpload => "version/upload",
            Endpoint::VersionSet => "version/set",
            Endpoint::VersionDiff => "version/diff",
            Endpoint::VersionDelete => "version/deleteFile",
            Endpoint::VersionHide => "version/hide",
            Endpoint::VersionComment => "version/comment",
            Endpoint::VersionConvert => "version/convert",
        }
    }

    /// Method the client uses.
    pub fn method(self) -> Method {
        match self {
            Endpoint::List
            | Endpoint::Info
            | Endpoint::Download
            | Endpoint::VersionInfo
            | Endpoint::VersionDownload
            | Endpoint::VersionDiff => Method::GET,
            Endpoint::Upload | Endpoint::Move | Endpoint::VersionUpload => Method::POST,
            Endpoint::CreateDirectory
            | Endpoint::VersionSet
            | Endpoint::VersionHide
            | Endpoint::VersionComment
            | Endpoint::VersionConvert => Method::PUT,
            Endpoint::DeleteFile | Endpoint::VersionDelete => Method::DELETE,
        }
    }

    /// Methods the server accepts.
    pub fn accepts(self, method: &Method) -> bool {
        match self {
            Endpoint::Upload => *method == Method::POST || *method == Method::PUT,
            Endpoint::CreateDirectory => *method == Method::PUT || *method == Method::GET,
            Endpoint::Move => *method == Method::POST || *method == Method::GET,
            other => *method == other.method(),
        }
    }

    /// Whether GET responses of this endpoint may be cached.
    pub fn is_cacheable(self) -> bool {
        matches!(
            self,
            Endpoint::List
                | Endpoint::Info
                | Endpoint::Download
                | Endpoint::VersionInfo
                | Endpoint::VersionDownload
                | Endpoint::VersionDiff
        )
    }

    /// Split decoded URL segments into an endpoint and the file path segments.
    pub fn split(segments: &[String]) -> Option<(Endpoint, &[String])> {
        Endpoint::ALL.into_iter().find_map(|endpoint| {
            let prefix: Vec<&str> = endpoint.prefix().split('/').collect();
            let matches = segments.len() >= prefix.len()
                && segments.iter().zip(&prefix).all(|(s, p)| s == p);
            matches.then(|| (endpoint, &segments[prefix.len()..]))
        })
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Body of every failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub exception_classification: String,
    pub message: String,
}

impl From<&Error> for ErrorPayload {
    fn from(err: &Error) -> Self {
        let exception_classification = match err {
            Error::Remote { classification, .. } => classification.clone(),
            other => other.kind().to_string(),
        };
        Self {
            exception_classification,
            message: err.message(),
        }
    }
}

impl ErrorPayload {
    pub fn into_error(self) -> Error {
        Error::from_remote(&self.exception_classification, self.message)
    }
}

/// Version info as served to clients that do not send
/// [`HEADER_PROTOCOL_VERSION`]: no hidden flags or comments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSetV1 {
    pub default_version: u32,
    pub latest_version: u32,
    pub versions: Vec<FileMetadata>,
}

impl From<&VersionSet> for VersionSetV1 {
    fn from(set: &VersionSet) -> Self {
        Self {
            default_version: set.default,
            latest_version: set.latest,
            versions: set.versions.iter().map(|v| v.metadata.clone()).collect(),
        }
    }
}

impl From<VersionSetV1> for VersionSet {
    fn from(v1: VersionSetV1) -> Self {
        let versions = v1
            .versions
            .into_iter()
            .zip(1..)
            .map(|(metadata, version)| VersionEntry {
                version,
                metadata,
                hidden: false,
                comment: String::new(),
            })
            .collect();
        VersionSet {
            default: v1.default_version,
            latest: v1.latest_version,
            versions,
        }
    }
}

/// Either version-info shape; the client accepts both.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VersionInfoBody {
    Current(VersionSet),
    Legacy(VersionSetV1),
}

impl From<VersionInfoBody> for VersionSet {
    fn from(body: VersionInfoBody) -> Self {
        match body {
            VersionInfoBody::Current(set) => set,
            VersionInfoBody::Legacy(v1) => v1.into(),
        }
    }
}

/// How `version/upload` treats the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum UploadMode {
    /// Create a new versioned file; fail if anything exists.
    Create,
    /// Add a revision to an existing versioned file.
    #[default]
    Add,
    /// Create when missing, add otherwise.
    Auto,
}

/// Body of a successful upload. Plain uploads report no version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

// ============================================================================
// Validators
// ============================================================================

/// Strong entity tag for a response body.
pub fn etag_for(body: &[u8]) -> String {
    format!("\"{:x}\"", Sha256::digest(body))
}

/// IMF-fixdate, as used by `Last-Modified`.
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
