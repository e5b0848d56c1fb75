//! Endpoint dispatch: one [`Request`] in, one [`Response`] out.
//!
//! Runs on the blocking pool; every operation maps onto the local store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use reqwest::Method;
use url::Url;

use super::FileServer;
use super::http::{Request, Response};
use crate::error::{Error, Result};
use crate::protocol::{
    CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET, CONTENT_TYPE_TEXT, ERROR_STATUS, Endpoint,
    ErrorPayload, HEADER_PROTOCOL_VERSION, PARAM_COMMENT, PARAM_CONTEXT, PARAM_CREATE_NEW,
    PARAM_HIDDEN, PARAM_MODE, PARAM_ONLY_IF_CHANGED, PARAM_TARGET, PARAM_V1, PARAM_V2,
    PARAM_VERSION, PROTOCOL_VERSION, UploadMode, UploadResponse, VersionSetV1, etag_for,
    http_date, parse_http_date,
};
use crate::vfs::{FileSystem, FsPath, VersionToken};

/// Successful outcome before HTTP framing.
enum Reply {
    Json(Vec<u8>),
    Content {
        body: Vec<u8>,
        modified: Option<DateTime<Utc>>,
    },
    Text(String),
    Empty,
}

fn json<T: serde::Serialize>(value: &T) -> Result<Reply> {
    Ok(Reply::Json(serde_json::to_vec(value)?))
}

struct Query(HashMap<String, String>);

impl Query {
    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    fn flag(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    fn token(&self, name: &str) -> Result<Option<VersionToken>> {
        self.get(name).map(str::parse).transpose()
    }

    /// A required revision number.
    fn number(&self, name: &str) -> Result<u32> {
        let raw = self
            .get(name)
            .ok_or_else(|| Error::InvalidVersion(format!("missing {name} parameter")))?;
        raw.trim()
            .parse()
            .map_err(|_| Error::InvalidVersion(raw.to_string()))
    }
}

fn error_response(err: &Error) -> Response {
    match err {
        Error::NotFound(_) | Error::AlreadyExists(_) | Error::InvalidVersion(_) => {
            log::debug!("request failed: {err}")
        }
        _ => log::warn!("request failed: {err}"),
    }
    match serde_json::to_vec(&ErrorPayload::from(err)) {
        Ok(body) => Response::new(ERROR_STATUS, CONTENT_TYPE_JSON, body),
        Err(_) => Response::new(ERROR_STATUS, CONTENT_TYPE_TEXT, err.to_string().into_bytes()),
    }
}

/// Whether the client's validators show its copy is current.
fn not_modified(request: &Request, etag: &str, modified: Option<DateTime<Utc>>) -> bool {
    if let Some(tags) = request.header("if-none-match") {
        return tags.split(',').any(|t| {
            let t = t.trim();
            t == "*" || t == etag
        });
    }
    match (request.header("if-modified-since").and_then(parse_http_date), modified) {
        (Some(since), Some(modified)) => modified.timestamp() <= since.timestamp(),
        _ => false,
    }
}

impl FileServer {
    /// Answer one request.
    pub fn handle(&self, request: &Request) -> Response {
        let url = match Url::parse(&format!("http://localhost{}", request.target)) {
            Ok(url) => url,
            Err(e) => return Response::new(400, CONTENT_TYPE_TEXT, e.to_string().into_bytes()),
        };
        let segments: Vec<String> = match url.path_segments() {
            Some(segments) => segments
                .filter(|s| !s.is_empty())
                .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
                .collect(),
            None => Vec::new(),
        };
        let Some(rest) = segments.strip_prefix(self.prefix.as_slice()) else {
            return Response::empty(404);
        };
        let Some((endpoint, file_segments)) = Endpoint::split(rest) else {
            return Response::empty(404);
        };
        if !endpoint.accepts(&request.method) {
            return Response::empty(405).with_header("Allow", endpoint.method().as_str());
        }

        let path = self.local.path(&format!("/{}", file_segments.join("/")));
        let query = Query(url.query_pairs().into_owned().collect());
        log::debug!("{} {} {path}", request.method, endpoint.prefix());

        match self.dispatch(endpoint, &path, &query, request) {
            Ok(reply) => self.frame(reply, request),
            Err(e) => error_response(&e),
        }
    }

    fn frame(&self, reply: Reply, request: &Request) -> Response {
        let (content_type, body, modified) = match reply {
            Reply::Empty => return Response::empty(200),
            Reply::Json(body) => (CONTENT_TYPE_JSON, body, None),
            Reply::Text(text) => (CONTENT_TYPE_TEXT, text.into_bytes(), None),
            Reply::Content { body, modified } => (CONTENT_TYPE_OCTET, body, modified),
        };
        if request.method != Method::GET {
            return Response::new(200, content_type, body);
        }

        let etag = etag_for(&body);
        if not_modified(request, &etag, modified) {
            return Response::empty(304).with_header("ETag", etag);
        }
        let mut response = Response::new(200, content_type, body).with_header("ETag", etag);
        if let Some(modified) = modified {
            response = response.with_header("Last-Modified", http_date(modified));
        }
        response
    }

    fn dispatch(
        &self,
        endpoint: Endpoint,
        path: &FsPath,
        query: &Query,
        request: &Request,
    ) -> Result<Reply> {
        let local = &self.local;
        match endpoint {
            Endpoint::List => {
                let mut metadata = local.stat(path)?;
                metadata.children = Some(local.list_dir(path)?);
                json(&metadata)
            }
            Endpoint::Info => json(&local.stat(path)?),
            Endpoint::Download => {
                let body = local.read_file(path)?;
                let modified = local.stat(path).ok().and_then(|m| m.last_modified_time);
                Ok(Reply::Content { body, modified })
            }
            Endpoint::Upload => {
                let version = local.write_file(path, &request.body, query.flag(PARAM_CREATE_NEW))?;
                json(&UploadResponse { version })
            }
            Endpoint::CreateDirectory => {
                local.mkdir(path)?;
                Ok(Reply::Empty)
            }
            Endpoint::DeleteFile => {
                local.remove(path)?;
                Ok(Reply::Empty)
            }
            Endpoint::Move => {
                let target = query
                    .get(PARAM_TARGET)
                    .ok_or_else(|| Error::Protocol("move needs a target parameter".into()))?;
                local.move_entry(path, &local.path(target))?;
                Ok(Reply::Empty)
            }
            Endpoint::VersionInfo => {
                let set = local.versioned_file(path)?.version_set()?;
                if request.header(HEADER_PROTOCOL_VERSION) == Some(PROTOCOL_VERSION) {
                    json(&set)
                } else {
                    json(&VersionSetV1::from(&set))
                }
            }
            Endpoint::VersionDownload => {
                let file = local.versioned_file(path)?;
                let version = file.resolve(query.token(PARAM_VERSION)?.unwrap_or(VersionToken::Default))?;
                let body = file.read(VersionToken::Explicit(version))?;
                let modified = file.revision_metadata(version)?.last_modified_time;
                Ok(Reply::Content { body, modified })
            }
            Endpoint::VersionUpload => self.version_upload(path, query, &request.body),
            Endpoint::VersionSet => {
                let raw = String::from_utf8_lossy(&request.body);
                let version: u32 = raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::InvalidVersion(raw.trim().to_string()))?;
                local.versioned_file(path)?.set_default_version(version)?;
                Ok(Reply::Empty)
            }
            Endpoint::VersionDiff => {
                let from = query.token(PARAM_V1)?.unwrap_or(VersionToken::Default);
                let to = query.token(PARAM_V2)?.unwrap_or(VersionToken::Latest);
                let context = match query.get(PARAM_CONTEXT) {
                    Some(raw) => raw
                        .parse()
                        .map_err(|_| Error::Protocol(format!("bad context {raw:?}")))?,
                    None => self.diff_context,
                };
                let lines = local
                    .versioned_file(path)?
                    .diff(from, to, context, self.diff.as_ref())?;
                let mut text = lines.join("\n");
                if !text.is_empty() {
                    text.push('\n');
                }
                Ok(Reply::Text(text))
            }
            Endpoint::VersionDelete => {
                local.versioned_file(path)?.delete()?;
                Ok(Reply::Empty)
            }
            Endpoint::VersionHide => {
                let hidden = query.get(PARAM_HIDDEN).is_none_or(|v| v.eq_ignore_ascii_case("true"));
                local
                    .versioned_file(path)?
                    .set_hidden(query.number(PARAM_VERSION)?, hidden)?;
                Ok(Reply::Empty)
            }
            Endpoint::VersionComment => {
                let comment = String::from_utf8_lossy(&request.body);
                local
                    .versioned_file(path)?
                    .set_comment(query.number(PARAM_VERSION)?, &comment)?;
                Ok(Reply::Empty)
            }
            Endpoint::VersionConvert => {
                local.convert_to_versioned(path)?;
                Ok(Reply::Empty)
            }
        }
    }

    /// `create` needs a free target, `add` an existing versioned file; `auto`
    /// takes whichever applies and converts a plain file first.
    fn version_upload(&self, path: &FsPath, query: &Query, body: &[u8]) -> Result<Reply> {
        let local = &self.local;
        let mode = match query.get(PARAM_MODE) {
            Some(raw) => raw
                .parse::<UploadMode>()
                .map_err(|_| Error::Protocol(format!("unknown upload mode {raw:?}")))?,
            None => UploadMode::default(),
        };
        let only_if_changed = query.flag(PARAM_ONLY_IF_CHANGED);

        let create = match mode {
            UploadMode::Create => true,
            UploadMode::Add => false,
            UploadMode::Auto => !local.contains(path)?,
        };
        let (file, version, created) = if create {
            (local.create_versioned(path, body)?, 1, true)
        } else {
            let file = match local.versioned_file(path) {
                Err(Error::NotVersionedFile(_)) if mode == UploadMode::Auto => {
                    local.convert_to_versioned(path)?
                }
                other => other?,
            };
            let before = file.latest()?;
            let version = file.add_version(body, only_if_changed)?;
            (file, version, version != before)
        };

        if created
            && let Some(comment) = query.get(PARAM_COMMENT)
            && !comment.is_empty()
        {
            file.set_comment(version, comment)?;
        }
        json(&UploadResponse {
            version: Some(version),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::LocalFileSystem;
    use tempfile::TempDir;

    fn server() -> (TempDir, FileServer) {
        let tmp = TempDir::new().unwrap();
        let local = LocalFileSystem::new(tmp.path().join("root")).unwrap();
        (tmp, FileServer::new(local))
    }

    fn request(method: Method, target: &str, body: &[u8]) -> Request {
        Request {
            method,
            target: target.to_string(),
            headers: vec![(HEADER_PROTOCOL_VERSION.into(), PROTOCOL_VERSION.into())],
            body: body.to_vec(),
        }
    }

    fn payload(response: &Response) -> ErrorPayload {
        assert_eq!(response.status, ERROR_STATUS);
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn test_upload_download_and_etag() {
        let (_tmp, server) = server();
        let put = server.handle(&request(Method::POST, "/upload/a%20b.txt", b"hello"));
        assert_eq!(put.status, 200);

        let get = server.handle(&request(Method::GET, "/download/a%20b.txt", b""));
        assert_eq!(get.status, 200);
        assert_eq!(get.body, b"hello");
        assert!(get.header("last-modified").is_some());
        let etag = get.header("etag").unwrap().to_string();

        let mut conditional = request(Method::GET, "/download/a%20b.txt", b"");
        conditional.headers.push(("If-None-Match".into(), etag));
        let cached = server.handle(&conditional);
        assert_eq!(cached.status, 304);
        assert!(cached.body.is_empty());
    }

    #[test]
    fn test_errors_travel_as_payloads() {
        let (_tmp, server) = server();
        let missing = server.handle(&request(Method::GET, "/info/nope", b""));
        assert_eq!(payload(&missing).exception_classification, "not_found");

        server.handle(&request(Method::POST, "/upload/a", b"x"));
        let again = server.handle(&request(Method::POST, "/upload/a?createNew=true", b"y"));
        assert_eq!(payload(&again).exception_classification, "already_exists");

        let plain = server.handle(&request(Method::GET, "/version/info/a", b""));
        assert_eq!(payload(&plain).exception_classification, "not_versioned_file");
    }

    #[test]
    fn test_routing_failures() {
        let (_tmp, server) = server();
        assert_eq!(server.handle(&request(Method::GET, "/bogus/a", b"")).status, 404);
        assert_eq!(server.handle(&request(Method::GET, "/version/set/a", b"")).status, 405);
        // createDirectory and move also answer GET
        assert_eq!(server.handle(&request(Method::GET, "/createDirectory/d", b"")).status, 200);
    }

    #[test]
    fn test_prefix_is_required() {
        let (tmp, _) = server();
        let local = LocalFileSystem::new(tmp.path().join("other")).unwrap();
        let server = FileServer::new(local).with_prefix("/api/v1/");
        assert_eq!(server.handle(&request(Method::GET, "/list", b"")).status, 404);
        assert_eq!(server.handle(&request(Method::GET, "/api/v1/list", b"")).status, 200);
    }

    #[test]
    fn test_version_upload_modes() {
        let (_tmp, server) = server();
        let version = |response: Response| {
            assert_eq!(response.status, 200, "{:?}", String::from_utf8_lossy(&response.body));
            serde_json::from_slice::<UploadResponse>(&response.body).unwrap().version
        };

        let add_missing = server.handle(&request(Method::POST, "/version/upload/v.txt?mode=add", b"1"));
        assert_eq!(payload(&add_missing).exception_classification, "not_found");

        assert_eq!(version(server.handle(&request(Method::POST, "/version/upload/v.txt?mode=create", b"1"))), Some(1));
        assert_eq!(version(server.handle(&request(Method::POST, "/version/upload/v.txt?mode=add&comment=two", b"2"))), Some(2));
        assert_eq!(
            version(server.handle(&request(Method::POST, "/version/upload/v.txt?onlyIfChanged=true&comment=ignored", b"2"))),
            Some(2)
        );

        server.handle(&request(Method::POST, "/upload/plain.txt", b"p"));
        assert_eq!(version(server.handle(&request(Method::POST, "/version/upload/plain.txt?mode=auto", b"q"))), Some(2));

        let info = server.handle(&request(Method::GET, "/version/info/v.txt", b""));
        let set: crate::vfs::VersionSet = serde_json::from_slice(&info.body).unwrap();
        assert_eq!(set.version_numbers(), vec![1, 2]);
        assert_eq!(set.get(2).unwrap().comment, "two");
    }

    #[test]
    fn test_version_info_shapes() {
        let (_tmp, server) = server();
        server.handle(&request(Method::POST, "/version/upload/v?mode=create", b"1"));
        let mut legacy = request(Method::GET, "/version/info/v", b"");
        legacy.headers.clear();
        let body: serde_json::Value = serde_json::from_slice(&server.handle(&legacy).body).unwrap();
        assert_eq!(body["defaultVersion"], 1);
        assert_eq!(body["latestVersion"], 1);

        let current = server.handle(&request(Method::GET, "/version/info/v", b""));
        let body: serde_json::Value = serde_json::from_slice(&current.body).unwrap();
        assert!(body.get("defaultVersion").is_none());
    }

    #[test]
    fn test_set_default_and_diff() {
        let (_tmp, server) = server();
        server.handle(&request(Method::POST, "/version/upload/f.txt?mode=create", b"a\nb\n"));
        server.handle(&request(Method::POST, "/version/upload/f.txt", b"a\nc\n"));

        assert_eq!(server.handle(&request(Method::PUT, "/version/set/f.txt", b"2")).status, 200);
        let out_of_range = server.handle(&request(Method::PUT, "/version/set/f.txt", b"9"));
        assert_eq!(payload(&out_of_range).exception_classification, "invalid_version");

        let read = server.handle(&request(Method::GET, "/version/download/f.txt", b""));
        assert_eq!(read.body, b"a\nc\n");

        let diff = server.handle(&request(Method::GET, "/version/diff/f.txt?v1=1&v2=2", b""));
        let text = String::from_utf8(diff.body).unwrap();
        assert!(text.contains("-b\n"));
        assert!(text.contains("+c\n"));
    }

    #[test]
    fn test_hide_comment_convert_delete() {
        let (_tmp, server) = server();
        server.handle(&request(Method::POST, "/upload/c.txt", b"one"));
        assert_eq!(server.handle(&request(Method::PUT, "/version/convert/c.txt", b"")).status, 200);
        server.handle(&request(Method::PUT, "/version/hide/c.txt?version=1", b""));
        server.handle(&request(Method::PUT, "/version/comment/c.txt?version=1", b"first"));

        let info = server.handle(&request(Method::GET, "/version/info/c.txt", b""));
        let set: crate::vfs::VersionSet = serde_json::from_slice(&info.body).unwrap();
        let entry = set.get(1).unwrap();
        assert!(entry.hidden);
        assert_eq!(entry.comment, "first");

        assert_eq!(server.handle(&request(Method::DELETE, "/version/deleteFile/c.txt", b"")).status, 200);
        let gone = server.handle(&request(Method::GET, "/info/c.txt", b""));
        assert_eq!(payload(&gone).exception_classification, "not_found");
    }

    #[test]
    fn test_plain_endpoints_cannot_reach_revisions() {
        let (_tmp, server) = server();
        server.handle(&request(Method::POST, "/version/upload/v.txt?mode=create", b"one"));
        server.handle(&request(Method::POST, "/version/upload/v.txt", b"two"));

        let delete = server.handle(&request(Method::DELETE, "/deleteFile/v.txt/1", b""));
        assert_eq!(payload(&delete).exception_classification, "not_directory");
        let steal = server.handle(&request(Method::POST, "/move/v.txt/2?target=/stolen", b""));
        assert_eq!(payload(&steal).exception_classification, "not_directory");
        let mkdir = server.handle(&request(Method::PUT, "/createDirectory/v.txt/x", b""));
        assert_eq!(payload(&mkdir).exception_classification, "not_directory");
        let pointer = server.handle(&request(Method::GET, "/download/v.txt/default", b""));
        assert_eq!(payload(&pointer).exception_classification, "not_directory");
        let notes = server.handle(&request(Method::GET, "/info/v.txt/.meta.json", b""));
        assert_eq!(payload(&notes).exception_classification, "not_directory");

        let info = server.handle(&request(Method::GET, "/version/info/v.txt", b""));
        let set: crate::vfs::VersionSet = serde_json::from_slice(&info.body).unwrap();
        assert_eq!(set.version_numbers(), vec![1, 2]);
        assert_eq!((set.default, set.latest), (1, 2));
        let latest = server.handle(&request(Method::GET, "/version/download/v.txt?version=latest", b""));
        assert_eq!(latest.body, b"two");
    }

    #[test]
    fn test_list_and_move() {
        let (_tmp, server) = server();
        server.handle(&request(Method::PUT, "/createDirectory/d", b""));
        server.handle(&request(Method::POST, "/upload/d/a", b"x"));
        assert_eq!(server.handle(&request(Method::POST, "/move/d/a?target=/d/b", b"")).status, 200);

        let list = server.handle(&request(Method::GET, "/list/d", b""));
        let metadata: crate::vfs::FileMetadata = serde_json::from_slice(&list.body).unwrap();
        let names: Vec<_> = metadata.children.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["b"]);
    }
}
