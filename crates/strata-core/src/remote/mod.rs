//! Remote filesystem client.
//!
//! Turns path operations into calls against the file server's endpoints.
//! GETs go through the [`HttpCache`]; mutations bypass it, are refused while
//! the server is known to be unreachable, and invalidate the entries they
//! make stale.
//!
//! Paths handed out by a [`RemoteFileSystem`] are bound to its base URL;
//! paths from any other filesystem are rejected with
//! [`Error::IncompatiblePath`].

mod stream;

pub use stream::{RemoteReader, RemoteWriter, WriteOutcome};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use reqwest::header::{CONTENT_TYPE, ETAG, HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use url::Url;

use crate::config::FsConfig;
use crate::error::{Error, Result};
use crate::http_cache::{CacheEntry, HttpCache, Lookup};
use crate::protocol::{
    CONTENT_TYPE_OCTET, Endpoint, ErrorPayload, HEADER_PROTOCOL_VERSION, PARAM_COMMENT,
    PARAM_CONTEXT, PARAM_CREATE_NEW, PARAM_HIDDEN, PARAM_MODE, PARAM_ONLY_IF_CHANGED,
    PARAM_TARGET, PARAM_V1, PARAM_V2, PARAM_VERSION, PROTOCOL_VERSION, UploadMode,
    UploadResponse, VersionInfoBody,
};
use crate::vfs::{
    Attributes, BoxFuture, FileMetadata, FileSystem, FsPath, OpenOption, PathFactory,
    ReadOptions, VersionSet, VersionToken, WriteOptions, split_versioned_path,
};
use stream::PendingEntry;

type Query = Vec<(&'static str, String)>;

struct RemoteIdentity(String);

impl PathFactory for RemoteIdentity {
    fn identity(&self) -> &str {
        &self.0
    }
}

struct Inner {
    factory: Arc<dyn PathFactory>,
    base: Url,
    http: Client,
    cache: Arc<HttpCache>,
    /// Server-reported versioned flags, by absolute path.
    versioned: Mutex<HashMap<String, bool>>,
}

/// Handle on a remote file store. Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct RemoteFileSystem {
    inner: Arc<Inner>,
}

/// A GET answered from the cache or still streaming from the server.
enum Fetched {
    Cached(CacheEntry),
    Network {
        response: Response,
        pending: Option<PendingEntry>,
    },
}

impl Fetched {
    async fn bytes(self) -> Result<Arc<[u8]>> {
        match self {
            Fetched::Cached(entry) => Ok(entry.shared_content()),
            Fetched::Network { response, pending } => {
                let content: Arc<[u8]> = Arc::from(&response.bytes().await?[..]);
                if let Some(pending) = pending {
                    pending.commit(Arc::clone(&content));
                }
                Ok(content)
            }
        }
    }

    fn into_reader(self) -> RemoteReader {
        match self {
            Fetched::Cached(entry) => RemoteReader::buffered(entry.shared_content()),
            Fetched::Network { response, pending } => RemoteReader::network(response, pending),
        }
    }
}

fn header(response: &Response, name: HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Pass successful responses through; rebuild the typed failure otherwise.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    match serde_json::from_slice::<ErrorPayload>(&body) {
        Ok(payload) => Err(payload.into_error()),
        Err(_) => Err(Error::Remote {
            classification: format!("http_{}", status.as_u16()),
            message: String::from_utf8_lossy(&body).into_owned(),
        }),
    }
}

fn key(path: &FsPath) -> String {
    path.to_absolute_path().normalize().to_string()
}

impl RemoteFileSystem {
    /// Open a filesystem; with a disk cache mode this takes the disk lock.
    pub fn open(config: FsConfig) -> Result<Self> {
        let base = config.base_url()?;
        let cache = Arc::new(HttpCache::open(config.cache.clone())?);

        let mut builder = Client::builder();
        if let Some(timeout) = config.connect_timeout() {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = config.read_timeout() {
            builder = builder.read_timeout(timeout);
        }
        let http = builder.build()?;

        log::debug!("opened remote filesystem at {base}");
        let factory: Arc<dyn PathFactory> = Arc::new(RemoteIdentity(base.to_string()));
        Ok(Self {
            inner: Arc::new(Inner {
                factory,
                base,
                http,
                cache,
                versioned: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base
    }

    pub fn root(&self) -> FsPath {
        self.path("/")
    }

    pub fn cache(&self) -> &Arc<HttpCache> {
        &self.inner.cache
    }

    /// Persist the cache. The handle stays usable.
    pub fn close(&self) -> Result<()> {
        self.inner.cache.flush()
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn ensure_own(&self, path: &FsPath) -> Result<()> {
        if path.identity() != self.inner.factory.identity() {
            return Err(Error::IncompatiblePath(format!(
                "{path} belongs to {}, not {}",
                path.identity(),
                self.inner.factory.identity()
            )));
        }
        Ok(())
    }

    fn url(&self, endpoint: Endpoint, path: &FsPath, query: &[(&str, String)]) -> Result<Url> {
        self.ensure_own(path)?;
        let mut url = self.inner.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig(format!("{} cannot be a base URL", self.inner.base)))?
            .pop_if_empty()
            .extend(endpoint.prefix().split('/'))
            .extend(path.to_absolute_path().normalize().segments());
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Send a request, tracking whether the server could be reached.
    async fn dispatch(&self, request: RequestBuilder) -> Result<Response> {
        match request.send().await {
            Ok(response) => {
                self.inner.cache.mark_reachable(true);
                Ok(response)
            }
            Err(e) => {
                if e.is_connect() || e.is_timeout() {
                    self.inner.cache.mark_reachable(false);
                }
                Err(e.into())
            }
        }
    }

    /// GET through the cache.
    async fn fetch(&self, url: Url) -> Result<Fetched> {
        let cache = &self.inner.cache;
        let uri = url.to_string();
        let (stale, cacheable) = match cache.lookup(&uri) {
            Lookup::Fresh(entry) => return Ok(Fetched::Cached(entry)),
            Lookup::Revalidate(entry) => (Some(entry), true),
            Lookup::Miss => (None, true),
            Lookup::Bypass => (None, false),
        };

        let mut request = self
            .inner
            .http
            .get(url)
            .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION);
        if let Some(entry) = &stale {
            if let Some(etag) = entry.etag() {
                request = request.header(IF_NONE_MATCH, etag);
            } else if let Some(modified) = entry.last_modified() {
                request = request.header(IF_MODIFIED_SINCE, modified);
            }
        }

        let response = match self.dispatch(request).await {
            Ok(response) => response,
            Err(err @ Error::Transport(_)) => {
                return cache.fallback(&uri, err).map(Fetched::Cached);
            }
            Err(err) => return Err(err),
        };
        if response.status() == StatusCode::NOT_MODIFIED {
            return cache
                .confirm(&uri)
                .map(Fetched::Cached)
                .ok_or_else(|| Error::Protocol(format!("unsolicited 304 for {uri}")));
        }

        let response = check_status(response).await?;
        let pending = cacheable.then(|| PendingEntry {
            cache: Arc::clone(cache),
            content_type: header(&response, CONTENT_TYPE),
            etag: header(&response, ETAG),
            last_modified: header(&response, LAST_MODIFIED),
            uri,
        });
        Ok(Fetched::Network { response, pending })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        path: &FsPath,
        query: &[(&str, String)],
    ) -> Result<T> {
        let body = self.fetch(self.url(endpoint, path, query)?).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Any non-GET call; returns the response body.
    async fn send(
        &self,
        endpoint: Endpoint,
        path: &FsPath,
        query: &[(&str, String)],
        body: Option<Vec<u8>>,
    ) -> Result<bytes::Bytes> {
        let method = endpoint.method();
        self.inner.cache.check_method(&method)?;
        let mut request = self
            .inner
            .http
            .request(method, self.url(endpoint, path, query)?)
            .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION);
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, CONTENT_TYPE_OCTET).body(body);
        }
        let response = check_status(self.dispatch(request).await?).await?;
        Ok(response.bytes().await?)
    }

    // ========================================================================
    // Versioned flags and invalidation
    // ========================================================================

    fn known_versioned(&self, path: &FsPath) -> Option<bool> {
        let flags = self.inner.versioned.lock().unwrap_or_else(PoisonError::into_inner);
        flags.get(&key(path)).copied()
    }

    fn remember_versioned(&self, path: &FsPath, versioned: bool) {
        let mut flags = self.inner.versioned.lock().unwrap_or_else(PoisonError::into_inner);
        flags.insert(key(path), versioned);
    }

    /// Drop cached responses made stale by a mutation of `path`: its own
    /// GET endpoints, anything below it, and its parent's listing.
    fn invalidate(&self, path: &FsPath) {
        {
            let prefix = key(path);
            let mut flags = self.inner.versioned.lock().unwrap_or_else(PoisonError::into_inner);
            flags.retain(|p, _| p != &prefix && !p.starts_with(&format!("{prefix}/")));
        }

        let own: Vec<String> = Endpoint::ALL
            .into_iter()
            .filter(|e| e.is_cacheable())
            .filter_map(|e| self.url(e, path, &[]).ok())
            .map(|u| u.to_string())
            .collect();
        let parent = path
            .to_absolute_path()
            .parent()
            .and_then(|p| self.url(Endpoint::List, &p, &[]).ok())
            .map(|u| u.to_string());

        let dropped = self.inner.cache.invalidate(|uri| {
            let exact = |base: &str| {
                uri == base
                    || uri
                        .strip_prefix(base)
                        .is_some_and(|rest| rest.starts_with('?'))
            };
            own.iter()
                .any(|base| exact(base.as_str()) || uri.starts_with(&format!("{base}/")))
                || parent.as_deref().is_some_and(exact)
        });
        log::debug!("{path}: invalidated {dropped} cached responses");
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Metadata of `dir` with its children.
    pub async fn list_dir(&self, dir: &FsPath) -> Result<FileMetadata> {
        self.get_json(Endpoint::List, dir, &[]).await
    }

    /// One path per child of `dir`.
    pub async fn children(&self, dir: &FsPath) -> Result<Vec<FsPath>> {
        let listing = self.list_dir(dir).await?;
        Ok(listing
            .children
            .unwrap_or_default()
            .into_iter()
            .map(|child| {
                let path = dir.join(&child.name);
                self.remember_versioned(&path, child.is_versioned_file);
                path
            })
            .collect())
    }

    /// Plain metadata. A versioned file reports itself as "other" with
    /// `is_versioned_file` set; `name(n).ext` reports revision `n`.
    pub async fn stat(&self, path: &FsPath) -> Result<FileMetadata> {
        match self.get_json::<FileMetadata>(Endpoint::Info, path, &[]).await {
            Ok(metadata) => {
                self.remember_versioned(path, metadata.is_versioned_file);
                Ok(metadata)
            }
            Err(Error::NotFound(message)) => match split_versioned_path(path) {
                Ok((base, Some(token))) => {
                    let set = self.versions(&base).await?;
                    let version = set.resolve(token)?;
                    set.get(version)
                        .map(|entry| entry.metadata.clone())
                        .ok_or_else(|| Error::InvalidVersion(format!("{base}: {version}")))
                }
                _ => Err(Error::NotFound(message)),
            },
            Err(e) => Err(e),
        }
    }

    /// Full revision history of a versioned file.
    pub async fn versions(&self, path: &FsPath) -> Result<VersionSet> {
        let body: VersionInfoBody = self.get_json(Endpoint::VersionInfo, path, &[]).await?;
        self.remember_versioned(path, true);
        Ok(body.into())
    }

    /// Plain or versioned view, depending on the server's flag.
    pub async fn attributes(&self, path: &FsPath) -> Result<Attributes> {
        let metadata = self.stat(path).await?;
        if !metadata.is_versioned_file {
            return Ok(Attributes::Plain(metadata));
        }
        let versions = self.versions(path).await?;
        Ok(Attributes::Versioned { metadata, versions })
    }

    /// Whether the server reported `path` as a versioned file. Asked once per
    /// path; later calls use the remembered answer.
    pub async fn is_versioned(&self, path: &FsPath) -> Result<bool> {
        if let Some(known) = self.known_versioned(path) {
            return Ok(known);
        }
        Ok(self.stat(path).await?.is_versioned_file)
    }

    pub async fn contains(&self, path: &FsPath) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Unified diff between two revisions.
    pub async fn diff(
        &self,
        path: &FsPath,
        from: VersionToken,
        to: VersionToken,
        context: usize,
    ) -> Result<Vec<String>> {
        let query = [
            (PARAM_V1, from.to_string()),
            (PARAM_V2, to.to_string()),
            (PARAM_CONTEXT, context.to_string()),
        ];
        let url = self.url(Endpoint::VersionDiff, path, &query)?;
        let body = self.fetch(url).await?.bytes().await?;
        Ok(String::from_utf8_lossy(&body)
            .lines()
            .map(str::to_string)
            .collect())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Open file content for reading.
    ///
    /// A [`OpenOption::Version`] or a `name(version).ext` path selects a
    /// revision; a suffix that matches no versioned file falls back to the
    /// plain file of that literal name. [`OpenOption::Diff`] reads the diff
    /// text instead of content.
    pub async fn open_read(&self, path: &FsPath, options: &[OpenOption]) -> Result<RemoteReader> {
        let read = ReadOptions::from_options(options);
        if let Some((from, to, context)) = read.diff {
            let mut text = self.diff(path, from, to, context).await?.join("\n");
            if !text.is_empty() {
                text.push('\n');
            }
            return Ok(RemoteReader::buffered(Arc::from(text.into_bytes())));
        }

        let (base, suffix) = split_versioned_path(path).unwrap_or_else(|_| (path.clone(), None));
        if let Some(token) = read.version {
            return self.download_version(&base, token).await;
        }
        if let Some(token) = suffix {
            match self.download_version(&base, token).await {
                Err(Error::NotFound(_) | Error::NotVersionedFile(_)) => {}
                other => return other,
            }
        }
        let url = self.url(Endpoint::Download, path, &[])?;
        Ok(self.fetch(url).await?.into_reader())
    }

    async fn download_version(&self, path: &FsPath, token: VersionToken) -> Result<RemoteReader> {
        let url = self.url(Endpoint::VersionDownload, path, &[(PARAM_VERSION, token.to_string())])?;
        Ok(self.fetch(url).await?.into_reader())
    }

    /// Whole content; see [`open_read`](Self::open_read).
    pub async fn read_bytes(&self, path: &FsPath, options: &[OpenOption]) -> Result<Vec<u8>> {
        let mut reader = self.open_read(path, options).await?;
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .await
            .map_err(|e| Error::Transport(format!("{path}: {e}")))?;
        Ok(content)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Start an upload.
    ///
    /// The upload is versioned when an option asks for it, when the path
    /// carries a version suffix, or when the server already reported the
    /// target as versioned. Errors from the server surface from
    /// [`RemoteWriter::close`].
    pub async fn open_write(&self, path: &FsPath, options: &[OpenOption]) -> Result<RemoteWriter> {
        let write = WriteOptions::from_options(options);
        let (base, suffix) = split_versioned_path(path).unwrap_or_else(|_| (path.clone(), None));
        let versioned = write.requests_versioning()
            || suffix.is_some()
            || self.known_versioned(&base) == Some(true);

        let (endpoint, target, query): (Endpoint, FsPath, Query) = if versioned {
            let mode = if write.create_new {
                UploadMode::Create
            } else if write.create_or_update || write.versioned {
                UploadMode::Auto
            } else {
                UploadMode::Add
            };
            let mut query: Query = vec![(PARAM_MODE, mode.to_string())];
            if write.only_if_changed {
                query.push((PARAM_ONLY_IF_CHANGED, "true".to_string()));
            }
            if let Some(comment) = write.comment {
                query.push((PARAM_COMMENT, comment));
            }
            (Endpoint::VersionUpload, base, query)
        } else {
            let mut query = Query::new();
            if write.create_new {
                query.push((PARAM_CREATE_NEW, "true".to_string()));
            }
            (Endpoint::Upload, path.clone(), query)
        };

        let method = endpoint.method();
        self.inner.cache.check_method(&method)?;
        let url = self.url(endpoint, &target, &query)?;
        let (tx, body) = stream::channel_body();
        let request = self
            .inner
            .http
            .request(method, url)
            .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION)
            .header(CONTENT_TYPE, CONTENT_TYPE_OCTET)
            .body(body);

        let client = self.clone();
        let task = tokio::spawn(async move {
            let response = check_status(client.dispatch(request).await?).await?;
            let body = response.bytes().await?;
            let version = if body.is_empty() {
                None
            } else {
                serde_json::from_slice::<UploadResponse>(&body)?.version
            };
            Ok(WriteOutcome { version })
        });

        let client = self.clone();
        let after_close = Box::new(move || {
            client.invalidate(&target);
            if versioned {
                client.remember_versioned(&target, true);
            }
        });
        Ok(RemoteWriter::new(tx, task, after_close))
    }

    /// Upload `data` in one go; see [`open_write`](Self::open_write).
    pub async fn write_bytes(
        &self,
        path: &FsPath,
        data: &[u8],
        options: &[OpenOption],
    ) -> Result<WriteOutcome> {
        let mut writer = self.open_write(path, options).await?;
        writer.write(data).await?;
        writer.close().await
    }

    pub async fn mkdir(&self, path: &FsPath) -> Result<()> {
        self.send(Endpoint::CreateDirectory, path, &[], None).await?;
        self.invalidate(path);
        Ok(())
    }

    /// Delete a file, an empty directory, or a whole versioned file.
    pub async fn remove(&self, path: &FsPath) -> Result<()> {
        let endpoint = if self.known_versioned(path) == Some(true) {
            Endpoint::VersionDelete
        } else {
            Endpoint::DeleteFile
        };
        self.send(endpoint, path, &[], None).await?;
        self.invalidate(path);
        Ok(())
    }

    /// Move `src` to `dst`, which must not exist.
    pub async fn move_to(&self, src: &FsPath, dst: &FsPath) -> Result<()> {
        self.ensure_own(dst)?;
        let target = key(dst);
        self.send(Endpoint::Move, src, &[(PARAM_TARGET, target)], None)
            .await?;
        self.invalidate(src);
        self.invalidate(dst);
        Ok(())
    }

    pub async fn set_default_version(&self, path: &FsPath, version: u32) -> Result<()> {
        let body = version.to_string().into_bytes();
        self.send(Endpoint::VersionSet, path, &[], Some(body)).await?;
        self.invalidate(path);
        Ok(())
    }

    pub async fn set_hidden(&self, path: &FsPath, version: u32, hidden: bool) -> Result<()> {
        let query = [(PARAM_VERSION, version.to_string()), (PARAM_HIDDEN, hidden.to_string())];
        self.send(Endpoint::VersionHide, path, &query, None).await?;
        self.invalidate(path);
        Ok(())
    }

    /// Set a revision's comment; an empty comment clears it.
    pub async fn set_comment(&self, path: &FsPath, version: u32, comment: &str) -> Result<()> {
        let query = [(PARAM_VERSION, version.to_string())];
        let body = comment.as_bytes().to_vec();
        self.send(Endpoint::VersionComment, path, &query, Some(body)).await?;
        self.invalidate(path);
        Ok(())
    }

    /// Turn a plain file into a versioned file with one revision.
    pub async fn convert_to_versioned(&self, path: &FsPath) -> Result<()> {
        self.send(Endpoint::VersionConvert, path, &[], None).await?;
        self.invalidate(path);
        self.remember_versioned(path, true);
        Ok(())
    }
}

impl FileSystem for RemoteFileSystem {
    fn path(&self, raw: &str) -> FsPath {
        FsPath::parse(Arc::clone(&self.inner.factory), raw)
    }

    fn list<'a>(&'a self, dir: &'a FsPath) -> BoxFuture<'a, Result<Vec<FsPath>>> {
        Box::pin(self.children(dir))
    }

    fn metadata<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<FileMetadata>> {
        Box::pin(self.stat(path))
    }

    fn read<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(self.read_bytes(path, &[]))
    }

    fn write<'a>(&'a self, path: &'a FsPath, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.write_bytes(path, data, &[]).await.map(|_| ()) })
    }

    fn create_directory<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.mkdir(path))
    }

    fn delete<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.remove(path))
    }

    fn rename<'a>(&'a self, src: &'a FsPath, dst: &'a FsPath) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.move_to(src, dst))
    }

    fn exists<'a>(&'a self, path: &'a FsPath) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.contains(path))
    }
}
