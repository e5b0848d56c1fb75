//! Streaming download and upload handles.

use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;

use crate::error::{Error, Result};
use crate::http_cache::{CacheEntry, HttpCache};

/// Chunks buffered between a writer and its in-flight request.
const UPLOAD_CHANNEL_DEPTH: usize = 8;

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

// ============================================================================
// Downloads
// ============================================================================

/// Response metadata kept for the entry a download commits.
pub(crate) struct PendingEntry {
    pub(crate) cache: Arc<HttpCache>,
    pub(crate) uri: String,
    pub(crate) content_type: Option<String>,
    pub(crate) etag: Option<String>,
    pub(crate) last_modified: Option<String>,
}

impl PendingEntry {
    pub(crate) fn commit(self, body: impl Into<Arc<[u8]>>) {
        let entry = CacheEntry::new(body, self.content_type, self.etag, self.last_modified);
        self.cache.store(&self.uri, entry);
    }
}

/// Passes a body stream through while copying it aside; the copy becomes a
/// cache entry at end of stream. A failed stream commits nothing.
struct TeeStream {
    inner: ByteStream,
    pending: Option<(PendingEntry, Vec<u8>)>,
}

impl Stream for TeeStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(self.inner.poll_next_unpin(cx));
        match &item {
            Some(Ok(chunk)) => {
                if let Some((_, buf)) = self.pending.as_mut() {
                    buf.extend_from_slice(chunk);
                }
            }
            Some(Err(_)) => self.pending = None,
            None => {
                if let Some((pending, buf)) = self.pending.take() {
                    pending.commit(buf);
                }
            }
        }
        Poll::Ready(item)
    }
}

enum Source {
    Buffered(Cursor<Arc<[u8]>>),
    Network(StreamReader<TeeStream, Bytes>),
}

/// Content of a remote file, read incrementally.
///
/// Either replays cached bytes or streams the HTTP response body without
/// buffering it whole (unless it is being copied into the cache).
pub struct RemoteReader {
    source: Source,
}

impl RemoteReader {
    pub(crate) fn buffered(content: Arc<[u8]>) -> Self {
        Self {
            source: Source::Buffered(Cursor::new(content)),
        }
    }

    pub(crate) fn network(response: reqwest::Response, pending: Option<PendingEntry>) -> Self {
        let inner: ByteStream = Box::pin(response.bytes_stream().map(|r| r.map_err(io::Error::other)));
        let tee = TeeStream {
            inner,
            pending: pending.map(|p| (p, Vec::new())),
        };
        Self {
            source: Source::Network(StreamReader::new(tee)),
        }
    }

    /// Whether the content comes from the cache rather than the network.
    pub fn is_buffered(&self) -> bool {
        matches!(self.source, Source::Buffered(_))
    }
}

impl AsyncRead for RemoteReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().source {
            Source::Buffered(cursor) => Pin::new(cursor).poll_read(cx, buf),
            Source::Network(reader) => Pin::new(reader).poll_read(cx, buf),
        }
    }
}

// ============================================================================
// Uploads
// ============================================================================

/// Result of a completed upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Revision created (or kept) by a versioned upload.
    pub version: Option<u32>,
}

/// Request body fed from a channel.
pub(crate) fn channel_body() -> (mpsc::Sender<Bytes>, reqwest::Body) {
    let (tx, rx) = mpsc::channel::<Bytes>(UPLOAD_CHANNEL_DEPTH);
    let chunks = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, io::Error>(chunk), rx))
    });
    (tx, reqwest::Body::wrap_stream(chunks))
}

type AfterClose = Box<dyn FnOnce() + Send>;

/// Upload in progress.
///
/// Bytes go to the request while it is in flight. The server's answer is
/// only observed by [`close`](RemoteWriter::close): a rejected or failed
/// upload surfaces there, never from [`write`](RemoteWriter::write).
pub struct RemoteWriter {
    tx: Option<mpsc::Sender<Bytes>>,
    task: Option<JoinHandle<Result<WriteOutcome>>>,
    after_close: Option<AfterClose>,
}

impl RemoteWriter {
    pub(crate) fn new(
        tx: mpsc::Sender<Bytes>,
        task: JoinHandle<Result<WriteOutcome>>,
        after_close: AfterClose,
    ) -> Self {
        Self {
            tx: Some(tx),
            task: Some(task),
            after_close: Some(after_close),
        }
    }

    /// Queue bytes for the request body.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let closed = match &self.tx {
            Some(tx) => tx.send(Bytes::copy_from_slice(data)).await.is_err(),
            None => false,
        };
        if closed {
            // the request already finished; close() reports how
            self.tx = None;
        }
        Ok(())
    }

    /// End the body and wait for the server's acknowledgement.
    pub async fn close(mut self) -> Result<WriteOutcome> {
        self.tx = None;
        let Some(task) = self.task.take() else {
            return Err(Error::Protocol("upload already closed".into()));
        };
        let outcome = task
            .await
            .map_err(|e| Error::Transport(format!("upload task failed: {e}")))??;
        if let Some(after_close) = self.after_close.take() {
            after_close();
        }
        Ok(outcome)
    }
}

impl Drop for RemoteWriter {
    fn drop(&mut self) {
        // dropped without close: abandon the request
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
