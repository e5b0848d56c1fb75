//! File server: serves a [`LocalFileSystem`] over the wire protocol.
//!
//! Each accepted connection gets its own task. The request is parsed on the
//! async side; the filesystem work runs on tokio's blocking pool.

mod handler;
mod http;

pub use http::{Request, Response, read_request, write_response};

use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};

use crate::diff::{DiffEngine, UnifiedDiff};
use crate::error::{Error, Result};
use crate::protocol::CONTENT_TYPE_TEXT;
use crate::vfs::{DEFAULT_DIFF_CONTEXT, LocalFileSystem};

pub struct FileServer {
    local: LocalFileSystem,
    diff: Arc<dyn DiffEngine>,
    diff_context: usize,
    /// Leading URL segments before the endpoint name.
    prefix: Vec<String>,
}

impl FileServer {
    pub fn new(local: LocalFileSystem) -> Self {
        Self {
            local,
            diff: Arc::new(UnifiedDiff),
            diff_context: DEFAULT_DIFF_CONTEXT,
            prefix: Vec::new(),
        }
    }

    pub fn with_diff_engine(mut self, engine: Arc<dyn DiffEngine>) -> Self {
        self.diff = engine;
        self
    }

    /// Context lines for diffs that do not ask for a specific amount.
    pub fn with_diff_context(mut self, context: usize) -> Self {
        self.diff_context = context;
        self
    }

    /// Serve under `prefix` (e.g. `/api`) instead of at the URL root.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    pub fn local(&self) -> &LocalFileSystem {
        &self.local
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        log::info!(
            "serving {} on {}",
            self.local.root_dir().display(),
            listener.local_addr()?
        );
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("accept error: {e}");
                    continue;
                }
            };
            log::debug!("connection from {peer}");

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, server).await {
                    log::warn!("error handling connection from {peer}: {e}");
                }
            });
        }
    }
}

/// Read one request, answer it, close.
async fn handle_connection(stream: TcpStream, server: Arc<FileServer>) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let request = match read_request(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(Error::Protocol(message)) => {
            let response = Response::new(400, CONTENT_TYPE_TEXT, message.into_bytes());
            return write_response(&mut write, &response).await;
        }
        Err(e) => return Err(e),
    };

    let response = tokio::task::spawn_blocking(move || server.handle(&request))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    write_response(&mut write, &response).await
}
