//! Minimal HTTP/1.1 framing for the file server.
//!
//! One request per connection: the parser reads a request line, headers and
//! a `Content-Length` or chunked body; every response closes the connection.

use reqwest::Method;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

const MAX_LINE_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Origin-form target: path and query, still percent-encoded.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), content_type.into())],
            body,
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "",
    }
}

/// Read one line without its terminator. `None` at a clean end of stream.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > MAX_LINE_BYTES {
        return Err(Error::Protocol("request line too long".into()));
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| Error::Protocol("request head is not UTF-8".into()))
}

async fn require_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    read_line(reader)
        .await?
        .ok_or_else(|| Error::Protocol("connection closed mid-request".into()))
}

/// Read one request. `Ok(None)` when the peer closed before sending any.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Request>> {
    let Some(line) = read_line(reader).await? else {
        return Ok(None);
    };
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Protocol(format!("malformed request line: {line:?}")));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(Error::Protocol(format!("unsupported protocol {version}")));
    }
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| Error::Protocol(format!("bad method {method:?}")))?;

    let mut headers = Vec::new();
    loop {
        let line = require_line(reader).await?;
        if line.is_empty() {
            break;
        }
        if headers.len() == MAX_HEADERS {
            return Err(Error::Protocol("too many headers".into()));
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::Protocol(format!("malformed header: {line:?}")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut request = Request {
        method,
        target: target.to_string(),
        headers,
        body: Vec::new(),
    };
    let chunked = request
        .header("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        request.body = read_chunked(reader).await?;
    } else if let Some(length) = request.header("content-length") {
        let length: usize = length
            .parse()
            .map_err(|_| Error::Protocol(format!("bad content-length {length:?}")))?;
        if length > MAX_BODY_BYTES {
            return Err(Error::Protocol(format!("body of {length} bytes is too large")));
        }
        request.body = read_exactly(reader, length, Vec::new()).await?;
    }
    Ok(Some(request))
}

async fn read_chunked<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line = require_line(reader).await?;
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size, 16)
            .map_err(|_| Error::Protocol(format!("bad chunk size {size:?}")))?;
        if size == 0 {
            // trailers
            while !require_line(reader).await?.is_empty() {}
            return Ok(body);
        }
        if body.len() + size > MAX_BODY_BYTES {
            return Err(Error::Protocol("chunked body is too large".into()));
        }
        body = read_exactly(reader, size, body).await?;
        if !require_line(reader).await?.is_empty() {
            return Err(Error::Protocol("missing chunk terminator".into()));
        }
    }
}

/// Append exactly `length` bytes to `body`. Memory grows with the bytes
/// that actually arrive, not with the announced length.
async fn read_exactly<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    length: usize,
    mut body: Vec<u8>,
) -> Result<Vec<u8>> {
    let start = body.len();
    (&mut *reader).take(length as u64).read_to_end(&mut body).await?;
    let received = body.len() - start;
    if received < length {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("body ended after {received} of {length} bytes"),
        )));
    }
    Ok(body)
}

pub async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, reason(response.status));
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    head.push_str("Connection: close\r\n\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&response.body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(raw: &[u8]) -> Result<Option<Request>> {
        read_request(&mut BufReader::new(raw)).await
    }

    #[tokio::test]
    async fn test_content_length_body() {
        let raw = b"POST /upload/a.txt?createNew=true HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let request = parse(raw).await.unwrap().unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.target, "/upload/a.txt?createNew=true");
        assert_eq!(request.header("HOST"), Some("x"));
        assert_eq!(request.body, b"hello");
    }

    #[tokio::test]
    async fn test_chunked_body() {
        let raw = b"POST /upload/a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2;ext=1\r\nde\r\n0\r\n\r\n";
        let request = parse(raw).await.unwrap().unwrap();
        assert_eq!(request.body, b"abcde");
    }

    #[tokio::test]
    async fn test_empty_stream_and_garbage() {
        assert!(parse(b"").await.unwrap().is_none());
        assert!(matches!(parse(b"nonsense\r\n\r\n").await, Err(Error::Protocol(_))));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort").await,
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_announced_length_not_preallocated() {
        // 400 MiB announced, five bytes sent
        let raw = b"POST /upload/a HTTP/1.1\r\nContent-Length: 419430400\r\n\r\nhello";
        assert!(matches!(parse(raw).await, Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof));

        let chunked = b"POST /upload/a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n10000000\r\nabc";
        assert!(matches!(parse(chunked).await, Err(Error::Io(_))));

        let body = read_exactly(&mut BufReader::new(&b"abcdef"[..]), 4, b"xy".to_vec()).await.unwrap();
        assert_eq!(body, b"xyabcd");
    }

    #[tokio::test]
    async fn test_response_framing() {
        let mut out = Vec::new();
        let response = Response::new(200, "text/plain", b"hi".to_vec()).with_header("ETag", "\"t\"");
        write_response(&mut out, &response).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("ETag: \"t\"\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }
}
