//! Decoy responder for unauthenticated peers.
//!
//! A prober that completes the TLS handshake without a trusted certificate
//! gets whatever the configured reference origin is currently serving,
//! fetched live for every connection, then the connection is closed.
//!
//! ```text
//! prober ──TLS──► [discard request head] ─► fetch origin ─► render ─► write, close
//! ```

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};

/// Deadline for reading the prober's request head.
pub const HEADER_READ_DEADLINE: Duration = Duration::from_secs(10);
/// Deadline for writing the decoy response.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(30);
/// Timeout for the outbound fetch of the reference origin.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on request-head bytes read before giving up on finding its end.
const MAX_REQUEST_HEAD: u64 = 64 * 1024;

/// Headers recomputed by [`render_response`] rather than copied.
const FRAMING_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// A fetched origin response, body fully buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponse {
    /// HTTP status code
    pub status: u16,
    /// Header name/value pairs in the order received; repeated names allowed
    pub headers: Vec<(String, Vec<u8>)>,
    /// Complete body
    pub body: Bytes,
}

/// Source of decoy content.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// Fetch a fresh copy of the reference page.
    async fn fetch(&self) -> Result<OriginResponse>;
}

/// Fetches the reference origin over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpsOrigin {
    client: reqwest::Client,
    url: String,
}

impl HttpsOrigin {
    /// `origin` is either a bare host (`example.com`) or a full URL.
    pub fn new(origin: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: origin_url(origin),
        })
    }

    /// Absolute URL fetched for every probe.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl OriginFetcher for HttpsOrigin {
    async fn fetch(&self) -> Result<OriginResponse> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::decoy(format!("fetch {} failed: {}", self.url, e)))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::decoy(format!("reading {} body failed: {}", self.url, e)))?;

        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}

fn origin_url(origin: &str) -> String {
    if origin.contains("://") {
        origin.to_string()
    } else {
        format!("https://{}", origin)
    }
}

/// Title-case a header name (`content-type` -> `Content-Type`).
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Serialize `resp` as an HTTP/1.1 response with a recomputed
/// `Content-Length` and `Connection: close`.
pub fn render_response(resp: &OriginResponse) -> Bytes {
    let reason = reqwest::StatusCode::from_u16(resp.status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("");

    let mut head = String::new();
    // Writing to a String cannot fail.
    let _ = write!(head, "HTTP/1.1 {} {}\r\n", resp.status, reason);

    let mut out = BytesMut::with_capacity(head.len() + resp.body.len() + 512);
    out.put_slice(head.as_bytes());

    for (name, value) in &resp.headers {
        if FRAMING_HEADERS
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        out.put_slice(canonical_header_name(name).as_bytes());
        out.put_slice(b": ");
        out.put_slice(value);
        out.put_slice(b"\r\n");
    }

    out.put_slice(format!("Content-Length: {}\r\n", resp.body.len()).as_bytes());
    out.put_slice(b"Connection: close\r\n\r\n");
    out.put_slice(&resp.body);
    out.freeze()
}

/// Serves decoy responses.
#[derive(Clone)]
pub struct Decoy {
    fetcher: Arc<dyn OriginFetcher>,
}

impl Decoy {
    /// Serve content from `fetcher`.
    pub fn new(fetcher: Arc<dyn OriginFetcher>) -> Self {
        Self { fetcher }
    }

    /// Consume the request head, then answer with a fresh copy of the
    /// origin's response and close `stream`.
    ///
    /// A malformed or slow request is not an error: after the read deadline
    /// the responder carries on as if the head had ended.
    pub async fn respond<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut reader = BufReader::new(stream);
        if tokio::time::timeout(HEADER_READ_DEADLINE, discard_request_head(&mut reader))
            .await
            .is_err()
        {
            tracing::debug!("request head not finished before deadline");
        }

        let response = self.fetcher.fetch().await?;
        let bytes = render_response(&response);

        let mut stream = reader.into_inner();
        let written = tokio::time::timeout(WRITE_DEADLINE, async {
            stream.write_all(&bytes).await?;
            stream.shutdown().await
        })
        .await;

        match written {
            Ok(res) => {
                res?;
                tracing::debug!(status = response.status, len = bytes.len(), "decoy served");
                Ok(())
            }
            Err(_) => Err(Error::timeout("decoy write", WRITE_DEADLINE)),
        }
    }
}

impl std::fmt::Debug for Decoy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoy").finish_non_exhaustive()
    }
}

/// Read lines until an empty one, EOF, an error, or the size cap.
async fn discard_request_head<R>(reader: &mut R)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut limited = reader.take(MAX_REQUEST_HEAD);
    let mut line = Vec::new();
    loop {
        line.clear();
        match limited.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) if line == b"\r\n" || line == b"\n" => break,
            Ok(_) => {}
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{sample_response, StaticOrigin};
    use super::*;

    fn split_response(raw: &[u8]) -> (Vec<String>, Vec<u8>) {
        let pos = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("no end of head");
        let head = String::from_utf8(raw[..pos].to_vec()).unwrap();
        let lines = head.split("\r\n").map(str::to_string).collect();
        (lines, raw[pos + 4..].to_vec())
    }

    #[test]
    fn test_render_status_and_headers() {
        let rendered = render_response(&sample_response());
        let (lines, body) = split_response(&rendered);

        assert_eq!(lines[0], "HTTP/1.1 404 Not Found");
        assert_eq!(
            &lines[1..],
            &[
                "Content-Type: text/html; charset=utf-8",
                "Set-Cookie: a=1",
                "Set-Cookie: b=2",
                "Server: nginx",
                "Content-Length: 21",
                "Connection: close",
            ]
        );
        assert_eq!(body, b"<html>not here</html>");
    }

    #[test]
    fn test_render_replaces_framing_headers() {
        let mut resp = sample_response();
        resp.status = 200;
        resp.headers.push(("Content-Length".into(), b"99999".to_vec()));
        resp.headers.push(("transfer-encoding".into(), b"chunked".to_vec()));
        resp.headers.push(("connection".into(), b"keep-alive".to_vec()));

        let rendered = render_response(&resp);
        let (lines, body) = split_response(&rendered);

        assert_eq!(lines[0], "HTTP/1.1 200 OK");
        let lengths: Vec<_> = lines
            .iter()
            .filter(|l| l.to_ascii_lowercase().starts_with("content-length"))
            .collect();
        assert_eq!(lengths, vec!["Content-Length: 21"]);
        assert_eq!(body.len(), 21);
        assert!(!lines.iter().any(|l| l.contains("chunked")));
        assert!(!lines.iter().any(|l| l.contains("keep-alive")));
    }

    #[test]
    fn test_render_unknown_status() {
        let resp = OriginResponse {
            status: 599,
            headers: Vec::new(),
            body: Bytes::new(),
        };
        let rendered = render_response(&resp);
        assert!(rendered.starts_with(b"HTTP/1.1 599 \r\n"));
        assert!(rendered.ends_with(b"Content-Length: 0\r\nConnection: close\r\n\r\n"));
    }

    #[test]
    fn test_origin_url() {
        assert_eq!(origin_url("www.example.com"), "https://www.example.com");
        assert_eq!(
            origin_url("http://127.0.0.1:8080/x"),
            "http://127.0.0.1:8080/x"
        );
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("x-frame-options"), "X-Frame-Options");
        assert_eq!(canonical_header_name("ETAG"), "Etag");
    }

    #[tokio::test]
    async fn test_respond_after_request_head() {
        let origin = Arc::new(StaticOrigin::new(sample_response()));
        let decoy = Decoy::new(origin.clone());
        let (server, mut client) = tokio::io::duplex(64 * 1024);

        let task = tokio::spawn(async move { decoy.respond(server).await });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();

        task.await.unwrap().unwrap();
        assert_eq!(raw, render_response(&sample_response()).to_vec());
        assert_eq!(origin.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_respond_tolerates_garbage() {
        let origin = Arc::new(StaticOrigin::new(sample_response()));
        let decoy = Decoy::new(origin);
        let (server, mut client) = tokio::io::duplex(64 * 1024);

        client.write_all(b"\x16\x03\x01garbage").await.unwrap();
        client.shutdown().await.unwrap();
        decoy.respond(server).await.unwrap();

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        assert!(raw.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_prober_still_answered() {
        let origin = Arc::new(StaticOrigin::new(sample_response()));
        let decoy = Decoy::new(origin);
        let (server, mut client) = tokio::io::duplex(64 * 1024);

        let task = tokio::spawn(async move { decoy.respond(server).await });

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        task.await.unwrap().unwrap();
        assert!(raw.starts_with(b"HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_fetch_failure_closes_connection() {
        let decoy = Decoy::new(Arc::new(StaticOrigin::failing()));
        let (server, mut client) = tokio::io::duplex(1024);

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let err = decoy.respond(server).await.unwrap_err();
        assert!(matches!(err, Error::Decoy(_)));

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        assert!(raw.is_empty());
    }
}
