//! Client side of the git smart protocol, upload-pack direction only.
//!
//! [`fetch`] talks to a remote over `git://` or smart-HTTP, negotiates
//! wants against the caller's haves, and returns the advertised refs plus
//! a streaming packfile reader. Pack internals are never inspected beyond
//! the empty-pack length check.

pub mod pktline;
mod transport;

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::StreamReader;

pub use transport::PackStream;
use transport::Framing;

const GIT_PORT: u16 = 9418;

/// A valid-but-empty packfile: 12-byte header plus 20-byte SHA-1 trailer.
const EMPTY_PACK_LEN: u64 = 32;

#[derive(Debug, Error)]
pub enum GitError {
    /// The remote reported a condition: HTTP 401/404/5xx on discovery, an
    /// `ERR` advertisement line, or a side-band channel-3 message.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported scheme in {0}")]
    UnsupportedScheme(String),

    #[error(transparent)]
    PktLine(#[from] pktline::PktLineError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Outcome of a fetch: the refs the remote advertised (pull-request and
/// peeled entries already dropped) and the pack stream. `pack` is `None`
/// both when we already had everything and when the remote sent the empty
/// pack, either way there is nothing to store.
pub struct FetchResult {
    pub refs: BTreeMap<String, String>,
    pub pack: Option<PackStream>,
}

/// Fetch `url`, negotiating against `haves`.
pub async fn fetch(url: &str, haves: &HashSet<String>) -> Result<FetchResult, GitError> {
    if url.starts_with("git://") {
        fetch_git(url, haves).await
    } else if url.starts_with("http://") || url.starts_with("https://") {
        fetch_http(url, haves).await
    } else {
        Err(GitError::UnsupportedScheme(url.to_string()))
    }
}

async fn fetch_git(url: &str, haves: &HashSet<String>) -> Result<FetchResult, GitError> {
    let (host, port, path) = split_git_url(url)?;

    // Deliberately no dial timeout; git servers are allowed to stall.
    let mut conn = tokio::net::TcpStream::connect((host.as_str(), port)).await?;

    let mut discovery = Vec::new();
    pktline::write_packet(
        &mut discovery,
        format!("git-upload-pack {path}\0host={host}\0").as_bytes(),
    )?;
    conn.write_all(&discovery).await?;

    let refs = transport::parse_advertisement(&mut conn, Framing::Git).await?;

    let Some(request) = transport::build_request(&refs, haves)? else {
        return Ok(FetchResult { refs, pack: None });
    };
    conn.write_all(&request).await?;

    sieve_pack(refs, Box::new(conn)).await
}

async fn fetch_http(url: &str, haves: &HashSet<String>) -> Result<FetchResult, GitError> {
    let client = reqwest::Client::builder()
        .user_agent(crate::USER_AGENT)
        .build()?;

    let resp = client
        .get(format!("{url}/info/refs?service=git-upload-pack"))
        .send()
        .await?;
    let status = resp.status();
    if status.as_u16() == 401 || status.as_u16() == 404 || status.is_server_error() {
        return Err(GitError::Remote(status.to_string()));
    }
    if !status.is_success() {
        return Err(GitError::Protocol(format!(
            "GET /info/refs: {}",
            status.as_u16()
        )));
    }
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type != "application/x-git-upload-pack-advertisement" {
        return Err(GitError::Protocol(format!(
            "unexpected advertisement content-type {content_type:?}"
        )));
    }

    let mut body = body_reader(resp);
    let refs = transport::parse_advertisement(&mut body, Framing::Http).await?;

    let Some(request) = transport::build_request(&refs, haves)? else {
        return Ok(FetchResult { refs, pack: None });
    };

    let resp = client
        .post(format!("{url}/git-upload-pack"))
        .header(
            reqwest::header::CONTENT_TYPE,
            "application/x-git-upload-pack-request",
        )
        .header(
            reqwest::header::ACCEPT,
            "application/x-git-upload-pack-result",
        )
        .body(request)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(GitError::Protocol(format!(
            "POST /git-upload-pack: {}",
            resp.status().as_u16()
        )));
    }

    sieve_pack(refs, Box::new(body_reader(resp))).await
}

fn body_reader(resp: reqwest::Response) -> impl AsyncRead + Send + Unpin {
    use futures::TryStreamExt;
    StreamReader::new(resp.bytes_stream().map_err(std::io::Error::other))
}

/// Wrap the raw response in the side-band demuxer and peek far enough to
/// recognize the empty pack, which is reported as no pack at all.
async fn sieve_pack(
    refs: BTreeMap<String, String>,
    upstream: Box<dyn AsyncRead + Send + Unpin>,
) -> Result<FetchResult, GitError> {
    let mut pack = PackStream::new(upstream);

    let mut peeked = Vec::new();
    let mut total = 0u64;
    while total < EMPTY_PACK_LEN * 2 {
        match pack.next_chunk().await? {
            Some(chunk) => {
                total += chunk.len() as u64;
                peeked.push(chunk);
            }
            None => break,
        }
    }
    if total == EMPTY_PACK_LEN {
        return Ok(FetchResult { refs, pack: None });
    }

    pack.unread(peeked);
    Ok(FetchResult { refs, pack: Some(pack) })
}

fn split_git_url(url: &str) -> Result<(String, u16, String), GitError> {
    let rest = url
        .strip_prefix("git://")
        .ok_or_else(|| GitError::UnsupportedScheme(url.to_string()))?;
    let (hostport, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = match hostport.rsplit_once(':') {
        Some((h, p)) => (
            h.to_string(),
            p.parse::<u16>()
                .map_err(|_| GitError::Protocol(format!("bad port in {url:?}")))?,
        ),
        None => (hostport.to_string(), GIT_PORT),
    };
    if host.is_empty() {
        return Err(GitError::Protocol(format!("missing host in {url:?}")));
    }
    Ok((host, port, path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_git_url() {
        let (host, port, path) = split_git_url("git://github.com/go-git/go-git.git").unwrap();
        assert_eq!(host, "github.com");
        assert_eq!(port, 9418);
        assert_eq!(path, "/go-git/go-git.git");

        let (host, port, path) = split_git_url("git://localhost:9419/x.git").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 9419);
        assert_eq!(path, "/x.git");
    }

    #[test]
    fn test_split_git_url_rejects_garbage() {
        assert!(split_git_url("https://github.com/x").is_err());
        assert!(split_git_url("git://:9418/x").is_err());
        assert!(split_git_url("git://host:notaport/x").is_err());
    }

    fn sideband_body(pack: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        pktline::write_packet(&mut out, b"NAK\n").unwrap();
        for chunk in pack.chunks(16) {
            let mut frame = vec![1u8];
            frame.extend_from_slice(chunk);
            pktline::write_packet(&mut out, &frame).unwrap();
        }
        pktline::write_flush(&mut out);
        out
    }

    #[tokio::test]
    async fn test_sieve_reports_empty_pack() {
        // 12-byte header + 20-byte trailer, nothing else.
        let body = sideband_body(&[0u8; 32]);
        let result = sieve_pack(BTreeMap::new(), Box::new(std::io::Cursor::new(body)))
            .await
            .unwrap();
        assert!(result.pack.is_none());
    }

    #[tokio::test]
    async fn test_sieve_passes_real_pack_through() {
        let pack: Vec<u8> = (0u8..100).collect();
        let body = sideband_body(&pack);
        let result = sieve_pack(BTreeMap::new(), Box::new(std::io::Cursor::new(body)))
            .await
            .unwrap();

        let mut stream = result.pack.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, pack);
    }

    #[tokio::test]
    async fn test_sieve_keeps_33_byte_pack() {
        // One byte over the empty-pack size must not be swallowed.
        let body = sideband_body(&[7u8; 33]);
        let result = sieve_pack(BTreeMap::new(), Box::new(std::io::Cursor::new(body)))
            .await
            .unwrap();
        assert!(result.pack.is_some());
    }
}
