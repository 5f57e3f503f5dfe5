//! Reference advertisement parsing, want/have negotiation, and the
//! side-band-64k pack stream.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use tokio::io::AsyncRead;

use super::pktline::{self, Packet};
use super::GitError;

/// Framing differences between the two transports: smart-HTTP prefixes the
/// advertisement with a service header and terminates it at EOF, while
/// `git://` terminates it at the first flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Http,
    Git,
}

#[derive(Debug, Clone, Copy)]
enum AdvertState {
    ServiceHeader,
    Head,
    RefList,
}

impl AdvertState {
    fn name(self) -> &'static str {
        match self {
            AdvertState::ServiceHeader => "service-header",
            AdvertState::Head => "head",
            AdvertState::RefList => "ref-list",
        }
    }
}

fn keep_ref(name: &str) -> bool {
    // Pull-request heads are not archived, and peeled `^{}` entries are
    // advertisement-only duplicates the server refuses as wants.
    !name.starts_with("refs/pull/") && !name.ends_with("^{}")
}

/// Parse a `git-upload-pack` reference advertisement into a refs map.
pub(crate) async fn parse_advertisement<R: AsyncRead + Unpin>(
    r: &mut R,
    framing: Framing,
) -> Result<BTreeMap<String, String>, GitError> {
    let mut refs = BTreeMap::new();
    let mut state = match framing {
        Framing::Http => AdvertState::ServiceHeader,
        Framing::Git => AdvertState::Head,
    };

    loop {
        let packet = match pktline::read_packet(r).await? {
            None => return Ok(refs),
            Some(p) => p,
        };
        let payload = match packet {
            Packet::Flush => match framing {
                Framing::Git => return Ok(refs),
                Framing::Http => continue,
            },
            Packet::Data(p) => p,
        };

        let mut line = String::from_utf8_lossy(&payload).into_owned();
        if line.ends_with('\n') {
            line.pop();
        }

        match state {
            AdvertState::ServiceHeader => {
                if line != "# service=git-upload-pack" {
                    return Err(GitError::Protocol(format!(
                        "failed parsing advertisement at state {}",
                        state.name()
                    )));
                }
                state = AdvertState::Head;
            }

            AdvertState::Head => {
                if let Some(msg) = line.strip_prefix("ERR") {
                    return Err(GitError::Remote(msg.trim().to_string()));
                }

                let (head, _capabilities) = line.split_once('\0').ok_or_else(|| {
                    GitError::Protocol(format!(
                        "failed parsing advertisement at state {}",
                        state.name()
                    ))
                })?;
                let (oid, name) = head.split_once(' ').ok_or_else(|| {
                    GitError::Protocol(format!(
                        "failed parsing advertisement at state {}",
                        state.name()
                    ))
                })?;
                if keep_ref(name) {
                    refs.insert(name.to_string(), oid.to_string());
                }
                state = AdvertState::RefList;
            }

            AdvertState::RefList => {
                let (oid, name) = line.split_once(' ').ok_or_else(|| {
                    GitError::Protocol(format!(
                        "failed parsing advertisement at state {}",
                        state.name()
                    ))
                })?;
                if keep_ref(name) {
                    refs.insert(name.to_string(), oid.to_string());
                }
            }
        }
    }
}

/// Build the upload-pack request body: wants not already held, a flush,
/// our haves, and `done`. `None` when the advertisement contains nothing
/// new, in which case no request must be sent at all.
pub(crate) fn build_request(
    refs: &BTreeMap<String, String>,
    haves: &HashSet<String>,
) -> Result<Option<Vec<u8>>, GitError> {
    let wants: BTreeSet<&str> = refs
        .values()
        .filter(|oid| !haves.contains(oid.as_str()))
        .map(String::as_str)
        .collect();

    if wants.is_empty() {
        return Ok(None);
    }

    let mut body = Vec::new();
    let mut first = true;
    for want in wants {
        let line = if first {
            first = false;
            format!(
                "want {want} ofs-delta side-band-64k thin-pack agent={}\n",
                crate::USER_AGENT
            )
        } else {
            format!("want {want}\n")
        };
        pktline::write_packet(&mut body, line.as_bytes())?;
    }
    pktline::write_flush(&mut body);

    let sorted_haves: BTreeSet<&str> = haves.iter().map(String::as_str).collect();
    for have in sorted_haves {
        pktline::write_packet(&mut body, format!("have {have}\n").as_bytes())?;
    }
    body.extend_from_slice(b"0009done\n");

    Ok(Some(body))
}

/// De-multiplexed packfile stream.
///
/// Channel 1 frames come out of [`next_chunk`](Self::next_chunk), channel 2
/// progress lines go to the log, channel 3 aborts with a remote error. The
/// stream ends at the top-level flush (or EOF over HTTP).
pub struct PackStream {
    upstream: Box<dyn AsyncRead + Send + Unpin>,
    pending: VecDeque<Vec<u8>>,
    done: bool,
    /// De-sidebanded pack bytes handed out so far.
    pub bytes_read: u64,
}

impl PackStream {
    pub(crate) fn new(upstream: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        PackStream {
            upstream,
            pending: VecDeque::new(),
            done: false,
            bytes_read: 0,
        }
    }

    /// Push already-read chunks back to the front of the stream.
    pub(crate) fn unread(&mut self, chunks: Vec<Vec<u8>>) {
        for chunk in chunks.into_iter().rev() {
            self.pending.push_front(chunk);
        }
    }

    /// Next slice of pack data, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, GitError> {
        if let Some(chunk) = self.pending.pop_front() {
            return Ok(Some(chunk));
        }
        if self.done {
            return Ok(None);
        }

        loop {
            let packet = match pktline::read_packet(&mut self.upstream).await? {
                None | Some(Packet::Flush) => {
                    self.done = true;
                    return Ok(None);
                }
                Some(Packet::Data(p)) => p,
            };

            if packet == b"NAK\n" {
                continue;
            }

            match packet.first().copied() {
                Some(1) => {
                    let data = packet[1..].to_vec();
                    self.bytes_read += data.len() as u64;
                    return Ok(Some(data));
                }
                Some(2) => {
                    let msg = String::from_utf8_lossy(&packet[1..]);
                    tracing::debug!(remote = %msg.trim_end(), "upload-pack progress");
                }
                Some(3) => {
                    let msg = String::from_utf8_lossy(&packet[1..]);
                    return Err(GitError::Remote(msg.trim().to_string()));
                }
                _ => {
                    return Err(GitError::Protocol(
                        "empty side-band packet".to_string(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // An advertisement as served over smart-HTTP, including entries that
    // must be filtered: pull-request refs and a peeled tag.
    fn http_advertisement() -> Vec<u8> {
        let mut out = Vec::new();
        pktline::write_packet(&mut out, b"# service=git-upload-pack\n").unwrap();
        pktline::write_flush(&mut out);
        pktline::write_packet(
            &mut out,
            b"21d7ee08fb632ae032079e10b41f5987531ba0cc HEAD\0multi_ack side-band-64k ofs-delta thin-pack agent=git/2.6.5\n",
        )
        .unwrap();
        pktline::write_packet(
            &mut out,
            b"21d7ee08fb632ae032079e10b41f5987531ba0cc refs/heads/master\n",
        )
        .unwrap();
        pktline::write_packet(
            &mut out,
            b"8f07421ada5140010afd7b00b313781401cd36b5 refs/heads/gh-pages\n",
        )
        .unwrap();
        pktline::write_packet(
            &mut out,
            b"7661c0ea4e01cfed9213bee6e5e95370466d3f00 refs/pull/1/head\n",
        )
        .unwrap();
        pktline::write_packet(
            &mut out,
            b"991e7b86c792ff58ee65217c76cf3fe4ccfb6d5c refs/tags/v1.0\n",
        )
        .unwrap();
        pktline::write_packet(
            &mut out,
            b"d6b92fed1e0f7a43f7de49a2b8acf2fce7c1353b refs/tags/v1.0^{}\n",
        )
        .unwrap();
        pktline::write_flush(&mut out);
        out
    }

    #[tokio::test]
    async fn test_parse_http_advertisement() {
        let data = http_advertisement();
        let mut r = &data[..];
        let refs = parse_advertisement(&mut r, Framing::Http).await.unwrap();

        let expected: BTreeMap<String, String> = [
            ("HEAD", "21d7ee08fb632ae032079e10b41f5987531ba0cc"),
            ("refs/heads/master", "21d7ee08fb632ae032079e10b41f5987531ba0cc"),
            ("refs/heads/gh-pages", "8f07421ada5140010afd7b00b313781401cd36b5"),
            ("refs/tags/v1.0", "991e7b86c792ff58ee65217c76cf3fe4ccfb6d5c"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(refs, expected);
    }

    #[tokio::test]
    async fn test_parse_git_advertisement_stops_at_flush() {
        let mut data = Vec::new();
        pktline::write_packet(
            &mut data,
            b"21d7ee08fb632ae032079e10b41f5987531ba0cc HEAD\0side-band-64k\n",
        )
        .unwrap();
        pktline::write_flush(&mut data);
        // Anything after the flush belongs to the next protocol phase.
        data.extend_from_slice(b"garbage");

        let mut r = &data[..];
        let refs = parse_advertisement(&mut r, Framing::Git).await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(
            refs["HEAD"],
            "21d7ee08fb632ae032079e10b41f5987531ba0cc"
        );
    }

    #[tokio::test]
    async fn test_err_line_surfaces_as_remote_error() {
        let mut data = Vec::new();
        pktline::write_packet(&mut data, b"ERR access denied or repository not exported\n")
            .unwrap();
        let mut r = &data[..];
        let err = parse_advertisement(&mut r, Framing::Git)
            .await
            .unwrap_err();
        match err {
            GitError::Remote(msg) => {
                assert_eq!(msg, "access denied or repository not exported")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_service_header_is_protocol_error() {
        let mut data = Vec::new();
        pktline::write_packet(
            &mut data,
            b"21d7ee08fb632ae032079e10b41f5987531ba0cc HEAD\0caps\n",
        )
        .unwrap();
        let mut r = &data[..];
        assert!(matches!(
            parse_advertisement(&mut r, Framing::Http).await,
            Err(GitError::Protocol(_))
        ));
    }

    fn refs_fixture() -> BTreeMap<String, String> {
        [
            ("HEAD", "bbbb000000000000000000000000000000000000"),
            ("refs/heads/master", "bbbb000000000000000000000000000000000000"),
            ("refs/heads/dev", "aaaa000000000000000000000000000000000000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[tokio::test]
    async fn test_build_request_dedups_and_sorts_wants() {
        let body = build_request(&refs_fixture(), &HashSet::new())
            .unwrap()
            .unwrap();
        let text = String::from_utf8(body).unwrap();

        // HEAD and master share an object id, so two wants total, sorted.
        let first = format!(
            "want aaaa000000000000000000000000000000000000 ofs-delta side-band-64k thin-pack agent={}\n",
            crate::USER_AGENT
        );
        let mut expected = Vec::new();
        pktline::write_packet(&mut expected, first.as_bytes()).unwrap();
        pktline::write_packet(
            &mut expected,
            b"want bbbb000000000000000000000000000000000000\n",
        )
        .unwrap();
        pktline::write_flush(&mut expected);
        expected.extend_from_slice(b"0009done\n");
        assert_eq!(text, String::from_utf8(expected).unwrap());
    }

    #[tokio::test]
    async fn test_build_request_emits_haves() {
        let haves: HashSet<String> =
            ["aaaa000000000000000000000000000000000000".to_string()].into();
        let body = build_request(&refs_fixture(), &haves).unwrap().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("have aaaa000000000000000000000000000000000000\n"));
        assert!(!text.contains("want aaaa"));
        assert!(text.ends_with("0009done\n"));
    }

    #[tokio::test]
    async fn test_build_request_no_wants() {
        let haves: HashSet<String> = [
            "aaaa000000000000000000000000000000000000".to_string(),
            "bbbb000000000000000000000000000000000000".to_string(),
        ]
        .into();
        assert!(build_request(&refs_fixture(), &haves).unwrap().is_none());
    }

    fn sideband(frames: &[(u8, &[u8])], trailing_flush: bool) -> Vec<u8> {
        let mut out = Vec::new();
        pktline::write_packet(&mut out, b"NAK\n").unwrap();
        for (channel, data) in frames {
            let mut frame = vec![*channel];
            frame.extend_from_slice(data);
            pktline::write_packet(&mut out, &frame).unwrap();
        }
        if trailing_flush {
            pktline::write_flush(&mut out);
        }
        out
    }

    #[tokio::test]
    async fn test_pack_stream_demux() {
        let data = sideband(
            &[
                (2, &b"Counting objects: 10, done.\n"[..]),
                (1, &b"PACKdata"[..]),
                (2, &b"Compressing objects: 100%\n"[..]),
                (1, &b"morepack"[..]),
            ],
            true,
        );
        let mut stream = PackStream::new(Box::new(std::io::Cursor::new(data)));

        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"PACKdata");
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"morepack");
        assert!(stream.next_chunk().await.unwrap().is_none());
        // Ended; stays ended.
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert_eq!(stream.bytes_read, 16);
    }

    #[tokio::test]
    async fn test_pack_stream_error_channel() {
        let data = sideband(&[(1, &b"PACK"[..]), (3, &b"fatal: out of memory\n"[..])], false);
        let mut stream = PackStream::new(Box::new(std::io::Cursor::new(data)));

        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"PACK");
        match stream.next_chunk().await {
            Err(GitError::Remote(msg)) => assert_eq!(msg, "fatal: out of memory"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pack_stream_unread() {
        let data = sideband(&[(1, &b"tail"[..])], true);
        let mut stream = PackStream::new(Box::new(std::io::Cursor::new(data)));
        stream.unread(vec![b"head".to_vec(), b"mid".to_vec()]);

        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"head");
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"mid");
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"tail");
        assert!(stream.next_chunk().await.unwrap().is_none());
    }
}
