//! Pkt-line framing, the unit of git's smart wire protocol.
//!
//! Every frame starts with four hex digits giving the total frame length
//! (header included); `0000` is the flush marker that separates protocol
//! sections.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload that fits the four-digit length header.
pub const MAX_PAYLOAD: usize = 0xffff - 4;

pub const FLUSH: &[u8] = b"0000";

#[derive(Debug, Error)]
pub enum PktLineError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bad pkt-line length header {0:?}")]
    BadLength(String),

    #[error("pkt-line payload of {0} bytes exceeds the frame limit")]
    Oversize(usize),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Packet {
    Flush,
    Data(Vec<u8>),
}

/// Read one pkt-line. Returns `None` on a clean EOF at a frame boundary;
/// EOF inside a frame is an error.
pub async fn read_packet<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<Packet>, PktLineError> {
    let mut header = [0u8; 4];
    if !read_full_or_eof(r, &mut header).await? {
        return Ok(None);
    }

    let header_str = std::str::from_utf8(&header)
        .map_err(|_| PktLineError::BadLength(format!("{header:?}")))?;
    let len = u16::from_str_radix(header_str, 16)
        .map_err(|_| PktLineError::BadLength(header_str.to_string()))? as usize;

    if len == 0 {
        return Ok(Some(Packet::Flush));
    }
    if len < 4 {
        return Err(PktLineError::BadLength(header_str.to_string()));
    }

    let mut payload = vec![0u8; len - 4];
    r.read_exact(&mut payload).await?;
    Ok(Some(Packet::Data(payload)))
}

/// Append `payload` framed as a pkt-line to `out`.
pub fn write_packet(out: &mut Vec<u8>, payload: &[u8]) -> Result<(), PktLineError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(PktLineError::Oversize(payload.len()));
    }
    out.extend_from_slice(format!("{:04x}", payload.len() + 4).as_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Append the flush marker to `out`.
pub fn write_flush(out: &mut Vec<u8>) {
    out.extend_from_slice(FLUSH);
}

/// Fill `buf` completely. `Ok(false)` when the stream ends before the first
/// byte; an end mid-buffer surfaces as `UnexpectedEof`.
async fn read_full_or_eof<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse_one(data: &[u8]) -> Result<Option<Packet>, PktLineError> {
        let mut r = data;
        read_packet(&mut r).await
    }

    #[tokio::test]
    async fn test_round_trip() {
        for payload in [&b""[..], b"want deadbeef\n", &[0u8, 1, 2, 255]] {
            let mut framed = Vec::new();
            write_packet(&mut framed, payload).unwrap();
            let got = parse_one(&framed).await.unwrap().unwrap();
            assert_eq!(got, Packet::Data(payload.to_vec()));
        }
    }

    #[tokio::test]
    async fn test_round_trip_max_payload() {
        let payload = vec![0xabu8; MAX_PAYLOAD];
        let mut framed = Vec::new();
        write_packet(&mut framed, &payload).unwrap();
        let got = parse_one(&framed).await.unwrap().unwrap();
        assert_eq!(got, Packet::Data(payload));
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let mut out = Vec::new();
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            write_packet(&mut out, &payload),
            Err(PktLineError::Oversize(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_parses_to_marker() {
        assert_eq!(parse_one(b"0000").await.unwrap(), Some(Packet::Flush));
    }

    #[tokio::test]
    async fn test_eof_at_boundary() {
        assert_eq!(parse_one(b"").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eof_inside_header() {
        assert!(matches!(
            parse_one(b"00").await,
            Err(PktLineError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_payload() {
        assert!(matches!(
            parse_one(b"0009don").await,
            Err(PktLineError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn test_garbage_header() {
        assert!(matches!(
            parse_one(b"zzzzabcd").await,
            Err(PktLineError::BadLength(_))
        ));
        assert!(matches!(
            parse_one(b"0002ab").await,
            Err(PktLineError::BadLength(_))
        ));
    }

    #[tokio::test]
    async fn test_uppercase_hex_accepted() {
        // 0x000A = 10: header + 6 payload bytes.
        assert_eq!(
            parse_one(b"000Aabcdef").await.unwrap(),
            Some(Packet::Data(b"abcdef".to_vec()))
        );
    }
}
