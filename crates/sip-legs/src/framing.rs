// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

/// Maximum size of SIP headers before \r\n\r\n (64 KB).
/// Protects against unbounded header growth from peers that never terminate
/// the header block.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Maximum body size accepted from Content-Length (10 MB).
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Maximum total buffer size before the session is closed (16 MB).
pub(crate) const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Splits buffered stream data into complete SIP messages using
/// Content-Length framing (RFC 3261 §18.3).
///
/// CRLF keep-alive pings between messages are discarded. Returns an error
/// when a size limit is exceeded; callers close the connection on error.
pub fn drain_frames(buf: &mut BytesMut) -> Result<Vec<Bytes>> {
    let mut frames = Vec::new();
    loop {
        consume_leading_crlf(buf);
        if buf.is_empty() {
            break;
        }

        let head_end = match memchr::memmem::find(buf.as_ref(), b"\r\n\r\n") {
            Some(pos) => pos,
            None => {
                if buf.len() > MAX_HEADER_SIZE {
                    return Err(anyhow!(
                        "SIP headers exceed {} bytes before terminator",
                        MAX_HEADER_SIZE
                    ));
                }
                break;
            }
        };
        if head_end > MAX_HEADER_SIZE {
            return Err(anyhow!("SIP headers are {} bytes, limit {}", head_end, MAX_HEADER_SIZE));
        }

        let body_length = match content_length(&buf[..head_end])? {
            Some(cl) if cl > MAX_BODY_SIZE => {
                return Err(anyhow!("Content-Length {} exceeds limit {}", cl, MAX_BODY_SIZE));
            }
            Some(cl) => cl,
            None => {
                // Mandatory on stream transports (RFC 3261 §18.3); tolerate
                // the violation with an empty body.
                warn!("stream message missing Content-Length; assuming empty body");
                0
            }
        };

        let needed = head_end + 4 + body_length;
        if buf.len() < needed {
            break;
        }
        frames.push(buf.split_to(needed).freeze());
    }
    Ok(frames)
}

fn consume_leading_crlf(buf: &mut BytesMut) {
    while buf.starts_with(b"\r\n") || buf.starts_with(b"\n") || buf.starts_with(b"\r") {
        let n = if buf.starts_with(b"\r\n") { 2 } else { 1 };
        buf.advance(n);
    }
}

/// Scans the header block for Content-Length (or its compact form `l`).
fn content_length(headers: &[u8]) -> Result<Option<usize>> {
    let mut found: Option<usize> = None;
    for line in headers.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = memchr::memchr(b':', line) else {
            continue;
        };
        let name = trim_ascii(&line[..colon]);
        if !eq_ignore_case(name, b"content-length") && !eq_ignore_case(name, b"l") {
            continue;
        }
        let value = trim_ascii(&line[colon + 1..]);
        let parsed = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| anyhow!("unparsable Content-Length"))?;
        match found {
            Some(existing) if existing != parsed => {
                return Err(anyhow!("conflicting Content-Length headers"));
            }
            _ => found = Some(parsed),
        }
    }
    Ok(found)
}

fn trim_ascii(input: &[u8]) -> &[u8] {
    let start = input
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(input.len());
    let end = input
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    &input[start..end]
}

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_multiple_frames_and_bodies() {
        let msg1 = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 4\r\n\r\nbody";
        let msg2 = b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n";
        let payload = [msg1.as_slice(), msg2.as_slice()].concat();
        let mut buf = BytesMut::from(&payload[..]);
        let frames = drain_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(buf.is_empty());
        assert_eq!(frames[0].as_ref(), msg1);
        assert_eq!(frames[1].as_ref(), msg2);
    }

    #[test]
    fn leaves_partial_body_buffered() {
        let payload = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 5\r\n\r\nhi";
        let mut buf = BytesMut::from(&payload[..]);
        let frames = drain_frames(&mut buf).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buf.len(), payload.len());
    }

    #[test]
    fn discards_crlf_keepalives() {
        let msg = b"\r\n\r\nOPTIONS sip:a SIP/2.0\r\nContent-Length: 0\r\n\r\n";
        let mut buf = BytesMut::from(&msg[..]);
        let frames = drain_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn compact_form_is_accepted() {
        let msg = b"OPTIONS sip:a SIP/2.0\r\nl: 2\r\n\r\nhi";
        let mut buf = BytesMut::from(&msg[..]);
        let frames = drain_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn conflicting_content_lengths_error() {
        let msg = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\nbody";
        let mut buf = BytesMut::from(&msg[..]);
        assert!(drain_frames(&mut buf).is_err());
    }

    #[test]
    fn oversized_headers_error() {
        let mut headers = String::from("OPTIONS sip:a SIP/2.0\r\nX-Pad: ");
        headers.push_str(&"A".repeat(70 * 1024));
        let mut buf = BytesMut::from(headers.as_bytes());
        assert!(drain_frames(&mut buf).is_err());
    }

    #[test]
    fn oversized_content_length_errors() {
        let msg = format!(
            "OPTIONS sip:a SIP/2.0\r\nContent-Length: {}\r\n\r\n",
            11 * 1024 * 1024
        );
        let mut buf = BytesMut::from(msg.as_bytes());
        assert!(drain_frames(&mut buf).is_err());
    }

    #[test]
    fn missing_content_length_assumes_empty_body() {
        let msg = b"OPTIONS sip:a SIP/2.0\r\nVia: SIP/2.0/TCP host\r\n\r\n";
        let mut buf = BytesMut::from(&msg[..]);
        let frames = drain_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
    }
}
