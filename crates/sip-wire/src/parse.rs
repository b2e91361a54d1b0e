// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{Headers, Method, Packet, StartLine};

/// Headers larger than this are rejected outright; a routing element never
/// needs more, and unbounded header blocks are a memory-exhaustion vector.
const MAX_HEADER_BLOCK: usize = 64 * 1024;

/// Errors produced while decoding a message from transport bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// No end-of-headers marker inside the size limit.
    Truncated,
    /// Header block exceeds [`MAX_HEADER_BLOCK`].
    HeadersTooLarge { max: usize },
    /// Malformed request or status line.
    BadStartLine(String),
    /// Header line without a colon.
    BadHeader(String),
    /// Status code outside the SIP range 100-699.
    BadStatusCode(u16),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated => write!(f, "message truncated before end of headers"),
            WireError::HeadersTooLarge { max } => {
                write!(f, "header block exceeds {} bytes", max)
            }
            WireError::BadStartLine(line) => write!(f, "malformed start line: {:?}", line),
            WireError::BadHeader(line) => write!(f, "malformed header line: {:?}", line),
            WireError::BadStatusCode(code) => {
                write!(f, "status code {} outside 100-699", code)
            }
        }
    }
}

impl std::error::Error for WireError {}

/// Decodes one SIP message from a datagram or a framed stream chunk.
pub(crate) fn parse_packet(raw: &[u8]) -> Result<Packet, WireError> {
    let head_end = match memchr::memmem::find(raw, b"\r\n\r\n") {
        Some(pos) => pos,
        None => {
            if raw.len() > MAX_HEADER_BLOCK {
                return Err(WireError::HeadersTooLarge {
                    max: MAX_HEADER_BLOCK,
                });
            }
            return Err(WireError::Truncated);
        }
    };
    if head_end > MAX_HEADER_BLOCK {
        return Err(WireError::HeadersTooLarge {
            max: MAX_HEADER_BLOCK,
        });
    }

    let head = String::from_utf8_lossy(&raw[..head_end]);
    let mut lines = head.split("\r\n");
    let start_line = lines
        .next()
        .ok_or_else(|| WireError::BadStartLine(String::new()))?;
    let start = parse_start_line(start_line)?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        // Folded continuation lines are obsolete (RFC 3261 §7.3.1); a
        // routing element can safely ignore them.
        if line.starts_with(' ') || line.starts_with('\t') {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WireError::BadHeader(line.to_owned()))?;
        headers.push(SmolStr::new(name.trim()), SmolStr::new(value.trim()));
    }

    let mut body = &raw[head_end + 4..];
    if let Some(cl) = headers
        .get("Content-Length")
        .or_else(|| headers.get("l"))
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        if cl <= body.len() {
            body = &body[..cl];
        }
    }

    Ok(Packet {
        start,
        headers,
        body: Bytes::copy_from_slice(body),
    })
}

fn parse_start_line(line: &str) -> Result<StartLine, WireError> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let mut parts = rest.splitn(2, ' ');
        let code: u16 = parts
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| WireError::BadStartLine(line.to_owned()))?;
        if !(100..=699).contains(&code) {
            return Err(WireError::BadStatusCode(code));
        }
        let reason = parts.next().unwrap_or("").trim();
        return Ok(StartLine::Response {
            code,
            reason: SmolStr::new(reason),
        });
    }

    let mut parts = line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) => (m, u, v),
        _ => return Err(WireError::BadStartLine(line.to_owned())),
    };
    if !version.eq_ignore_ascii_case("SIP/2.0") {
        return Err(WireError::BadStartLine(line.to_owned()));
    }
    Ok(StartLine::Request {
        method: Method::from_token(method),
        uri: SmolStr::new(uri),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_body() {
        let raw = b"INVITE sip:bob@example.com SIP/2.0\r\n\
                    Via: SIP/2.0/UDP a;branch=z9hG4bK1\r\n\
                    CSeq: 1 INVITE\r\n\
                    Call-ID: c1\r\n\
                    Content-Length: 4\r\n\r\nbody";
        let packet = parse_packet(raw).unwrap();
        assert!(packet.is_request());
        assert_eq!(packet.method(), Some(&Method::Invite));
        assert_eq!(packet.body.as_ref(), b"body");
    }

    #[test]
    fn parses_response() {
        let raw = b"SIP/2.0 200 OK\r\nCSeq: 2 BYE\r\n\r\n";
        let packet = parse_packet(raw).unwrap();
        assert_eq!(packet.code(), Some(200));
        assert_eq!(packet.cseq_method(), Some(Method::Bye));
    }

    #[test]
    fn content_length_bounds_body() {
        let raw = b"SIP/2.0 200 OK\r\nContent-Length: 2\r\n\r\nabcd";
        let packet = parse_packet(raw).unwrap();
        assert_eq!(packet.body.as_ref(), b"ab");
    }

    #[test]
    fn truncated_message_is_rejected() {
        let raw = b"INVITE sip:a SIP/2.0\r\nCSeq: 1 INVITE\r\n";
        assert_eq!(parse_packet(raw), Err(WireError::Truncated));
    }

    #[test]
    fn garbage_start_line_is_rejected() {
        let raw = b"NOT A SIP LINE\r\n\r\n";
        assert!(matches!(
            parse_packet(raw),
            Err(WireError::BadStartLine(_))
        ));
    }

    #[test]
    fn status_code_range_is_enforced() {
        let raw = b"SIP/2.0 99 Too Low\r\n\r\n";
        assert_eq!(parse_packet(raw), Err(WireError::BadStatusCode(99)));
    }

    #[test]
    fn compact_content_length_is_honoured() {
        let raw = b"SIP/2.0 200 OK\r\nl: 3\r\n\r\nabcdef";
        let packet = parse_packet(raw).unwrap();
        assert_eq!(packet.body.as_ref(), b"abc");
    }
}
