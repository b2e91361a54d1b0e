// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{parse, Headers, Method, Via, WireError};

/// First line of a SIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: SmolStr },
    Response { code: u16, reason: SmolStr },
}

/// A SIP message as the dispatcher sees it: start line, ordered headers, body.
///
/// Requests and responses share one type because the delivery queue, the
/// response cache and the forwarder all handle either; the start line is the
/// only place they differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub start: StartLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Packet {
    /// Builds a request packet.
    pub fn request(method: Method, uri: impl Into<SmolStr>, headers: Headers) -> Self {
        Self {
            start: StartLine::Request {
                method,
                uri: uri.into(),
            },
            headers,
            body: Bytes::new(),
        }
    }

    /// Builds a response packet.
    pub fn response(code: u16, reason: impl Into<SmolStr>, headers: Headers) -> Self {
        Self {
            start: StartLine::Response {
                code,
                reason: reason.into(),
            },
            headers,
            body: Bytes::new(),
        }
    }

    /// Parses a message from raw transport bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, WireError> {
        parse::parse_packet(raw)
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start, StartLine::Response { .. })
    }

    /// Request method; `None` for responses (see [`Packet::cseq`] for those).
    pub fn method(&self) -> Option<&Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    /// Response status code; `None` for requests.
    pub fn code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    /// Request-URI; `None` for responses.
    pub fn uri(&self) -> Option<&SmolStr> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    /// Replaces the Request-URI (Route processing rewrites it).
    pub fn set_uri(&mut self, uri: impl Into<SmolStr>) {
        if let StartLine::Request { uri: slot, .. } = &mut self.start {
            *slot = uri.into();
        }
    }

    /// Raw `CSeq` header value.
    pub fn cseq_raw(&self) -> Option<&SmolStr> {
        self.headers.get("CSeq")
    }

    /// Parsed `CSeq`: sequence number and method.
    pub fn cseq(&self) -> Option<(u32, Method)> {
        let raw = self.cseq_raw()?;
        let mut parts = raw.split_whitespace();
        let num = parts.next()?.parse().ok()?;
        let method = Method::from_token(parts.next()?);
        Some((num, method))
    }

    /// Method named in `CSeq`; for responses this identifies the transaction
    /// kind (a final response to INVITE retransmits, others do not).
    pub fn cseq_method(&self) -> Option<Method> {
        self.cseq().map(|(_, m)| m)
    }

    /// `Call-ID` header value.
    pub fn call_id(&self) -> Option<&SmolStr> {
        self.headers.get("Call-ID")
    }

    /// Parsed topmost `Via`, if any.
    pub fn top_via(&self) -> Option<Via> {
        Via::parse(self.headers.get("Via")?)
    }

    /// Removes and returns the topmost `Via`.
    pub fn pop_top_via(&mut self) -> Option<Via> {
        let value = self.headers.pop_first("Via")?;
        Via::parse(&value)
    }

    /// Stacks a new `Via` above any existing ones.
    pub fn prepend_via(&mut self, value: impl Into<SmolStr>) {
        self.headers.prepend("Via", value);
    }

    /// `branch=` parameter of the topmost `Via`.
    pub fn branch(&self) -> Option<SmolStr> {
        self.top_via()?.branch().cloned()
    }

    /// Transaction id: topmost `Via` branch plus the `CSeq` value.
    ///
    /// Correlates requests with responses and serves as the default
    /// cancellation key for queued deliveries.
    pub fn tid(&self) -> SmolStr {
        let branch = self.branch().unwrap_or_default();
        let cseq = self.cseq_raw().cloned().unwrap_or_default();
        SmolStr::new(format!("{}|{}", branch, cseq))
    }

    /// Response-cache key: `CSeq` and `Call-ID` joined with a NUL.
    pub fn cache_key(&self) -> SmolStr {
        let cseq = self.cseq_raw().map(|s| s.as_str()).unwrap_or_default();
        let call_id = self.call_id().map(|s| s.as_str()).unwrap_or_default();
        SmolStr::new(format!("{}\0{}", cseq, call_id))
    }

    /// Attaches a body and the matching `Content-Type`.
    pub fn set_body(&mut self, content_type: &str, body: Bytes) {
        self.headers.set("Content-Type", content_type);
        self.body = body;
    }

    /// Returns the body when it carries an SDP session description.
    pub fn sdp_body(&self) -> Option<&Bytes> {
        let ct = self.headers.get("Content-Type")?;
        if ct.trim().eq_ignore_ascii_case("application/sdp") && !self.body.is_empty() {
            Some(&self.body)
        } else {
            None
        }
    }

    /// Serialises the message, fixing `Content-Length` to the body size.
    pub fn dump(&self) -> String {
        let mut out = String::with_capacity(256 + self.body.len());
        match &self.start {
            StartLine::Request { method, uri } => {
                out.push_str(method.as_str());
                out.push(' ');
                out.push_str(uri);
                out.push_str(" SIP/2.0\r\n");
            }
            StartLine::Response { code, reason } => {
                out.push_str("SIP/2.0 ");
                out.push_str(&code.to_string());
                out.push(' ');
                out.push_str(reason);
                out.push_str("\r\n");
            }
        }
        for header in &self.headers {
            if header.name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.push_str(&header.name);
            out.push_str(": ");
            out.push_str(&header.value);
            out.push_str("\r\n");
        }
        out.push_str("Content-Length: ");
        out.push_str(&self.body.len().to_string());
        out.push_str("\r\n\r\n");
        if !self.body.is_empty() {
            // Body may be binary; dump() is only used where it is known text.
            out.push_str(&String::from_utf8_lossy(&self.body));
        }
        out
    }

    /// Serialises to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.dump().into_bytes())
    }
}
