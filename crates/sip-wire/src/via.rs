// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `Via` header handling (RFC 3261 §20.42).
//!
//! The top `Via` decides where a stateless proxy sends a response, so this
//! parser keeps the sent-by host/port and the `branch`/`received` parameters
//! accessible without interpreting anything else.

use std::fmt;

use smol_str::SmolStr;

use crate::Proto;

/// Parsed `Via` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: SmolStr,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl Via {
    /// Parses `SIP/2.0/UDP host[:port];param[=value]...`.
    pub fn parse(input: &str) -> Option<Self> {
        let mut parts = input.trim().split(';');
        let head = parts.next()?.trim();

        let (proto_part, sent_by) = head.split_once(char::is_whitespace)?;
        let transport = proto_part.rsplit('/').next()?.trim();
        if transport.is_empty() {
            return None;
        }

        let sent_by = sent_by.trim();
        let (host, port) = if let Some(rest) = sent_by.strip_prefix('[') {
            let close = rest.find(']')?;
            let host = &rest[..close];
            let port = rest[close + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok());
            (host, port)
        } else {
            match sent_by.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() => (host, port.parse().ok()),
                _ => (sent_by, None),
            }
        };
        if host.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        for param in parts {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            match param.split_once('=') {
                Some((k, v)) => params.push((
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim())),
                )),
                None => params.push((SmolStr::new(param.to_ascii_lowercase()), None)),
            }
        }

        Some(Self {
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            host: SmolStr::new(host.to_ascii_lowercase()),
            port,
            params,
        })
    }

    /// Returns a parameter value by name, case-insensitively.
    pub fn param(&self, name: &str) -> Option<&SmolStr> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_ref())
    }

    /// Returns the `branch=` parameter.
    pub fn branch(&self) -> Option<&SmolStr> {
        self.param("branch")
    }

    /// Returns the `received=` parameter.
    pub fn received(&self) -> Option<&SmolStr> {
        self.param("received")
    }

    /// Returns the transport as a dispatcher protocol, if it is one we speak.
    pub fn proto(&self) -> Option<Proto> {
        Proto::parse(&self.transport)
    }

    /// Renders a fresh `Via` value for the given sent-by and branch.
    pub fn render(proto: Proto, host: &str, port: u16, branch: &str) -> String {
        format!("SIP/2.0/{} {}:{};branch={}", proto.via_transport(), host, port, branch)
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (k, v) in &self.params {
            match v {
                Some(v) => write!(f, ";{}={}", k, v)?,
                None => write!(f, ";{}", k)?,
            }
        }
        Ok(())
    }
}
